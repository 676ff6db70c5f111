use serde::{Deserialize, Serialize};

/// Messages a browser operator sends over `/ssh`.
///
/// On the wire: `{"event": "host", "payload": {"uuid": "...", "userid": "...", "secret": "..."}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum Inbound {
    /// Opens a room on the asset `uuid` for the user `userid`.
    Host {
        #[serde(default)]
        uuid: String,
        #[serde(default)]
        userid: String,
        #[serde(default)]
        secret: Option<String>,
    },
    /// Opens a room from a pre-issued token.
    Token {
        token: String,
        #[serde(default)]
        secret: Option<String>,
    },
    /// Keystrokes for a room.
    Data { data: String, room: String },
    Logout { room: String },
}

/// Messages sent back to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum Outbound {
    /// A room was allocated; `secret` echoes the one the browser sent.
    Room { room: String, secret: Option<String> },
    Data { data: String, room: String },
    Logout { room: String },
}

/// API error payload
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_envelopes() {
        let host: Inbound = serde_json::from_str(
            r#"{"event":"host","payload":{"uuid":"web01","userid":"alice","secret":"s3"}}"#,
        )
        .unwrap();
        assert_eq!(
            host,
            Inbound::Host {
                uuid: "web01".into(),
                userid: "alice".into(),
                secret: Some("s3".into()),
            }
        );

        let data: Inbound =
            serde_json::from_str(r#"{"event":"data","payload":{"data":"ls\r","room":"r1"}}"#)
                .unwrap();
        assert_eq!(
            data,
            Inbound::Data {
                data: "ls\r".into(),
                room: "r1".into()
            }
        );

        assert!(serde_json::from_str::<Inbound>(r#"{"event":"resize","payload":{}}"#).is_err());
    }

    #[test]
    fn test_outbound_envelope() {
        let json = serde_json::to_value(Outbound::Room {
            room: "r1".into(),
            secret: None,
        })
        .unwrap();
        assert_eq!(json["event"], "room");
        assert_eq!(json["payload"]["room"], "r1");
        assert!(json["payload"]["secret"].is_null());
    }
}
