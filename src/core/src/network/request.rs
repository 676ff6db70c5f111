use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use uuid::Uuid;

use crate::authorization::User;

/// A channel capability asked for during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Pty,
    Shell,
    Env,
    Exec(String),
    Subsystem(String),
    Watch(Uuid),
    Join(Uuid),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Pty => write!(f, "pty"),
            Capability::Shell => write!(f, "shell"),
            Capability::Env => write!(f, "env"),
            Capability::Exec(_) => write!(f, "exec"),
            Capability::Subsystem(name) => write!(f, "subsystem:{}", name),
            Capability::Watch(_) => write!(f, "watch"),
            Capability::Join(_) => write!(f, "join"),
        }
    }
}

/// Front a request came in through, reported as `login_from` in session listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoginFrom {
    #[serde(rename = "ST")]
    Terminal,
    #[serde(rename = "WT")]
    Web,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TermSize {
    pub width: u16,
    pub height: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Per-connection negotiation record.
///
/// Filled while the channel is being negotiated, then shared read-only with the session
/// engine. Only the terminal size changes afterwards.
#[derive(Debug)]
pub struct Request {
    pub addr: SocketAddr,
    pub login_from: LoginFrom,
    pub capabilities: Vec<Capability>,
    pub term: String,
    pub env: HashMap<String, String>,
    pub user: Option<User>,
    /// Asset selector given with the shell request
    pub target: Option<String>,
    pub date_start: DateTime<Utc>,
    size: Mutex<TermSize>,
}

impl Request {
    pub fn new(addr: SocketAddr, login_from: LoginFrom) -> Self {
        Self {
            addr,
            login_from,
            capabilities: Vec::new(),
            term: String::from("xterm"),
            env: HashMap::new(),
            user: None,
            target: None,
            date_start: Utc::now(),
            size: Mutex::new(TermSize::default()),
        }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn add_capability(&mut self, capability: Capability) {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
    }

    /// Interactive sessions need a pseudo terminal.
    pub fn is_interactive(&self) -> bool {
        self.capabilities.contains(&Capability::Pty)
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.capabilities.iter().find_map(|c| match c {
            Capability::Subsystem(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn watch_target(&self) -> Option<Uuid> {
        self.capabilities.iter().find_map(|c| match c {
            Capability::Watch(id) => Some(*id),
            _ => None,
        })
    }

    pub fn join_target(&self) -> Option<Uuid> {
        self.capabilities.iter().find_map(|c| match c {
            Capability::Join(id) => Some(*id),
            _ => None,
        })
    }

    /// Comma separated capability names, used in refusal messages.
    pub fn kinds(&self) -> String {
        self.capabilities
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn size(&self) -> TermSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_size(&self, width: u16, height: u16) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = TermSize { width, height };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new("192.168.1.20:40022".parse().unwrap(), LoginFrom::Terminal)
    }

    #[test]
    fn test_capabilities() {
        let mut req = request();
        assert!(!req.is_interactive());

        req.add_capability(Capability::Pty);
        req.add_capability(Capability::Pty);
        req.add_capability(Capability::Shell);
        assert!(req.is_interactive());
        assert_eq!(req.capabilities.len(), 2);
        assert_eq!(req.kinds(), "pty,shell");
        assert_eq!(req.subsystem(), None);
    }

    #[test]
    fn test_targets() {
        let mut req = request();
        let id = Uuid::new_v4();
        req.add_capability(Capability::Watch(id));
        req.add_capability(Capability::Subsystem("sftp".into()));

        assert_eq!(req.watch_target(), Some(id));
        assert_eq!(req.join_target(), None);
        assert_eq!(req.subsystem(), Some("sftp"));
        assert_eq!(req.remote_ip().to_string(), "192.168.1.20");
    }

    #[test]
    fn test_size() {
        let req = request();
        assert_eq!(req.size(), TermSize { width: 80, height: 24 });
        req.set_size(120, 40);
        assert_eq!(req.size().width, 120);
    }
}
