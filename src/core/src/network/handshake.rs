//! Line oriented channel negotiation.
//!
//! After the greeting the operator sends one command per line until a channel is opened:
//!
//! ```text
//! auth <user>
//! pty [term] [width] [height]
//! env <name> <value>
//! shell [asset]          opens an interactive channel
//! exec <command>         opens a command channel
//! subsystem <name>       opens a subsystem channel
//! watch <session-id>     observes a live session
//! join <session-id>      shares a live session
//! ```
//!
//! Every accepted line is answered with `ok`, refused ones with a one-line reason.

use log::{debug, trace};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::request::{Capability, Request};
use crate::authorization::AssetResolver;
use crate::error_handling::types::NetworkError;

pub const PROTOCOL_VERSION: &str = "SAS-1.0";
const MAX_LINE: usize = 1024;

pub struct LineHandshake {
    name: String,
    fingerprint: String,
    resolver: Arc<dyn AssetResolver>,
}

async fn read_line<S>(stream: &mut S) -> Result<String, NetworkError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = match stream.read_u8().await {
            Ok(byte) => byte,
            Err(_) => return Err(NetworkError::ConnectionClosed),
        };
        match byte {
            b'\n' => break,
            b'\r' => continue,
            _ => line.push(byte),
        }
        if line.len() > MAX_LINE {
            return Err(NetworkError::HandshakeFailed("line too long".into()));
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

async fn reply<S>(stream: &mut S, text: &str) -> Result<(), NetworkError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
        .map_err(|_| NetworkError::ConnectionClosed)
}

impl LineHandshake {
    pub fn new(name: &str, fingerprint: &str, resolver: Arc<dyn AssetResolver>) -> Self {
        Self {
            name: name.to_string(),
            fingerprint: fingerprint.to_string(),
            resolver,
        }
    }

    pub fn greeting(&self) -> String {
        format!(
            "{} {} host-key-sha256:{}",
            self.name, PROTOCOL_VERSION, self.fingerprint
        )
    }

    /// Negotiates until a channel is requested, filling `request` along the way.
    ///
    /// # Errors
    ///
    /// - [`NetworkError::ConnectionClosed`] when the peer leaves before opening a channel
    /// - [`NetworkError::HandshakeFailed`] on refused authentication or an oversized line
    pub async fn negotiate<S>(&self, stream: &mut S, request: &mut Request) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        reply(stream, &self.greeting()).await?;

        loop {
            let line = read_line(stream).await?;
            trace!("{} negotiation line: {:?}", request.addr, line);
            let mut words = line.split_whitespace();
            let Some(command) = words.next() else {
                continue;
            };
            let args: Vec<&str> = words.collect();

            match command {
                "auth" => {
                    let username = args.first().copied().unwrap_or_default();
                    match self.resolver.authenticate(username) {
                        Ok(user) => {
                            debug!("{} authenticated as {}", request.addr, user);
                            request.user = Some(user);
                            reply(stream, "ok").await?;
                        }
                        Err(e) => {
                            reply(stream, &format!("denied: {}", e)).await?;
                            return Err(NetworkError::HandshakeFailed(e.to_string()));
                        }
                    }
                }
                "pty" => {
                    if let Some(term) = args.first() {
                        request.term = term.to_string();
                    }
                    let width = args.get(1).and_then(|w| w.parse().ok()).unwrap_or(80);
                    let height = args.get(2).and_then(|h| h.parse().ok()).unwrap_or(24);
                    request.set_size(width, height);
                    request.add_capability(Capability::Pty);
                    reply(stream, "ok").await?;
                }
                "env" => match args.as_slice() {
                    [name, value, ..] => {
                        request.env.insert(name.to_string(), value.to_string());
                        request.add_capability(Capability::Env);
                        reply(stream, "ok").await?;
                    }
                    _ => reply(stream, "usage: env <name> <value>").await?,
                },
                "shell" | "exec" | "subsystem" | "watch" | "join" => {
                    if request.user.is_none() {
                        reply(stream, "auth required").await?;
                        continue;
                    }
                    let capability = match (command, args.first()) {
                        ("shell", target) => {
                            request.target = target.map(|t| t.to_string());
                            Capability::Shell
                        }
                        ("exec", Some(_)) => Capability::Exec(args.join(" ")),
                        ("subsystem", Some(name)) => Capability::Subsystem(name.to_string()),
                        ("watch", Some(id)) | ("join", Some(id)) => match Uuid::parse_str(id) {
                            Ok(id) if command == "watch" => Capability::Watch(id),
                            Ok(id) => Capability::Join(id),
                            Err(_) => {
                                reply(stream, "bad session id").await?;
                                continue;
                            }
                        },
                        _ => {
                            reply(stream, &format!("usage: {} <argument>", command)).await?;
                            continue;
                        }
                    };
                    request.add_capability(capability);
                    reply(stream, "ok").await?;
                    return Ok(());
                }
                other => reply(stream, &format!("unsupported: {}", other)).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::StaticInventory;
    use crate::configuration::AssetConfig;
    use crate::network::request::LoginFrom;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    fn handshake() -> LineHandshake {
        let inventory = StaticInventory::new(
            vec![AssetConfig {
                hostname: "web01".into(),
                ip: "10.0.0.5".into(),
                port: 22,
                system_user: "root".into(),
                allowed_users: vec!["alice".into()],
            }],
            vec![],
        );
        LineHandshake::new("sas", "abcd", Arc::new(inventory))
    }

    fn request() -> Request {
        Request::new("10.9.9.9:1234".parse().unwrap(), LoginFrom::Terminal)
    }

    /// Runs the negotiation against `script` and returns the replies.
    async fn run(script: &str) -> (Result<(), NetworkError>, Request, Vec<String>) {
        let (mut ours, theirs) = duplex(4096);
        let (read_half, mut write_half) = tokio::io::split(theirs);
        write_half.write_all(script.as_bytes()).await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut req = request();
        let result = handshake().negotiate(&mut ours, &mut req).await;
        drop(ours);

        let mut replies = Vec::new();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            replies.push(line.trim_end().to_string());
        }
        (result, req, replies)
    }

    #[tokio::test]
    async fn test_interactive_negotiation() {
        let (result, req, replies) =
            run("auth alice\r\nenv LANG C.UTF-8\npty xterm-256color 120 40\nshell web01\n").await;

        assert!(result.is_ok());
        assert_eq!(replies[0], "sas SAS-1.0 host-key-sha256:abcd");
        assert_eq!(&replies[1..], &["ok", "ok", "ok", "ok"]);
        assert_eq!(req.user.as_ref().unwrap().username, "alice");
        assert!(req.is_interactive());
        assert!(req.capabilities.contains(&Capability::Shell));
        assert_eq!(req.term, "xterm-256color");
        assert_eq!(req.size().width, 120);
        assert_eq!(req.size().height, 40);
        assert_eq!(req.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(req.target.as_deref(), Some("web01"));
    }

    #[tokio::test]
    async fn test_channel_requires_auth() {
        let (result, req, replies) = run("shell\nfoo\n").await;

        assert!(matches!(result, Err(NetworkError::ConnectionClosed)));
        assert_eq!(replies[1], "auth required");
        assert_eq!(replies[2], "unsupported: foo");
        assert!(req.capabilities.is_empty());
    }

    #[tokio::test]
    async fn test_denied_user() {
        let (result, req, replies) = run("auth mallory\n").await;

        assert!(matches!(result, Err(NetworkError::HandshakeFailed(_))));
        assert!(replies[1].starts_with("denied"));
        assert!(req.user.is_none());
    }

    #[tokio::test]
    async fn test_watch_and_subsystem() {
        let id = Uuid::new_v4();
        let (result, req, _) = run(&format!("auth alice\nwatch nope\nwatch {}\n", id)).await;
        assert!(result.is_ok());
        assert_eq!(req.watch_target(), Some(id));

        let (result, req, _) = run("auth alice\nsubsystem sftp\n").await;
        assert!(result.is_ok());
        assert_eq!(req.subsystem(), Some("sftp"));
        assert!(!req.is_interactive());
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let long = format!("{}\n", "a".repeat(2000));
        let (result, _, _) = run(&long).await;
        assert!(matches!(result, Err(NetworkError::HandshakeFailed(_))));
    }
}
