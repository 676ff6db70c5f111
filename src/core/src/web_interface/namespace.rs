use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::types::{Inbound, Outbound};
use super::ws_bridge::{SignalSink, WsProxy};
use crate::authorization::{Asset, SystemUser, User};
use crate::error_handling::types::ResolveError;
use crate::network::dispatcher::Dispatcher;
use crate::network::request::{LoginFrom, Request};
use crate::session_management::{Client, Endpoint};

struct Room {
    proxy: Arc<WsProxy>,
    task: JoinHandle<()>,
}

/// Signaling state of one browser connection.
///
/// A browser may open several rooms on the same websocket, each of them bridged to its own
/// backend session.
pub struct ProxyNamespace {
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    rooms: Mutex<HashMap<String, Room>>,
}

impl ProxyNamespace {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            addr,
            outbound,
            rooms: Mutex::new(HashMap::new()),
        })
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub async fn handle(self: &Arc<Self>, message: Inbound) {
        match message {
            Inbound::Host {
                uuid,
                userid,
                secret,
            } => self.on_host(&userid, &uuid, secret),
            Inbound::Token { token, secret } => self.on_token(&token, secret),
            Inbound::Data { data, room } => self.on_data(&room, &data).await,
            Inbound::Logout { room } => self.on_logout(&room).await,
        }
    }

    fn on_host(self: &Arc<Self>, userid: &str, selector: &str, secret: Option<String>) {
        let room = self.allocate_room(secret);
        let resolver = self.dispatcher.resolver();
        let resolved = resolver.authenticate(userid).and_then(|user| {
            let (asset, system_user) = resolver.resolve(&user, selector)?;
            Ok((user, asset, system_user))
        });
        self.open_room(room, resolved);
    }

    fn on_token(self: &Arc<Self>, token: &str, secret: Option<String>) {
        let room = self.allocate_room(secret);
        let resolved = self.dispatcher.resolver().resolve_token(token);
        self.open_room(room, resolved);
    }

    fn allocate_room(&self, secret: Option<String>) -> String {
        let room = Uuid::new_v4().to_string();
        self.signal(Outbound::Room {
            room: room.clone(),
            secret,
        });
        room
    }

    fn open_room(
        self: &Arc<Self>,
        room: String,
        resolved: Result<(User, Asset, SystemUser), ResolveError>,
    ) {
        let (user, asset, system_user) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Browser {} refused: {}", self.addr, e);
                self.signal(Outbound::Data {
                    data: format!("{}\r\n", e),
                    room: room.clone(),
                });
                self.signal(Outbound::Logout { room });
                return;
            }
        };

        let (proxy, handed) = WsProxy::new(&room, self.clone());
        let mut request = Request::new(self.addr, LoginFrom::Web);
        request.user = Some(user);
        let client = Arc::new(Client::new(Box::new(handed), Arc::new(request)));

        info!("Room {}: {} to {}", room, client, asset);
        let dispatcher = self.dispatcher.clone();
        // registered before the bridge can end and log the room out
        let mut rooms = self.rooms();
        let task = tokio::spawn(async move {
            if let Err(e) = dispatcher.proxy(client.clone(), asset, system_user).await {
                warn!("Session for {} ended with: {}", client, e);
            }
            client.close().await;
        });
        rooms.insert(
            room,
            Room {
                proxy: Arc::new(proxy),
                task,
            },
        );
    }

    async fn on_data(&self, room: &str, data: &str) {
        let proxy = self.rooms().get(room).map(|entry| entry.proxy.clone());
        let Some(proxy) = proxy else {
            debug!("Data for unknown room {} dropped", room);
            return;
        };
        if let Err(e) = proxy.send(data).await {
            debug!("Room {} write failed: {}", room, e);
        }
    }

    async fn on_logout(&self, room: &str) {
        let entry = self.rooms().remove(room);
        if let Some(entry) = entry {
            debug!("Browser {} leaves room {}", self.addr, room);
            entry.proxy.close().await;
        }
    }

    /// Closes every room; their sessions end as if the browser hung up.
    pub async fn shutdown(&self) {
        let rooms: Vec<Room> = self.rooms().drain().map(|(_, room)| room).collect();
        for room in rooms {
            room.proxy.close().await;
            if !room.task.is_finished() {
                debug!("Room {} still bridging at shutdown", room.proxy.room());
            }
        }
    }

    fn signal(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            debug!("Browser {} gone, message dropped", self.addr);
        }
    }
}

impl SignalSink for ProxyNamespace {
    fn emit(&self, message: Outbound) {
        self.signal(message);
    }

    fn logout(&self, room: &str) {
        let entry = self.rooms().remove(room);
        drop(entry);
        self.signal(Outbound::Logout {
            room: room.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::StaticInventory;
    use crate::configuration::{AssetConfig, TokenConfig};
    use crate::data_capture::{NullRecorder, ScreenParser};
    use crate::error_handling::types::NetworkError;
    use crate::network::channel::BackendChannel;
    use crate::network::connector::AssetConnector;
    use crate::network::dispatcher::SegmentationSettings;
    use crate::network::request::TermSize;
    use crate::session_management::SessionManager;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const WAIT: Duration = Duration::from_secs(3);

    struct MemoryConnector(mpsc::UnboundedSender<DuplexStream>);

    #[async_trait]
    impl AssetConnector for MemoryConnector {
        async fn connect(
            &self,
            _asset: &Asset,
            _system_user: &SystemUser,
            _size: TermSize,
        ) -> Result<BackendChannel, NetworkError> {
            let (ours, theirs) = duplex(4096);
            let _ = self.0.send(theirs);
            Ok(BackendChannel::new(Box::new(ours)))
        }
    }

    struct Fixture {
        namespace: Arc<ProxyNamespace>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        backends: mpsc::UnboundedReceiver<DuplexStream>,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let (backend_tx, backends) = mpsc::unbounded_channel();
        let inventory = StaticInventory::new(
            vec![AssetConfig {
                hostname: "web01".into(),
                ip: "10.0.0.5".into(),
                port: 22,
                system_user: "root".into(),
                allowed_users: vec!["alice".into()],
            }],
            vec![TokenConfig {
                token: "t-123".into(),
                user: "alice".into(),
                asset: "web01".into(),
            }],
        );
        let dispatcher = Dispatcher::new(
            Arc::new(inventory),
            Arc::new(MemoryConnector(backend_tx)),
            Arc::new(SessionManager::new(10, Duration::from_secs(5))),
            Arc::new(NullRecorder),
            Arc::new(NullRecorder),
            SegmentationSettings {
                parser: Arc::new(ScreenParser::new().unwrap()),
                submit_markers: vec![b"\r".to_vec()],
                rz_marker: None,
                buffer_budget: 1024,
            },
        );
        let (tx, outbound) = mpsc::unbounded_channel();
        let namespace = ProxyNamespace::new(
            Arc::new(dispatcher),
            "192.168.1.20:51000".parse().unwrap(),
            tx,
        );
        Fixture {
            namespace,
            outbound,
            backends,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn room_of(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
        match next(rx).await {
            Outbound::Room { room, .. } => room,
            other => panic!("expected a room, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_host_room_bridges_browser_and_backend() {
        let mut f = fixture();
        f.namespace
            .handle(Inbound::Host {
                uuid: "web01".into(),
                userid: "alice".into(),
                secret: Some("s1".into()),
            })
            .await;

        let room = match next(&mut f.outbound).await {
            Outbound::Room { room, secret } => {
                assert_eq!(secret.as_deref(), Some("s1"));
                room
            }
            other => panic!("expected a room, got {:?}", other),
        };
        assert_eq!(f.namespace.room_count(), 1);

        let mut backend = tokio::time::timeout(WAIT, f.backends.recv())
            .await
            .unwrap()
            .unwrap();
        backend.write_all(b"$ ").await.unwrap();
        assert_eq!(
            next(&mut f.outbound).await,
            Outbound::Data {
                data: "$ ".into(),
                room: room.clone()
            }
        );

        f.namespace
            .handle(Inbound::Data {
                data: "uptime\r".into(),
                room: room.clone(),
            })
            .await;
        let mut buf = [0u8; 7];
        tokio::time::timeout(WAIT, backend.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"uptime\r");

        // the backend leaving ends the session and the room
        drop(backend);
        assert_eq!(next(&mut f.outbound).await, Outbound::Logout { room });
        assert_eq!(f.namespace.room_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_host_logs_out_the_room() {
        let mut f = fixture();
        f.namespace
            .handle(Inbound::Host {
                uuid: "web01".into(),
                userid: "mallory".into(),
                secret: None,
            })
            .await;

        let room = room_of(&mut f.outbound).await;
        assert_eq!(
            next(&mut f.outbound).await,
            Outbound::Data {
                data: "Unknown user: mallory\r\n".into(),
                room: room.clone()
            }
        );
        assert_eq!(next(&mut f.outbound).await, Outbound::Logout { room });
        assert_eq!(f.namespace.room_count(), 0);
    }

    #[tokio::test]
    async fn test_token_room_and_browser_logout() {
        let mut f = fixture();
        f.namespace
            .handle(Inbound::Token {
                token: "t-123".into(),
                secret: None,
            })
            .await;
        let room = room_of(&mut f.outbound).await;
        let mut backend = tokio::time::timeout(WAIT, f.backends.recv())
            .await
            .unwrap()
            .unwrap();

        f.namespace.handle(Inbound::Logout { room }).await;
        assert_eq!(f.namespace.room_count(), 0);

        // the backend side is closed once the session notices the browser left
        let mut rest = Vec::new();
        tokio::time::timeout(WAIT, backend.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_token_and_unknown_room() {
        let mut f = fixture();
        f.namespace
            .handle(Inbound::Token {
                token: "nope".into(),
                secret: None,
            })
            .await;
        let room = room_of(&mut f.outbound).await;
        assert_eq!(
            next(&mut f.outbound).await,
            Outbound::Data {
                data: "Invalid or expired token\r\n".into(),
                room
            }
        );

        f.namespace
            .handle(Inbound::Data {
                data: "ls".into(),
                room: "missing".into(),
            })
            .await;
        f.namespace.shutdown().await;
        assert_eq!(f.namespace.room_count(), 0);
    }
}
