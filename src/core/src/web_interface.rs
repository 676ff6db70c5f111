//! Browser facing side: a small JSON API over the session registry and the `/ssh`
//! websocket that tunnels terminal rooms.

pub mod namespace;
pub mod routes;
pub mod types;
pub mod web_server;
pub mod ws_bridge;

pub use namespace::ProxyNamespace;
pub use types::{ApiError, Inbound, Outbound};
pub use web_server::WebServer;
pub use ws_bridge::{SignalSink, WsProxy};
