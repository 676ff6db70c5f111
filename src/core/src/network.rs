pub mod channel;
pub mod connector;
pub mod dispatcher;
pub mod handshake;
pub mod host_key;
pub mod network_listener;
pub mod request;
