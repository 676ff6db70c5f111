//! Byte channel abstractions shared by operator connections and backend connections.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream the engine can bridge.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedChannel = Box<dyn Channel>;

/// Terminal control exposed by a backend connection, when it has one.
pub trait PtyControl: Send + Sync {
    fn resize(&self, width: u16, height: u16) -> io::Result<()>;
}

/// An opened backend connection.
pub struct BackendChannel {
    pub channel: BoxedChannel,
    pub control: Option<Box<dyn PtyControl>>,
}

impl BackendChannel {
    pub fn new(channel: BoxedChannel) -> Self {
        Self {
            channel,
            control: None,
        }
    }

    pub fn with_control(mut self, control: Box<dyn PtyControl>) -> Self {
        self.control = Some(control);
        self
    }
}

/// Process-wide identity of a channel endpoint.
///
/// Used where a file descriptor would be: registration checks and reader origin tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
