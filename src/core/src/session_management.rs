//! Session engine.
//!
//! This module provides the bridged [`session::Session`], the channel ends it joins, the
//! command segmentation applied to backend traffic and the registry of live sessions.

use serde::{Deserialize, Serialize};

/// Channel ends joined by a session.
pub mod endpoint;
/// Command segmentation of interactive traffic.
pub mod segmenter;
/// The bridged session itself.
pub mod session;
/// Registry of live sessions and its monitor.
pub mod session_manager;

pub use endpoint::{Client, Endpoint, Server};
pub use segmenter::{Segment, Segmenter};
pub use session::{Session, SessionSnapshot};
pub use session_manager::SessionManager;

/// Lifecycle of a session.
///
/// Variants:
/// - `Created`: built, not bridged yet
/// - `Bridging`: the bridge loop is running
/// - `Closed`: terminal; no data is forwarded anymore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Bridging,
    Closed,
}
