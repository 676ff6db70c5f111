//! Records produced while a session is bridged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One operator command paired with the output it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// The related session identifier
    pub session: Uuid,
    /// Operator identity, empty when the session has none
    pub user: String,
    /// Hostname of the asset the command ran on
    pub asset: String,
    /// Backend credential the command ran as
    pub system_user: String,
    /// Cleaned command line, prompt removed
    pub input: String,
    /// Rendered output of the command
    pub output: String,
    pub timestamp: DateTime<Utc>,
}

/// One chunk of backend output, kept for time-accurate playback.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEvent {
    pub session: Uuid,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl ReplayEvent {
    pub fn new(session: Uuid, data: &[u8]) -> Self {
        Self {
            session,
            data: data.to_vec(),
            timestamp: Utc::now(),
        }
    }
}
