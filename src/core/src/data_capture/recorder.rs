//! Recording seams.
//!
//! A bridged session talks to two recorders: one receiving the raw backend output for
//! playback and one receiving segmented commands. Both are bracketed per session by
//! `session_start` / `session_end`, called exactly once each and in that order.
//!
//! Recorders are invoked from the bridging task; an implementation doing slow I/O should
//! hand the work off (see [`QueuedCommandRecorder`](super::command_recorder::QueuedCommandRecorder)).

use uuid::Uuid;

use super::types::{CommandEvent, ReplayEvent};
use crate::error_handling::types::RecorderError;

pub trait ReplayRecorder: Send + Sync {
    fn session_start(&self, session: Uuid) -> Result<(), RecorderError>;
    fn record(&self, event: ReplayEvent) -> Result<(), RecorderError>;
    fn session_end(&self, session: Uuid) -> Result<(), RecorderError>;
}

pub trait CommandRecorder: Send + Sync {
    fn session_start(&self, session: Uuid) -> Result<(), RecorderError>;
    fn record(&self, event: CommandEvent) -> Result<(), RecorderError>;
    fn session_end(&self, session: Uuid) -> Result<(), RecorderError>;
}

/// Recorder that accepts everything and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl ReplayRecorder for NullRecorder {
    fn session_start(&self, _session: Uuid) -> Result<(), RecorderError> {
        Ok(())
    }

    fn record(&self, _event: ReplayEvent) -> Result<(), RecorderError> {
        Ok(())
    }

    fn session_end(&self, _session: Uuid) -> Result<(), RecorderError> {
        Ok(())
    }
}

impl CommandRecorder for NullRecorder {
    fn session_start(&self, _session: Uuid) -> Result<(), RecorderError> {
        Ok(())
    }

    fn record(&self, _event: CommandEvent) -> Result<(), RecorderError> {
        Ok(())
    }

    fn session_end(&self, _session: Uuid) -> Result<(), RecorderError> {
        Ok(())
    }
}
