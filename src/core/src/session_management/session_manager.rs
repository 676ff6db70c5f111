use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::session::{Session, SessionSnapshot};
use crate::error_handling::types::SessionError;

/// Number of heartbeats a finished session stays listed before the monitor drops it.
const FINISHED_GRACE_BEATS: u32 = 5;

/// The structure related to session management
///
/// Keeps every live session reachable by id so that observers can attach to it, the web
/// front can list and terminate it and a monitor can forget it once it has finished.
///
/// # Fields Overview
///
/// - `sessions`: registered sessions, finished ones included until the monitor drops them
/// - `max_sessions`: the maximum number of registered sessions
/// - `heartbeat`: period of the monitor; finished sessions are kept `5 × heartbeat`
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    max_sessions: usize,
    heartbeat: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, heartbeat: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            heartbeat,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_session(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions();
        let live = sessions.values().filter(|s| !s.is_finished()).count();
        if live >= self.max_sessions {
            warn!(
                "Session limit of {} reached, refusing {}",
                self.max_sessions, session
            );
            return Err(SessionError::SessionLimitReached);
        }
        debug!("Register session {}", session);
        sessions.insert(session.id(), session);
        Ok(())
    }

    pub fn remove_session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions().remove(id)
    }

    pub fn get_session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions().get(id).cloned()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.sessions().values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.date_start.cmp(&b.date_start));
        snapshots
    }

    pub fn get_active_session_count(&self) -> usize {
        self.sessions()
            .values()
            .filter(|s| !s.is_finished())
            .count()
    }

    /// Drops sessions that finished more than `5 × heartbeat` before `now`.
    ///
    /// Returns how many were dropped.
    pub fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.heartbeat * FINISHED_GRACE_BEATS)
            .unwrap_or_else(|_| chrono::Duration::seconds(25));

        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|id, session| {
            if !session.is_finished() {
                return true;
            }
            let expired = match session.date_end() {
                Some(end) => now - end > grace,
                None => true,
            };
            if expired {
                debug!("Forget finished session {}", id);
            }
            !expired
        });
        before - sessions.len()
    }

    /// Administrative termination of one session.
    pub async fn terminate_session(&self, id: &Uuid) -> Result<(), SessionError> {
        let session = self.get_session(id).ok_or(SessionError::NotFound)?;
        info!("Terminate session {}", id);
        session.terminate().await;
        Ok(())
    }

    pub async fn shutdown_all_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions().values().cloned().collect();
        for session in sessions {
            if !session.is_finished() {
                session.terminate().await;
            }
        }
    }

    /// Spawns the periodic cleanup, running until `stop` turns true.
    pub fn spawn_monitor(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.heartbeat);
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = interval.tick() => {
                        let dropped = manager.cleanup_expired_sessions(Utc::now());
                        if dropped > 0 {
                            debug!("Monitor dropped {} finished sessions", dropped);
                        }
                    }
                }
                if *stop.borrow() {
                    break;
                }
            }
            debug!("Session monitor stopped");
        })
    }
}
