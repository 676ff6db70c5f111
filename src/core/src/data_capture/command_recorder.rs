//! Asynchronous command recording.
//!
//! [`QueuedCommandRecorder`] never blocks the bridging task: events are truncated, pushed to a
//! [`BoundedQueue`] and persisted in batches by a background task. A batch whose store call
//! fails is requeued and retried later.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Timelike;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::queue::BoundedQueue;
use super::recorder::CommandRecorder;
use super::types::CommandEvent;
use crate::error_handling::types::RecorderError;

pub const MAX_INPUT_CHARS: usize = 128;
pub const MAX_OUTPUT_CHARS: usize = 1024;
const BATCH_WAIT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Final destination of command batches.
pub trait CommandStore: Send + Sync {
    fn save_batch(&self, events: &[CommandEvent]) -> Result<(), RecorderError>;
}

/// Appends one JSON document per command to a file.
pub struct JsonLinesStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStore {
    pub fn open(path: &Path) -> Result<Self, RecorderError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl CommandStore for JsonLinesStore {
    fn save_batch(&self, events: &[CommandEvent]) -> Result<(), RecorderError> {
        let mut lines = String::new();
        for event in events {
            let line = serde_json::to_string(event)
                .map_err(|e| RecorderError::SerializationFailed(e.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(lines.as_bytes()).map_err(|e| {
            RecorderError::StoreUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        file.flush()?;
        Ok(())
    }
}

/// Writes commands through the log facade.
#[derive(Debug, Default)]
pub struct LogStore;

impl CommandStore for LogStore {
    fn save_batch(&self, events: &[CommandEvent]) -> Result<(), RecorderError> {
        for event in events {
            info!(
                "[{}] {}@{} as {}: {:?}",
                event.session, event.user, event.asset, event.system_user, event.input
            );
        }
        Ok(())
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub struct QueuedCommandRecorder {
    queue: Arc<BoundedQueue<CommandEvent>>,
    stop_tx: watch::Sender<bool>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedCommandRecorder {
    /// Creates the recorder and spawns its draining task on the current runtime.
    pub fn spawn(store: Arc<dyn CommandStore>, batch_size: usize, queue_size: usize) -> Arc<Self> {
        let queue = Arc::new(BoundedQueue::new(queue_size));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::drain_loop(
            queue.clone(),
            store,
            batch_size.max(1),
            stop_rx,
        ));

        Arc::new(Self {
            queue,
            stop_tx,
            drain: Mutex::new(Some(handle)),
        })
    }

    async fn drain_loop(
        queue: Arc<BoundedQueue<CommandEvent>>,
        store: Arc<dyn CommandStore>,
        batch_size: usize,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        debug!("Command recorder started");
        loop {
            let batch = tokio::select! {
                _ = stop_rx.changed() => break,
                batch = queue.mget(batch_size, BATCH_WAIT) => batch,
            };
            if batch.is_empty() {
                continue;
            }

            if let Err(e) = store.save_batch(&batch) {
                warn!("Failed to save {} commands, requeue: {}", batch.len(), e);
                let dropped = queue.mput(batch);
                if dropped > 0 {
                    error!("Dropped {} commands, queue is full", dropped);
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }

        // flush what is left before leaving
        while !queue.is_empty() {
            let batch = queue.mget(batch_size, Duration::ZERO).await;
            if let Err(e) = store.save_batch(&batch) {
                error!("Failed to save {} commands on shutdown: {}", batch.len(), e);
                break;
            }
        }
        debug!("Command recorder stopped");
    }

    /// Stops the draining task after a last flush.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Command recorder task failed: {}", e);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl CommandRecorder for QueuedCommandRecorder {
    fn session_start(&self, session: Uuid) -> Result<(), RecorderError> {
        debug!("[{}] Command recording started", session);
        Ok(())
    }

    fn record(&self, mut event: CommandEvent) -> Result<(), RecorderError> {
        event.input = truncate_chars(&event.input, MAX_INPUT_CHARS);
        event.output = truncate_chars(&event.output, MAX_OUTPUT_CHARS);
        event.timestamp = event.timestamp.with_nanosecond(0).unwrap_or(event.timestamp);

        self.queue.put(event).map_err(|_| RecorderError::QueueFull)
    }

    fn session_end(&self, session: Uuid) -> Result<(), RecorderError> {
        debug!("[{}] Command recording finished", session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn event(input: &str, output: &str) -> CommandEvent {
        CommandEvent {
            session: Uuid::new_v4(),
            user: "alice".into(),
            asset: "web01".into(),
            system_user: "root".into(),
            input: input.into(),
            output: output.into(),
            timestamp: Utc::now(),
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<CommandEvent>>,
        failures_left: AtomicUsize,
    }

    impl CommandStore for MemoryStore {
        fn save_batch(&self, events: &[CommandEvent]) -> Result<(), RecorderError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(RecorderError::StoreUnavailable("down".into()));
            }
            self.saved.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 2), "ab");
        assert_eq!(truncate_chars("abc", 5), "abc");
        // multi-byte characters are never split
        assert_eq!(truncate_chars("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_record_truncates_and_flushes_on_stop() {
        let store = Arc::new(MemoryStore::default());
        let recorder = QueuedCommandRecorder::spawn(store.clone(), 10, 100);

        let long_input = "x".repeat(300);
        let long_output = "y".repeat(3000);
        recorder.record(event(&long_input, &long_output)).unwrap();
        recorder.record(event("ls", "a b")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), recorder.stop())
            .await
            .expect("stop should finish");

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].input.len(), MAX_INPUT_CHARS);
        assert_eq!(saved[0].output.len(), MAX_OUTPUT_CHARS);
        assert_eq!(saved[0].timestamp.nanosecond(), 0);
        assert_eq!(saved[1].input, "ls");
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried() {
        let store = Arc::new(MemoryStore::default());
        store.failures_left.store(1, Ordering::SeqCst);
        let recorder = QueuedCommandRecorder::spawn(store.clone(), 10, 100);

        recorder.record(event("whoami", "root")).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.saved.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "batch was not retried");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(store.saved.lock().unwrap()[0].input, "whoami");
        recorder.stop().await;
    }

    #[tokio::test]
    async fn test_queue_full() {
        let store = Arc::new(MemoryStore::default());
        // a store that never succeeds keeps the queue occupied
        store.failures_left.store(usize::MAX, Ordering::SeqCst);
        let recorder = QueuedCommandRecorder::spawn(store, 1, 1);

        let mut results = Vec::new();
        for _ in 0..5 {
            results.push(recorder.record(event("id", "")));
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RecorderError::QueueFull))));
    }

    #[test]
    fn test_json_lines_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("commands.jsonl");
        let store = JsonLinesStore::open(&path).unwrap();

        store.save_batch(&[event("pwd", "/root"), event("id", "uid=0")]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<CommandEvent> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].input, "pwd");
        assert_eq!(lines[1].output, "uid=0");
    }
}
