//! File backed replay recorder.
//!
//! Each session produces `<log_dir>/<session>.replay`, a single JSON object mapping the
//! elapsed time since the session start (seconds, as a string key) to the output chunk
//! emitted at that moment:
//!
//! ```text
//! {"0.013":"Last login ...","0.51":"$ ","0":""}
//! ```
//!
//! The trailing `"0":""` entry closes the object. When compression is enabled the closed file
//! is also written gzipped next to it as `<session>.replay.gz`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, trace};
use uuid::Uuid;

use super::recorder::ReplayRecorder;
use super::types::ReplayEvent;
use crate::error_handling::types::RecorderError;

struct ReplayFile {
    writer: BufWriter<File>,
    path: PathBuf,
    started: DateTime<Utc>,
}

pub struct FileReplayRecorder {
    dir: PathBuf,
    gzip: bool,
    files: Mutex<HashMap<Uuid, ReplayFile>>,
}

impl FileReplayRecorder {
    pub fn new(dir: &Path, gzip: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            gzip,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn replay_path(&self, session: Uuid) -> PathBuf {
        self.dir.join(format!("{}.replay", session))
    }

    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ReplayFile>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn compress(path: &Path) -> Result<PathBuf, RecorderError> {
        let mut gz_path = path.as_os_str().to_owned();
        gz_path.push(".gz");
        let gz_path = PathBuf::from(gz_path);

        let mut input = BufReader::new(File::open(path)?);
        let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(gz_path)
    }
}

impl ReplayRecorder for FileReplayRecorder {
    fn session_start(&self, session: Uuid) -> Result<(), RecorderError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.replay_path(session);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(b"{")?;

        debug!("[{}] Replay recording to {}", session, path.display());
        self.files().insert(
            session,
            ReplayFile {
                writer,
                path,
                started: Utc::now(),
            },
        );
        Ok(())
    }

    fn record(&self, event: ReplayEvent) -> Result<(), RecorderError> {
        if event.data.is_empty() {
            return Ok(());
        }

        let mut files = self.files();
        let file = files
            .get_mut(&event.session)
            .ok_or(RecorderError::SessionNotStarted(event.session))?;

        let elapsed = (event.timestamp - file.started)
            .num_microseconds()
            .unwrap_or(0)
            .max(0) as f64
            / 1_000_000.0;
        let chunk = serde_json::to_string(&String::from_utf8_lossy(&event.data))
            .map_err(|e| RecorderError::SerializationFailed(e.to_string()))?;

        trace!("[{}] replay +{}s, {} bytes", event.session, elapsed, event.data.len());
        write!(file.writer, "\"{}\":{},", elapsed, chunk)?;
        Ok(())
    }

    fn session_end(&self, session: Uuid) -> Result<(), RecorderError> {
        let mut file = self
            .files()
            .remove(&session)
            .ok_or(RecorderError::SessionNotStarted(session))?;

        file.writer.write_all(b"\"0\":\"\"}")?;
        file.writer.flush()?;
        drop(file.writer);

        if self.gzip {
            let gz_path = Self::compress(&file.path)?;
            info!("[{}] Replay saved to {}", session, gz_path.display());
        } else {
            info!("[{}] Replay saved to {}", session, file.path.display());
        }
        Ok(())
    }
}
