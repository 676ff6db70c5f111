//! A bridged operator session.
//!
//! A [`Session`] joins one operator [`Client`] with one backend [`Server`] and any number of
//! observers. Every endpoint gets its own reader task; all of them feed a single merge
//! channel consumed by [`Session::bridge`], which routes each chunk by origin:
//!
//! - backend output goes to the client and to every watcher and sharer
//! - client input goes to the backend
//! - sharer input goes to the backend
//! - watcher input is discarded
//!
//! End of stream on the backend or the client closes the session. End of stream on an
//! observer only detaches that observer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::endpoint::{Client, Endpoint, Server};
use super::SessionState;
use crate::data_capture::{CommandEvent, CommandRecorder, ReplayEvent, ReplayRecorder};
use crate::error_handling::types::{RecorderError, SessionError};
use crate::network::channel::ChannelId;
use crate::network::request::LoginFrom;

pub const BUF_SIZE: usize = 1024;
/// Consecutive failed reads after which an endpoint is treated as closed.
pub const MAX_READ_FAULTS: u32 = 3;
const CHUNK_QUEUE: usize = 64;
const NOTICE_TIMEOUT: Duration = Duration::from_secs(2);
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S +0000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Server,
    Watcher(ChannelId),
    Sharer(ChannelId),
}

struct Chunk {
    origin: Origin,
    data: Vec<u8>,
}

struct Observer {
    endpoint: Arc<Client>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Observers {
    watchers: Vec<Observer>,
    sharers: Vec<Observer>,
}

impl Observers {
    fn contains(&self, id: ChannelId) -> bool {
        self.watchers
            .iter()
            .chain(self.sharers.iter())
            .any(|o| o.endpoint.id() == id)
    }
}

/// Serializable view of a session, as listed by the web front.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub user: String,
    pub asset: String,
    pub system_user: String,
    pub login_from: LoginFrom,
    pub remote_addr: String,
    pub is_finished: bool,
    pub date_last_active: String,
    pub date_start: String,
    pub date_end: Option<String>,
    pub watchers: usize,
    pub sharers: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn spawn_reader(
    endpoint: Arc<dyn Endpoint>,
    origin: Origin,
    chunks: mpsc::Sender<Chunk>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut faults = 0;
        loop {
            let data = match endpoint.recv(BUF_SIZE).await {
                Ok(data) => {
                    faults = 0;
                    data
                }
                Err(e) => {
                    faults += 1;
                    warn!("Read from {:?} failed ({}/{}): {}", origin, faults, MAX_READ_FAULTS, e);
                    if faults < MAX_READ_FAULTS {
                        continue;
                    }
                    Vec::new()
                }
            };

            let eof = data.is_empty();
            if chunks.send(Chunk { origin, data }).await.is_err() || eof {
                break;
            }
        }
        trace!("Reader for {:?} finished", origin);
    })
}

pub struct Session {
    id: Uuid,
    client: Arc<Client>,
    server: Arc<Server>,
    command_recorder: Arc<dyn CommandRecorder>,
    replay_recorder: Arc<dyn ReplayRecorder>,
    state: Mutex<SessionState>,
    observers: Mutex<Observers>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    chunks_tx: mpsc::Sender<Chunk>,
    chunks_rx: Mutex<Option<mpsc::Receiver<Chunk>>>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
    date_start: DateTime<Utc>,
    date_last_active: Mutex<DateTime<Utc>>,
    date_end: Mutex<Option<DateTime<Utc>>>,
    audit_failures: AtomicU64,
}

impl Session {
    /// Creates a session and attaches it to `server`, so that backend traffic reaches the
    /// recorders.
    pub fn new(
        client: Arc<Client>,
        server: Arc<Server>,
        command_recorder: Arc<dyn CommandRecorder>,
        replay_recorder: Arc<dyn ReplayRecorder>,
    ) -> Arc<Self> {
        let (chunks_tx, chunks_rx) = mpsc::channel(CHUNK_QUEUE);
        let (stop_tx, _) = watch::channel(false);
        let now = Utc::now();

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            client,
            server,
            command_recorder,
            replay_recorder,
            state: Mutex::new(SessionState::Created),
            observers: Mutex::new(Observers::default()),
            readers: Mutex::new(Vec::new()),
            chunks_tx,
            chunks_rx: Mutex::new(Some(chunks_rx)),
            stop_tx,
            closed: AtomicBool::new(false),
            date_start: now,
            date_last_active: Mutex::new(now),
            date_end: Mutex::new(None),
            audit_failures: AtomicU64::new(0),
        });
        session.server.set_session(Arc::downgrade(&session));
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_finished(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn date_end(&self) -> Option<DateTime<Utc>> {
        *lock(&self.date_end)
    }

    pub fn date_last_active(&self) -> DateTime<Utc> {
        *lock(&self.date_last_active)
    }

    /// Number of recorder calls that failed over the session lifetime.
    pub fn audit_failures(&self) -> u64 {
        self.audit_failures.load(Ordering::Relaxed)
    }

    fn audit_failed(&self, what: &str, e: &RecorderError) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
        error!("[{}] Recorder failed on {}: {}", self.id, what, e);
    }

    fn pre_bridge(&self) -> Result<(), RecorderError> {
        self.replay_recorder.session_start(self.id)?;
        if let Err(e) = self.command_recorder.session_start(self.id) {
            if let Err(end) = self.replay_recorder.session_end(self.id) {
                self.audit_failed("replay end", &end);
            }
            return Err(e);
        }
        Ok(())
    }

    fn post_bridge(&self) {
        if let Err(e) = self.replay_recorder.session_end(self.id) {
            self.audit_failed("replay end", &e);
        }
        if let Err(e) = self.command_recorder.session_end(self.id) {
            self.audit_failed("command end", &e);
        }
    }

    /// Records one segmented command. Spans without input are ignored.
    pub fn put_command(&self, input: String, output: String) {
        if input.is_empty() {
            return;
        }
        let event = CommandEvent {
            session: self.id,
            user: self
                .client
                .user()
                .map(|u| u.username.clone())
                .unwrap_or_default(),
            asset: self.server.asset().hostname.clone(),
            system_user: self.server.system_user().username.clone(),
            input,
            output,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.command_recorder.record(event) {
            self.audit_failed("command", &e);
        }
    }

    /// Records one chunk of backend output.
    pub fn put_replay(&self, data: &[u8]) {
        if let Err(e) = self.replay_recorder.record(ReplayEvent::new(self.id, data)) {
            self.audit_failed("replay", &e);
        }
    }

    /// Runs the session until the backend or the client closes, or [`Session::close`] is
    /// called from elsewhere.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyBridged`] on a second call
    /// - [`SessionError::Closed`] when the session was closed before bridging
    /// - [`SessionError::RecorderError`] when the recorders refuse to start; the session is
    ///   closed and nothing is forwarded
    pub async fn bridge(self: &Arc<Self>) -> Result<(), SessionError> {
        let started = {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Created => {}
                SessionState::Bridging => return Err(SessionError::AlreadyBridged),
                SessionState::Closed => return Err(SessionError::Closed),
            }
            let started = self.pre_bridge();
            if started.is_ok() {
                *state = SessionState::Bridging;
            }
            started
        };
        if let Err(e) = started {
            self.audit_failed("session start", &e);
            self.close().await;
            return Err(SessionError::RecorderError(e));
        }

        let Some(mut chunks) = lock(&self.chunks_rx).take() else {
            return Err(SessionError::AlreadyBridged);
        };

        info!("Start bridge session: {}", self.id);
        {
            let mut readers = lock(&self.readers);
            readers.push(spawn_reader(
                self.client.clone(),
                Origin::Client,
                self.chunks_tx.clone(),
            ));
            readers.push(spawn_reader(
                self.server.clone(),
                Origin::Server,
                self.chunks_tx.clone(),
            ));
        }

        let mut stop = self.stop_tx.subscribe();
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            let chunk = tokio::select! {
                biased;
                _ = stop.changed() => break,
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            match chunk.origin {
                Origin::Server => {
                    if chunk.data.is_empty() {
                        info!("[{}] Server close the connection", self.id);
                        self.close().await;
                        break;
                    }
                    *lock(&self.date_last_active) = Utc::now();
                    self.client.send(&chunk.data).await;
                    self.broadcast(&chunk.data).await;
                }
                Origin::Client => {
                    if chunk.data.is_empty() {
                        let msg = format!("Client close the connection: {}", self.client);
                        info!("[{}] {}", self.id, msg);
                        self.broadcast(msg.as_bytes()).await;
                        self.close().await;
                        break;
                    }
                    self.server.send(&chunk.data).await;
                }
                Origin::Sharer(id) => {
                    if !self.is_sharer(id) {
                        continue;
                    }
                    if chunk.data.is_empty() {
                        info!("[{}] Sharer {} leave the session", self.id, id);
                        self.remove_sharer(id).await;
                        continue;
                    }
                    self.server.send(&chunk.data).await;
                }
                Origin::Watcher(id) => {
                    if chunk.data.is_empty() {
                        info!("[{}] Watcher {} leave the session", self.id, id);
                        self.remove_watcher(id);
                    }
                }
            }
        }

        self.close().await;
        info!("Session stop event set: {}", self.id);
        Ok(())
    }

    fn peers(&self) -> Vec<Arc<Client>> {
        let observers = lock(&self.observers);
        observers
            .watchers
            .iter()
            .chain(observers.sharers.iter())
            .map(|o| o.endpoint.clone())
            .collect()
    }

    /// Sends `data` to every observer. One that fails or does not take it within
    /// `NOTICE_TIMEOUT` is detached.
    async fn broadcast(&self, data: &[u8]) {
        for peer in self.peers() {
            match tokio::time::timeout(NOTICE_TIMEOUT, peer.send(data)).await {
                Ok(sent) if sent > 0 => {}
                Ok(_) => {
                    debug!("[{}] Observer {} is gone", self.id, peer);
                    self.detach(peer.id());
                }
                Err(_) => {
                    warn!("[{}] Observer {} stalled, detaching it", self.id, peer);
                    self.detach(peer.id());
                }
            }
        }
    }

    fn detach(&self, id: ChannelId) -> bool {
        let removed = {
            let mut observers = lock(&self.observers);
            match observers.watchers.iter().position(|o| o.endpoint.id() == id) {
                Some(p) => Some(observers.watchers.remove(p)),
                None => observers
                    .sharers
                    .iter()
                    .position(|o| o.endpoint.id() == id)
                    .map(|p| observers.sharers.remove(p)),
            }
        };
        match removed {
            Some(observer) => {
                observer.reader.abort();
                true
            }
            None => false,
        }
    }

    fn is_sharer(&self, id: ChannelId) -> bool {
        lock(&self.observers)
            .sharers
            .iter()
            .any(|o| o.endpoint.id() == id)
    }

    fn check_attachable(&self, endpoint: &Client) -> Result<(), SessionError> {
        if self.is_finished() {
            return Err(SessionError::Closed);
        }
        if endpoint.id() == self.client.id() || lock(&self.observers).contains(endpoint.id()) {
            return Err(SessionError::AlreadyAttached);
        }
        Ok(())
    }

    fn attach(&self, endpoint: Arc<Client>, sharer: bool) -> Result<(), SessionError> {
        let mut observers = lock(&self.observers);
        if self.is_finished() {
            return Err(SessionError::Closed);
        }
        if observers.contains(endpoint.id()) {
            return Err(SessionError::AlreadyAttached);
        }

        let origin = if sharer {
            Origin::Sharer(endpoint.id())
        } else {
            Origin::Watcher(endpoint.id())
        };
        let reader = spawn_reader(endpoint.clone(), origin, self.chunks_tx.clone());
        let observer = Observer { endpoint, reader };
        if sharer {
            observers.sharers.push(observer);
        } else {
            observers.watchers.push(observer);
        }
        Ok(())
    }

    /// Attaches a read-only observer that receives all backend output from now on.
    pub async fn add_watcher(&self, watcher: Arc<Client>, silent: bool) -> Result<(), SessionError> {
        self.check_attachable(&watcher)?;
        info!("Session add watcher: {} -> {}", self.id, watcher);
        if !silent {
            let welcome = format!("Welcome to watch session {}\r\n", self.id);
            watcher.send(welcome.as_bytes()).await;
        }
        self.attach(watcher, false)
    }

    /// Attaches an observer whose input is also forwarded to the backend.
    pub async fn add_sharer(&self, sharer: Arc<Client>, silent: bool) -> Result<(), SessionError> {
        self.check_attachable(&sharer)?;
        info!("Session {} add share {}", self.id, sharer);
        if !silent {
            let welcome = format!("Welcome to join session: {}\r\n", self.id);
            sharer.send(welcome.as_bytes()).await;
        }
        self.attach(sharer, true)
    }

    /// Detaches a watcher. Returns whether it was attached.
    pub fn remove_watcher(&self, id: ChannelId) -> bool {
        let removed = {
            let mut observers = lock(&self.observers);
            let position = observers.watchers.iter().position(|o| o.endpoint.id() == id);
            position.map(|p| observers.watchers.remove(p))
        };
        match removed {
            Some(observer) => {
                info!("Session {} remove watcher {}", self.id, observer.endpoint);
                observer.reader.abort();
                true
            }
            None => false,
        }
    }

    /// Detaches a sharer after telling it that it left. Returns whether it was attached.
    pub async fn remove_sharer(&self, id: ChannelId) -> bool {
        let removed = {
            let mut observers = lock(&self.observers);
            let position = observers.sharers.iter().position(|o| o.endpoint.id() == id);
            position.map(|p| observers.sharers.remove(p))
        };
        match removed {
            Some(observer) => {
                info!("Session {} remove sharer {}", self.id, observer.endpoint);
                let notice = format!("Leave session {} at {}", self.id, Utc::now());
                let _ = tokio::time::timeout(
                    NOTICE_TIMEOUT,
                    observer.endpoint.send(notice.as_bytes()),
                )
                .await;
                observer.reader.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_observer(&self, id: ChannelId) -> bool {
        lock(&self.observers).contains(id)
    }

    /// Receiver that turns `true` once the session is closed.
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn watcher_count(&self) -> usize {
        lock(&self.observers).watchers.len()
    }

    pub fn sharer_count(&self) -> usize {
        lock(&self.observers).sharers.len()
    }

    /// Forwards a terminal resize to the backend.
    pub fn set_size(&self, width: u16, height: u16) -> std::io::Result<()> {
        debug!("Resize server chan size {}*{}", width, height);
        self.client.request().set_size(width, height);
        self.server.resize(width, height)
    }

    /// Ends the session. Safe to call any number of times from any task.
    ///
    /// Stops the bridge loop, finishes the recorders when bridging had started, stamps the
    /// end date and closes the backend. The client and observers are left open for the
    /// caller to reuse or close.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Close the session: {}", self.id);
        self.stop_tx.send_replace(true);

        let was_bridging = {
            let mut state = lock(&self.state);
            let previous = *state;
            *state = SessionState::Closed;
            previous == SessionState::Bridging
        };
        if was_bridging {
            self.post_bridge();
        }
        *lock(&self.date_end) = Some(Utc::now());

        for reader in lock(&self.readers).drain(..) {
            reader.abort();
        }
        {
            let observers = lock(&self.observers);
            for observer in observers.watchers.iter().chain(observers.sharers.iter()) {
                observer.reader.abort();
            }
        }

        self.server.close().await;
    }

    /// Administrative termination: notifies the client, then closes.
    pub async fn terminate(&self) {
        let notice = b"Terminate by administrator\r\n";
        if tokio::time::timeout(NOTICE_TIMEOUT, self.client.send(notice))
            .await
            .is_err()
        {
            warn!("[{}] Client did not take the termination notice", self.id);
        }
        self.close().await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let request = self.client.request();
        SessionSnapshot {
            id: self.id,
            user: self
                .client
                .user()
                .map(|u| u.username.clone())
                .unwrap_or_default(),
            asset: self.server.asset().hostname.clone(),
            system_user: self.server.system_user().username.clone(),
            login_from: request.login_from,
            remote_addr: request.remote_ip().to_string(),
            is_finished: self.is_finished(),
            date_last_active: self.date_last_active().format(DATE_FORMAT).to_string(),
            date_start: self.date_start.format(DATE_FORMAT).to_string(),
            date_end: self.date_end().map(|d| d.format(DATE_FORMAT).to_string()),
            watchers: self.watcher_count(),
            sharers: self.sharer_count(),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let readers = self.readers.get_mut().unwrap_or_else(|e| e.into_inner());
        for reader in readers.drain(..) {
            reader.abort();
        }
        let observers = self.observers.get_mut().unwrap_or_else(|e| e.into_inner());
        for observer in observers.watchers.iter().chain(observers.sharers.iter()) {
            observer.reader.abort();
        }
    }
}
