//! The two kinds of channel ends a session bridges.
//!
//! A [`Client`] is the operator side (or an observer). A [`Server`] is the backend side and
//! additionally feeds the session's recorders. Both share the same transport behavior:
//! writes never raise (a failed write closes the endpoint and reports zero bytes), reads
//! report an empty vector at end of stream.

use async_trait::async_trait;
use log::{debug, trace};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use super::segmenter::Segmenter;
use super::session::Session;
use crate::authorization::{Asset, SystemUser, User};
use crate::network::channel::{BackendChannel, BoxedChannel, ChannelId, PtyControl};
use crate::network::request::Request;

/// Behavior common to every bridged channel end.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> ChannelId;
    /// Writes all of `data`, returning the byte count or `0` once the channel failed.
    async fn send(&self, data: &[u8]) -> usize;
    /// Reads at most `max` bytes; an empty vector is end of stream.
    async fn recv(&self, max: usize) -> io::Result<Vec<u8>>;
    async fn close(&self);
}

struct Duplex {
    id: ChannelId,
    reader: tokio::sync::Mutex<Option<ReadHalf<BoxedChannel>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedChannel>>>,
    closed: AtomicBool,
}

impl Duplex {
    fn new(channel: BoxedChannel) -> Self {
        let (reader, writer) = tokio::io::split(channel);
        Self {
            id: ChannelId::next(),
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        }
    }

    async fn send(&self, data: &[u8]) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return 0;
        };

        let result = match stream.write_all(data).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => data.len(),
            Err(e) => {
                debug!("Channel {} write failed, closing: {}", self.id, e);
                writer.take();
                self.closed.store(true, Ordering::SeqCst);
                0
            }
        }
    }

    async fn recv(&self, max: usize) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; max];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // a writer or reader parked on the stream keeps its half until it returns
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Some(mut stream) = writer.take() {
                let _ = stream.shutdown().await;
            }
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Operator facing channel end.
pub struct Client {
    duplex: Duplex,
    request: Arc<Request>,
}

impl Client {
    pub fn new(channel: BoxedChannel, request: Arc<Request>) -> Self {
        Self {
            duplex: Duplex::new(channel),
            request,
        }
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn user(&self) -> Option<&User> {
        self.request.user.as_ref()
    }

    pub fn addr(&self) -> SocketAddr {
        self.request.addr
    }

    pub fn is_closed(&self) -> bool {
        self.duplex.is_closed()
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.user() {
            Some(user) => write!(f, "<{} from {}>", user, self.request.addr),
            None => write!(f, "<{}>", self.request.addr),
        }
    }
}

#[async_trait]
impl Endpoint for Client {
    fn id(&self) -> ChannelId {
        self.duplex.id
    }

    async fn send(&self, data: &[u8]) -> usize {
        self.duplex.send(data).await
    }

    async fn recv(&self, max: usize) -> io::Result<Vec<u8>> {
        self.duplex.recv(max).await
    }

    async fn close(&self) {
        debug!("Close client {}", self);
        self.duplex.close().await;
    }
}

/// Backend facing channel end.
///
/// Bytes flowing through it are segmented into commands and, once a session is attached,
/// handed to that session's recorders.
pub struct Server {
    duplex: Duplex,
    asset: Asset,
    system_user: SystemUser,
    control: Option<Box<dyn PtyControl>>,
    segmenter: Mutex<Segmenter>,
    session: OnceLock<Weak<Session>>,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
}

impl Server {
    pub fn new(
        backend: BackendChannel,
        asset: Asset,
        system_user: SystemUser,
        segmenter: Segmenter,
    ) -> Self {
        Self {
            duplex: Duplex::new(backend.channel),
            asset,
            system_user,
            control: backend.control,
            segmenter: Mutex::new(segmenter),
            session: OnceLock::new(),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
        }
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn system_user(&self) -> &SystemUser {
        &self.system_user
    }

    /// Attaches the owning session; only the first call has an effect.
    pub fn set_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn resize(&self, width: u16, height: u16) -> io::Result<()> {
        match self.control {
            Some(ref control) => control.resize(width, height),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backend has no terminal control",
            )),
        }
    }

    fn segmenter(&self) -> std::sync::MutexGuard<'_, Segmenter> {
        self.segmenter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, input: String, output: String) {
        match self.session() {
            Some(session) => session.put_command(input, output),
            None => trace!("Command without session dropped: {:?}", input),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}@{}>", self.system_user, self.asset)
    }
}

#[async_trait]
impl Endpoint for Server {
    fn id(&self) -> ChannelId {
        self.duplex.id
    }

    async fn send(&self, data: &[u8]) -> usize {
        let segment = self.segmenter().on_outbound(data);
        if let Some(segment) = segment {
            self.emit(segment.input, segment.output);
        }

        let sent = self.duplex.send(data).await;
        self.sent_bytes.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    async fn recv(&self, max: usize) -> io::Result<Vec<u8>> {
        let data = self.duplex.recv(max).await?;
        if data.is_empty() {
            return Ok(data);
        }

        self.received_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Some(session) = self.session() {
            session.put_replay(&data);
        }
        self.segmenter().on_inbound(&data);
        Ok(data)
    }

    async fn close(&self) {
        let segment = self.segmenter().finish();
        if let Some(segment) = segment {
            self.emit(segment.input, segment.output);
        }
        debug!(
            "Close server {}: sent {} bytes, received {} bytes",
            self,
            self.sent_bytes(),
            self.received_bytes()
        );
        self.duplex.close().await;
    }
}
