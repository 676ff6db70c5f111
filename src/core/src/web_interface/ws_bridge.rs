//! Byte channel over a signaling connection.
//!
//! A [`WsProxy`] owns one half of an in-process duplex pipe; the other half is handed to a
//! [`Client`](crate::session_management::Client), which then behaves exactly like a terminal
//! connection. Bytes the client writes come out of the proxy as `data` messages for its room,
//! and `data` messages for the room are written back into the pipe.

use log::{debug, trace, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::types::Outbound;
use crate::session_management::session::{BUF_SIZE, MAX_READ_FAULTS};

/// Pause after forwarding a full buffer.
const FULL_CHUNK_PAUSE: Duration = Duration::from_millis(100);

/// Where a proxy delivers its messages.
pub trait SignalSink: Send + Sync {
    fn emit(&self, message: Outbound);
    /// The room's byte channel ended; the signaling side should forget it.
    fn logout(&self, room: &str);
}

pub struct WsProxy {
    room: String,
    writer: Mutex<Option<WriteHalf<DuplexStream>>>,
    stop: watch::Sender<bool>,
    forwarder: JoinHandle<()>,
}

/// Decodes the complete UTF-8 prefix of `pending`, dropping invalid bytes and keeping an
/// incomplete trailing sequence for the next chunk.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut rest: &[u8] = pending;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => rest = &after[len..],
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let keep = rest.to_vec();
    *pending = keep;
    text
}

async fn forward(
    room: String,
    mut reader: ReadHalf<DuplexStream>,
    sink: Arc<dyn SignalSink>,
    mut stop: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut pending = Vec::new();
    let mut faults = 0;

    loop {
        let read = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("Room {} closed by its client", room);
                sink.logout(&room);
                break;
            }
            Ok(n) => {
                faults = 0;
                pending.extend_from_slice(&buf[..n]);
                let data = drain_utf8(&mut pending);
                if !data.is_empty() {
                    trace!("Room {} forwards {} bytes", room, n);
                    sink.emit(Outbound::Data {
                        data,
                        room: room.clone(),
                    });
                }
                if n == BUF_SIZE {
                    tokio::time::sleep(FULL_CHUNK_PAUSE).await;
                }
            }
            Err(e) => {
                faults += 1;
                warn!("Room {} read fault {}/{}: {}", room, faults, MAX_READ_FAULTS, e);
                if faults >= MAX_READ_FAULTS {
                    sink.logout(&room);
                    break;
                }
            }
        }
    }
}

impl WsProxy {
    /// Creates the proxy for `room` and returns the pipe half its client should use.
    pub fn new(room: &str, sink: Arc<dyn SignalSink>) -> (Self, DuplexStream) {
        let (retained, handed) = tokio::io::duplex(BUF_SIZE * 4);
        let (reader, writer) = tokio::io::split(retained);
        let (stop, stopped) = watch::channel(false);
        let forwarder = tokio::spawn(forward(room.to_string(), reader, sink, stopped));

        let proxy = Self {
            room: room.to_string(),
            writer: Mutex::new(Some(writer)),
            stop,
            forwarder,
        };
        (proxy, handed)
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Writes browser input into the pipe.
    pub async fn send(&self, data: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(stream) => stream.write_all(data.as_bytes()).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "room closed")),
        }
    }

    /// Stops forwarding and closes the pipe; the client sees end of stream.
    pub async fn close(&self) {
        self.stop.send_replace(true);
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        debug!("Proxy {} closed", self.room);
    }
}

impl Drop for WsProxy {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(3);

    struct ChannelSink(mpsc::UnboundedSender<Outbound>);

    impl SignalSink for ChannelSink {
        fn emit(&self, message: Outbound) {
            let _ = self.0.send(message);
        }

        fn logout(&self, room: &str) {
            let _ = self.0.send(Outbound::Logout { room: room.into() });
        }
    }

    fn proxy() -> (WsProxy, DuplexStream, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (proxy, handed) = WsProxy::new("r1", Arc::new(ChannelSink(tx)));
        (proxy, handed, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Outbound {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_forwards_both_ways() {
        let (proxy, mut handed, mut rx) = proxy();

        handed.write_all(b"$ ").await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            Outbound::Data {
                data: "$ ".into(),
                room: "r1".into()
            }
        );

        proxy.send("ls\r").await.unwrap();
        let mut buf = [0u8; 3];
        handed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\r");
    }

    #[tokio::test]
    async fn test_split_multibyte_sequence() {
        let (_proxy, mut handed, mut rx) = proxy();
        let euro = "€".as_bytes();

        handed.write_all(&euro[..2]).await.unwrap();
        tokio::task::yield_now().await;
        handed.write_all(&euro[2..]).await.unwrap();

        assert_eq!(
            next(&mut rx).await,
            Outbound::Data {
                data: "€".into(),
                room: "r1".into()
            }
        );
    }

    #[test]
    fn test_drain_utf8_drops_invalid_bytes() {
        let mut pending = vec![b'a', 0xff, b'b', 0xe2, 0x82];
        assert_eq!(drain_utf8(&mut pending), "ab");
        assert_eq!(pending, vec![0xe2, 0x82]);
    }

    #[tokio::test]
    async fn test_client_close_logs_out() {
        let (_proxy, handed, mut rx) = proxy();
        drop(handed);
        assert_eq!(next(&mut rx).await, Outbound::Logout { room: "r1".into() });
    }

    #[tokio::test]
    async fn test_close_ends_client_stream() {
        let (proxy, mut handed, _rx) = proxy();
        proxy.close().await;

        let mut rest = Vec::new();
        handed.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(proxy.send("late").await.is_err());
    }
}
