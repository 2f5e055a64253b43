//! The two ends of a tunnel.
//!
//! Both connections are shared between the relay tasks and the cleanup task,
//! so every operation takes `&self`. Closing cancels the connection's token;
//! any read or write blocked on it returns [`StreamError::Closed`] at once.
//! `close()` is idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::dial::RawConn;
use crate::error::StreamError;

/// How long `close()` waits to hand a Close frame to a slow peer.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<RawConn>;

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// The upgraded WebSocket connection to the calling client.
pub struct ClientSocket {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: CancellationToken,
    close_started: AtomicBool,
    read_deadline: watch::Sender<Option<Instant>>,
    /// Deadline extension applied on every pong, in milliseconds. 0 = off.
    pong_wait_ms: AtomicU64,
}

impl ClientSocket {
    /// Wrap an already upgraded byte stream, acting as the server role.
    pub async fn from_raw(io: RawConn) -> Self {
        let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
            read_deadline: watch::Sender::new(None),
            pong_wait_ms: AtomicU64::new(0),
        }
    }

    /// Next data frame. `Ok(None)` when the client closed the connection.
    ///
    /// Control frames are consumed here: pings are answered by the protocol
    /// layer and pongs push the read deadline forward when a pong wait is set.
    pub async fn read_message(&self) -> Result<Option<Message>, StreamError> {
        let mut stream = tokio::select! {
            _ = self.closed.cancelled() => return Err(StreamError::Closed),
            stream = self.stream.lock() => stream,
        };
        // A deadline set while this read is parked re-arms the timer.
        let mut deadline_rx = self.read_deadline.subscribe();

        loop {
            let deadline = *deadline_rx.borrow_and_update();
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Err(StreamError::Closed),
                _ = sleep_until(deadline) => {
                    if self.deadline_passed() {
                        return Err(StreamError::DeadlineExceeded);
                    }
                    continue;
                }
                // The sender lives in `self`, so this only ever reports a change.
                Ok(()) = deadline_rx.changed() => continue,
                next = stream.next() => next,
            };

            match next {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Pong(_))) => {
                    let wait = self.pong_wait_ms.load(Ordering::Acquire);
                    if wait > 0 {
                        self.set_read_deadline(Some(Instant::now() + Duration::from_millis(wait)));
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(message)) => return Ok(Some(message)),
            }
        }
    }

    pub async fn write_message(&self, message: Message) -> Result<(), StreamError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(StreamError::Closed),
            sent = async { self.sink.lock().await.send(message).await } => Ok(sent?),
        }
    }

    pub async fn ping(&self) -> Result<(), StreamError> {
        self.write_message(Message::Ping(Bytes::new())).await
    }

    /// Reads fail with [`StreamError::DeadlineExceeded`] once `deadline`
    /// passes. `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.send_replace(deadline);
    }

    /// Extend the read deadline by `wait` on every pong received.
    pub fn set_pong_wait(&self, wait: Duration) {
        let millis = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self.pong_wait_ms.store(millis, Ordering::Release);
    }

    fn deadline_passed(&self) -> bool {
        matches!(*self.read_deadline.borrow(), Some(d) if d <= Instant::now())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Unblock all pending I/O, then try to say goodbye with a Close frame.
    pub async fn close(&self) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let goodbye = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_GRACE, goodbye).await.is_err() {
            trace!("client did not take the close frame");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// The raw byte stream to the device behind the instance.
pub struct ServerConn {
    reader: Mutex<ReadHalf<RawConn>>,
    writer: Mutex<WriteHalf<RawConn>>,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl ServerConn {
    pub fn new(conn: RawConn) -> Self {
        let (reader, writer) = tokio::io::split(conn);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
        }
    }

    /// Read into `buf`; `Ok(0)` is end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(StreamError::Closed),
            n = async { self.reader.lock().await.read(buf).await } => Ok(n?),
        }
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<(), StreamError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(StreamError::Closed),
            written = async {
                let mut writer = self.writer.lock().await;
                match writer.write_all(buf).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                }
            } => Ok(written?),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Unblock all pending I/O and shut the write side down.
    pub async fn close(&self) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let shutdown = async { self.writer.lock().await.shutdown().await };
        match tokio::time::timeout(CLOSE_GRACE, shutdown).await {
            Ok(Err(e)) => trace!(error = %e, "server connection shutdown"),
            Err(_) => trace!("server connection shutdown timed out"),
            Ok(Ok(())) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
