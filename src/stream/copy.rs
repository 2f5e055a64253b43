//! Streaming-copy strategies.
//!
//! A strategy relays one direction of a tunnel until either side ends and
//! writes exactly one terminal result into the tunnel's result queue.
//!
//! - raw: fixed-protocol device streams (console, VNC, serial, USB
//!   redirection). Binary frames only, no end-of-stream signalling.
//! - framed: interactive streams (port-forward, VSOCK, SSH). Text frames are
//!   accepted as payload and server EOF is announced with a Close frame.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::conn::{ClientSocket, ServerConn};
use crate::error::StreamError;

/// Terminal value of one relay direction.
pub type StreamResult = Result<(), StreamError>;

/// `stream(client, server, results)`; sends exactly one value on `results`.
pub type StreamFn = Arc<
    dyn Fn(Arc<ClientSocket>, Arc<ServerConn>, mpsc::Sender<StreamResult>) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Build a [`StreamFn`] from a relay loop; its return value is the result.
pub fn stream_fn<F, Fut>(f: F) -> StreamFn
where
    F: Fn(Arc<ClientSocket>, Arc<ServerConn>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StreamResult> + Send + 'static,
{
    Arc::new(
        move |client: Arc<ClientSocket>,
              server: Arc<ServerConn>,
              results: mpsc::Sender<StreamResult>|
              -> BoxFuture<'static, ()> {
            let relay = f(client, server);
            Box::pin(async move {
                let _ = results.send(relay.await).await;
            })
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Raw,
    Framed,
}

pub fn raw_to_server() -> StreamFn {
    stream_fn(|client, server| client_to_server(client, server, Framing::Raw))
}

pub fn raw_to_client(buffer: usize) -> StreamFn {
    stream_fn(move |client, server| server_to_client(client, server, buffer, Framing::Raw))
}

pub fn framed_to_server() -> StreamFn {
    stream_fn(|client, server| client_to_server(client, server, Framing::Framed))
}

pub fn framed_to_client(buffer: usize) -> StreamFn {
    stream_fn(move |client, server| server_to_client(client, server, buffer, Framing::Framed))
}

async fn client_to_server(
    client: Arc<ClientSocket>,
    server: Arc<ServerConn>,
    framing: Framing,
) -> StreamResult {
    while let Some(message) = client.read_message().await? {
        let payload: Bytes = match message {
            Message::Binary(data) => data,
            Message::Text(text) if framing == Framing::Framed => Bytes::copy_from_slice(text.as_bytes()),
            Message::Text(_) => return Err(StreamError::UnexpectedFrame("text")),
            _ => continue,
        };
        if !payload.is_empty() {
            server.write_all(&payload).await?;
        }
    }
    Ok(())
}

async fn server_to_client(
    client: Arc<ClientSocket>,
    server: Arc<ServerConn>,
    buffer: usize,
    framing: Framing,
) -> StreamResult {
    let mut buf = vec![0u8; buffer.max(1)];
    loop {
        let n = server.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        client
            .write_message(Message::Binary(Bytes::copy_from_slice(&buf[..n])))
            .await?;
    }

    if framing == Framing::Framed {
        client
            .write_message(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    struct Harness {
        client: Arc<ClientSocket>,
        server: Arc<ServerConn>,
        ws_peer: WebSocketStream<DuplexStream>,
        guest: DuplexStream,
    }

    async fn harness() -> Harness {
        let (ws_ours, ws_theirs) = tokio::io::duplex(4096);
        let (server_ours, guest) = tokio::io::duplex(4096);
        Harness {
            client: Arc::new(ClientSocket::from_raw(Box::new(ws_ours)).await),
            server: Arc::new(ServerConn::new(Box::new(server_ours))),
            ws_peer: WebSocketStream::from_raw_socket(ws_theirs, Role::Client, None).await,
            guest,
        }
    }

    async fn run(stream: &StreamFn, h: &Harness) -> mpsc::Receiver<StreamResult> {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(stream(Arc::clone(&h.client), Arc::clone(&h.server), tx));
        rx
    }

    #[tokio::test]
    async fn raw_copies_binary_frames_to_the_server() {
        let mut h = harness().await;
        let mut results = run(&raw_to_server(), &h).await;

        h.ws_peer.send(Message::binary(b"\x00\x01\x02".to_vec())).await.unwrap();
        let mut buf = [0u8; 3];
        h.guest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x00\x01\x02");

        h.ws_peer.close(None).await.unwrap();
        assert!(results.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn raw_rejects_text_frames() {
        let mut h = harness().await;
        let mut results = run(&raw_to_server(), &h).await;

        h.ws_peer.send(Message::text("hello")).await.unwrap();
        let result = results.recv().await.unwrap();
        assert!(matches!(result, Err(StreamError::UnexpectedFrame("text"))));
    }

    #[tokio::test]
    async fn framed_accepts_text_frames() {
        let mut h = harness().await;
        let _results = run(&framed_to_server(), &h).await;

        h.ws_peer.send(Message::text("ls\n")).await.unwrap();
        let mut buf = [0u8; 3];
        h.guest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");
    }

    #[tokio::test]
    async fn server_bytes_arrive_as_binary_frames() {
        let mut h = harness().await;
        let mut results = run(&raw_to_client(64), &h).await;

        h.guest.write_all(b"login: ").await.unwrap();
        let frame = h.ws_peer.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::binary(b"login: ".to_vec()));

        h.guest.shutdown().await.unwrap();
        assert!(results.recv().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn framed_announces_server_eof_with_close() {
        let mut h = harness().await;
        let mut results = run(&framed_to_client(64), &h).await;

        h.guest.shutdown().await.unwrap();
        assert!(results.recv().await.unwrap().is_ok());
        assert!(matches!(h.ws_peer.next().await, Some(Ok(Message::Close(Some(_))))));
    }

    #[tokio::test]
    async fn closed_connection_reports_an_error() {
        let h = harness().await;
        let mut results = run(&raw_to_client(64), &h).await;

        h.server.close().await;
        let result = results.recv().await.unwrap();
        assert!(matches!(result, Err(StreamError::Closed)));
    }
}
