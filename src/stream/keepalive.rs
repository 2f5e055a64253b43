//! Ping/pong keepalive for interactive tunnels.
//!
//! Pings the client every `interval`. Each pong pushes the client's read
//! deadline `pong_wait` into the future, so a peer that stops answering
//! trips the deadline and the relay tears the tunnel down. A failed ping
//! cancels the tunnel directly.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::conn::ClientSocket;

/// `keepalive(client, cancel)`; runs until `cancel` fires.
pub type KeepAliveFn =
    Arc<dyn Fn(Arc<ClientSocket>, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// The default ping/pong strategy.
pub fn ping_pong(interval: Duration, pong_wait: Duration) -> KeepAliveFn {
    Arc::new(
        move |client: Arc<ClientSocket>, cancel: CancellationToken| -> BoxFuture<'static, ()> {
            Box::pin(run(client, cancel, interval, pong_wait))
        },
    )
}

async fn run(
    client: Arc<ClientSocket>,
    cancel: CancellationToken,
    interval: Duration,
    pong_wait: Duration,
) {
    client.set_pong_wait(pong_wait);
    client.set_read_deadline(Some(Instant::now() + pong_wait));

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = client.ping().await {
                    debug!(error = %e, "keepalive ping failed");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test(start_paused = true)]
    async fn pings_until_cancelled() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let client = Arc::new(ClientSocket::from_raw(Box::new(ours)).await);
        let mut peer = WebSocketStream::from_raw_socket(theirs, Role::Client, None).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(ping_pong(Duration::from_secs(1), Duration::from_secs(60))(
            Arc::clone(&client),
            cancel.clone(),
        ));

        for _ in 0..3 {
            assert!(matches!(peer.next().await, Some(Ok(Message::Ping(_)))));
        }

        cancel.cancel();
        task.await.unwrap();
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn failed_ping_cancels_the_tunnel() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let client = Arc::new(ClientSocket::from_raw(Box::new(ours)).await);
        client.close().await;

        let cancel = CancellationToken::new();
        ping_pong(Duration::from_millis(10), Duration::from_secs(60))(client, cancel.clone()).await;

        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_extend_the_read_deadline() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let client = Arc::new(ClientSocket::from_raw(Box::new(ours)).await);
        let mut peer = WebSocketStream::from_raw_socket(theirs, Role::Client, None).await;

        let cancel = CancellationToken::new();
        tokio::spawn(ping_pong(Duration::from_secs(1), Duration::from_secs(5))(
            Arc::clone(&client),
            cancel.clone(),
        ));

        // Answer pings for well past the pong wait, then send data.
        let answering = tokio::spawn(async move {
            for _ in 0..10 {
                if let Some(Ok(Message::Ping(payload))) = peer.next().await {
                    peer.send(Message::Pong(payload)).await.unwrap();
                }
            }
            peer.send(Message::binary(b"alive".to_vec())).await.unwrap();
            peer
        });

        let message = client.read_message().await.unwrap();
        assert_eq!(message, Some(Message::binary(b"alive".to_vec())));

        // Silence from here on: the deadline fires.
        let _peer = answering.await.unwrap();
        let err = client.read_message().await.unwrap_err();
        assert!(matches!(err, StreamError::DeadlineExceeded));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_trips_the_deadline_when_the_read_starts_first() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let client = Arc::new(ClientSocket::from_raw(Box::new(ours)).await);
        let _peer = WebSocketStream::from_raw_socket(theirs, Role::Client, None).await;

        let reader = Arc::clone(&client);
        let pending = tokio::spawn(async move { reader.read_message().await });
        tokio::task::yield_now().await;

        let cancel = CancellationToken::new();
        tokio::spawn(ping_pong(Duration::from_secs(1), Duration::from_secs(60))(
            Arc::clone(&client),
            cancel.clone(),
        ));

        let result = tokio::time::timeout(Duration::from_secs(300), pending)
            .await
            .expect("read outlived the pong wait")
            .unwrap();
        assert!(matches!(result, Err(StreamError::DeadlineExceeded)));
        cancel.cancel();
    }
}
