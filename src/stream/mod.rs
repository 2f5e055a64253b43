//! The tunnel orchestrator.
//!
//! [`Streamer::handle`] turns one inbound request into a relayed byte
//! stream: resolve (fetch, validate, dial), upgrade the client, relay in
//! both directions until either side ends, then tear everything down.
//!
//! Coordination inside a tunnel is message passing only. A cancellation
//! token per tunnel triggers the cleanup task, which closes both
//! connections; a two-slot result queue collects the terminal value of each
//! relay direction. The first value wins and forces the second.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::{StatusError, StreamError, TunnelError};
use crate::resolver::DirectResolver;

pub mod conn;
pub mod copy;
pub mod keepalive;
pub mod phase;
pub mod upgrade;

pub use conn::{ClientSocket, ServerConn};
pub use copy::{StreamFn, StreamResult, stream_fn};
pub use keepalive::{KeepAliveFn, ping_pong};
use phase::{PhaseEvent, PhaseTracker};

pub const NAMESPACE_PARAM: &str = "namespace";
pub const NAME_PARAM: &str = "name";
pub const PORT_PARAM: &str = "port";
pub const PROTOCOL_PARAM: &str = "protocol";

/// Default bound on the client handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Path parameters of the inbound request.
pub type PathParams = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Response slot
// ---------------------------------------------------------------------------

/// Single-use slot for the HTTP response of a tunnel request.
///
/// The HTTP server needs the response (101 or an error status) before the
/// tunnel can run, while `handle` only returns once the tunnel is over. The
/// handler awaits the receiving half; `handle` fills the slot exactly once.
#[derive(Debug)]
pub struct ResponseWriter {
    slot: Option<oneshot::Sender<Response>>,
}

impl ResponseWriter {
    pub fn channel() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Self { slot: Some(tx) }, rx)
    }

    /// Commit `response`. Returns false if a response was already written.
    pub fn write(&mut self, response: Response) -> bool {
        match self.slot.take() {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn write_error(&mut self, err: &StatusError) -> bool {
        self.write(err.clone().into_response())
    }

    pub fn is_written(&self) -> bool {
        self.slot.is_none()
    }
}

// ---------------------------------------------------------------------------
// Streamer
// ---------------------------------------------------------------------------

/// One device kind's tunnel: its resolver, its copy strategies and an
/// optional keepalive. Cheap to clone; holds no per-tunnel state.
#[derive(Clone)]
pub struct Streamer {
    resolver: DirectResolver,
    to_client: StreamFn,
    to_server: StreamFn,
    keep_alive: Option<KeepAliveFn>,
    handshake_timeout: Duration,
    parent: CancellationToken,
}

impl Streamer {
    pub fn new(resolver: DirectResolver, to_client: StreamFn, to_server: StreamFn) -> Self {
        Self {
            resolver,
            to_client,
            to_server,
            keep_alive: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            parent: CancellationToken::new(),
        }
    }

    /// Byte-for-byte tunnel for fixed-protocol devices. No keepalive.
    pub fn raw(resolver: DirectResolver, buffer: usize) -> Self {
        Self::new(resolver, copy::raw_to_client(buffer), copy::raw_to_server())
    }

    /// Framed tunnel for interactive streams, kept alive with pings.
    pub fn interactive(resolver: DirectResolver, buffer: usize, keep_alive: KeepAliveFn) -> Self {
        Self::new(
            resolver,
            copy::framed_to_client(buffer),
            copy::framed_to_server(),
        )
        .with_keep_alive(keep_alive)
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAliveFn) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Tunnels end when `parent` is cancelled.
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = parent;
        self
    }

    /// Run one tunnel to completion.
    ///
    /// The HTTP response is written to `response` exactly once: the
    /// classified error when resolution fails, BadRequest when the upgrade
    /// fails, `101` otherwise. The return value is the terminal result: the
    /// resolve or upgrade error, or the first relay direction's result.
    pub async fn handle(
        &self,
        params: &PathParams,
        request: Request,
        mut response: ResponseWriter,
    ) -> Result<(), TunnelError> {
        let (namespace, name) = match target(params) {
            Ok(target) => target,
            Err(e) => {
                response.write_error(&e);
                return Err(e.into());
            }
        };
        let mut phases = PhaseTracker::new(format!("{namespace}/{name}"));

        phases.advance(PhaseEvent::Resolve);
        let instance = match self.resolver.fetch_and_validate(namespace, name).await {
            Ok(instance) => instance,
            Err(e) => {
                phases.advance(PhaseEvent::Fail);
                response.write_error(&e);
                return Err(e.into());
            }
        };

        phases.advance(PhaseEvent::Dial);
        let server = match self.resolver.dial(&instance).await {
            Ok(conn) => Arc::new(ServerConn::new(conn)),
            Err(e) => {
                phases.advance(PhaseEvent::Fail);
                warn!(namespace, name, error = %e, "Failed to dial vmi");
                response.write_error(&e);
                return Err(e.into());
            }
        };

        phases.advance(PhaseEvent::Upgrade);
        let client = match upgrade::upgrade(request, &mut response, self.handshake_timeout).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                phases.advance(PhaseEvent::Fail);
                server.close().await;
                debug!(namespace, name, error = %e, "Failed to upgrade client websocket connection");
                response.write_error(&StatusError::bad_request(e.to_string()));
                return Err(e.into());
            }
        };

        info!(namespace, name, "tunnel opened");
        let result = self.relay(client, server, &mut phases).await;
        match &result {
            Ok(()) => info!(namespace, name, "tunnel closed"),
            Err(e) => info!(namespace, name, error = %e, "tunnel closed"),
        }
        Ok(result?)
    }

    /// Spawn [`Self::handle`] and wait for its HTTP response. The tunnel
    /// keeps running after the response is returned; `guard` is dropped
    /// when it ends.
    pub async fn serve<G>(&self, params: PathParams, request: Request, guard: G) -> Response
    where
        G: Send + 'static,
    {
        let (writer, slot) = ResponseWriter::channel();
        let streamer = self.clone();
        tokio::spawn(
            async move {
                if let Err(e) = streamer.handle(&params, request, writer).await {
                    debug!(error = %e, "tunnel request ended with error");
                }
                drop(guard);
            }
            .in_current_span(),
        );
        slot.await
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    async fn relay(
        &self,
        client: Arc<ClientSocket>,
        server: Arc<ServerConn>,
        phases: &mut PhaseTracker,
    ) -> StreamResult {
        let ctx = self.parent.child_token();

        let cleanup = tokio::spawn({
            let (ctx, client, server) = (ctx.clone(), Arc::clone(&client), Arc::clone(&server));
            async move {
                ctx.cancelled().await;
                client.close().await;
                server.close().await;
            }
        });

        if let Some(keep_alive) = &self.keep_alive {
            tokio::spawn(keep_alive(Arc::clone(&client), ctx.clone()));
        }

        phases.advance(PhaseEvent::Relay);
        let (results, mut done) = mpsc::channel(2);
        tokio::spawn((self.to_client)(Arc::clone(&client), Arc::clone(&server), results.clone()));
        tokio::spawn((self.to_server)(client, server, results));

        // A relay task that died without reporting counts as a closed stream.
        let first = done.recv().await.unwrap_or(Err(StreamError::Closed));
        phases.advance(PhaseEvent::Cancel);
        ctx.cancel();

        let _ = done.recv().await;
        if let Err(e) = cleanup.await {
            debug!(error = %e, "tunnel cleanup task failed");
        }
        phases.advance(PhaseEvent::Finish);
        first
    }
}

fn target(params: &PathParams) -> Result<(&str, &str), StatusError> {
    let get = |key: &str| {
        params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StatusError::bad_request(format!("missing path parameter {key:?}")))
    };
    Ok((get(NAMESPACE_PARAM)?, get(NAME_PARAM)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
