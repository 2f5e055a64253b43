//! Server-side connection strategies.
//!
//! A dialer turns a validated [`Instance`] into a raw bidirectional byte
//! stream to the device behind it:
//!
//! - [`NetworkDialer`]: straight to the guest over its first reported
//!   network interface (TCP or UDP).
//! - [`NodeAgentDialer`]: through the agent on the compute node hosting the
//!   instance, which exposes the device channel over an upgraded HTTP/1.1
//!   connection (mutual TLS when configured).

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::StatusError;
use crate::instance::Instance;

pub mod network;
pub mod node_agent;

pub use network::NetworkDialer;
pub use node_agent::{AgentEndpoint, NodeAgentDialer, NodeAgents, UriResolver};

/// Any async byte stream usable as a tunnel endpoint.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A dialed server-side connection.
pub type RawConn = Box<dyn RawStream>;

/// `dial(instance) -> RawConn | BadRequest | Internal`
pub trait Dial: Send + Sync {
    fn dial<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, Result<RawConn, StatusError>>;
}
