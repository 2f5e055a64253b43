//! Direct guest-network dialer.
//!
//! Connects to `<first interface address>:<port>` of the instance. Used by
//! the SSH-style forward, where the guest port is reachable from the API
//! server's network.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::{Dial, RawConn};
use crate::error::StatusError;
use crate::instance::Instance;

const DEFAULT_PROTOCOL: &str = "tcp";

/// Dials a guest port over the instance's first network interface.
#[derive(Debug, Clone)]
pub struct NetworkDialer {
    port: Option<String>,
    protocol: Option<String>,
    connect_timeout: Duration,
}

impl NetworkDialer {
    /// `port` is required at dial time; `protocol` defaults to `tcp`.
    pub fn new(port: Option<String>, protocol: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            port,
            protocol,
            connect_timeout,
        }
    }

    fn target(&self, instance: &Instance) -> Result<(Protocol, String), StatusError> {
        let port = self
            .port
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| StatusError::bad_request("port must not be empty"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| StatusError::bad_request(format!("invalid port {port:?}")))?;

        let protocol = match self.protocol.as_deref().filter(|p| !p.is_empty()) {
            None | Some(DEFAULT_PROTOCOL) => Protocol::Tcp,
            Some("udp") => Protocol::Udp,
            Some(other) => {
                return Err(StatusError::bad_request(format!(
                    "unsupported protocol {other:?}"
                )));
            }
        };

        if instance.status.interfaces.is_empty() {
            return Err(StatusError::bad_request("no network interfaces are present"));
        }
        let address = instance.first_interface_address().ok_or_else(|| {
            StatusError::bad_request("no address reported for the first network interface")
        })?;

        Ok((protocol, join_host_port(address, port)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Udp,
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl Dial for NetworkDialer {
    fn dial<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, Result<RawConn, StatusError>> {
        Box::pin(async move {
            let (protocol, target) = self.target(instance)?;
            debug!(namespace = %instance.namespace, name = %instance.name, %target, ?protocol, "Dialing VM");

            let connect = async {
                match protocol {
                    Protocol::Tcp => {
                        let stream = TcpStream::connect(&target).await?;
                        stream.set_nodelay(true)?;
                        Ok::<RawConn, io::Error>(Box::new(stream))
                    }
                    Protocol::Udp => Ok(Box::new(UdpStream::connect(&target).await?) as RawConn),
                }
            };

            match tokio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(e)) => Err(StatusError::internal(format!("dialing VM: {e}"))),
                Err(_) => Err(StatusError::internal(format!(
                    "dialing VM: connection to {target} timed out"
                ))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// UDP as a byte stream
// ---------------------------------------------------------------------------

/// A connected UDP socket; every write is one datagram, every read one
/// received datagram.
#[derive(Debug)]
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    pub async fn connect(target: &str) -> io::Result<Self> {
        let bind = if target.starts_with('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        Ok(Self { socket })
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
