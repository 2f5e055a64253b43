//! Node-agent dialer.
//!
//! Every compute node runs an agent that exposes the device channels of the
//! instances it hosts. A device endpoint lives at
//! `/v1/namespaces/{ns}/virtualmachineinstances/{name}/{device}`; a `GET`
//! carrying `Upgrade: vmstream` is answered with `101 Switching Protocols`
//! and the connection becomes the raw device stream.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, StatusCode, header};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use super::{Dial, RawConn};
use crate::config::{NodeAgentConfig, TlsPaths};
use crate::error::StatusError;
use crate::instance::Instance;

/// Protocol token the agent switches to.
pub const UPGRADE_PROTOCOL: &str = "vmstream";

/// `resolve(agent, instance) -> device endpoint URI`
pub type UriResolver =
    Arc<dyn Fn(&AgentEndpoint, &Instance) -> Result<Url, StatusError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Agent location
// ---------------------------------------------------------------------------

/// The agent serving one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub node: String,
    pub base: Url,
}

impl AgentEndpoint {
    /// `<base>/v1/namespaces/{ns}/virtualmachineinstances/{name}/{subpath}`
    pub fn instance_uri(&self, instance: &Instance, subpath: &str) -> Result<Url, StatusError> {
        self.base
            .join(&format!(
                "v1/namespaces/{}/virtualmachineinstances/{}/{}",
                instance.namespace, instance.name, subpath
            ))
            .map_err(|e| StatusError::internal(format!("building agent URI: {e}")))
    }
}

/// Plain device endpoint (`console`, `vnc`, `serial`, `usbredir`).
pub fn device_uri(device: &'static str) -> UriResolver {
    Arc::new(
        move |agent: &AgentEndpoint, instance: &Instance| -> Result<Url, StatusError> {
            agent.instance_uri(instance, device)
        },
    )
}

/// `portforward/{port}/{protocol}`, protocol defaulting to `tcp`.
pub fn port_forward_uri(port: String, protocol: Option<String>) -> UriResolver {
    Arc::new(move |agent: &AgentEndpoint, instance: &Instance| -> Result<Url, StatusError> {
        let protocol = protocol.as_deref().filter(|p| !p.is_empty()).unwrap_or("tcp");
        agent.instance_uri(instance, &format!("portforward/{port}/{protocol}"))
    })
}

/// `vsock?port=<port>&tls=<tls>`
pub fn vsock_uri(port: u32, tls: bool) -> UriResolver {
    Arc::new(move |agent: &AgentEndpoint, instance: &Instance| -> Result<Url, StatusError> {
        let mut uri = agent.instance_uri(instance, "vsock")?;
        uri.query_pairs_mut()
            .append_pair("port", &port.to_string())
            .append_pair("tls", &tls.to_string());
        Ok(uri)
    })
}

/// Node → agent address book plus the transport used to reach agents.
pub struct NodeAgents {
    hosts: HashMap<String, String>,
    port: u16,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl NodeAgents {
    pub fn new(
        hosts: HashMap<String, String>,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            hosts,
            port,
            tls: tls.map(TlsConnector::from),
            connect_timeout,
        }
    }

    pub fn from_config(config: &NodeAgentConfig) -> anyhow::Result<Self> {
        let tls = config.tls.as_ref().map(load_client_config).transpose()?;
        Ok(Self::new(
            config.nodes.clone(),
            config.port,
            tls,
            config.connect_timeout(),
        ))
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Find the agent on the node currently hosting `instance`.
    pub fn locate(&self, instance: &Instance) -> Result<AgentEndpoint, StatusError> {
        if !instance.is_running() {
            return Err(StatusError::bad_request(format!(
                "Unable to connect to VirtualMachineInstance because phase is {:?} instead of Running",
                instance.status.phase
            )));
        }
        let node = instance
            .status
            .node_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                StatusError::bad_request(format!(
                    "virtualmachineinstance {}/{} has not been assigned a node",
                    instance.namespace, instance.name
                ))
            })?;
        let host = self.hosts.get(node).ok_or_else(|| {
            StatusError::bad_request(format!("unable to locate the agent on node {node}"))
        })?;

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{host}:{}/", self.port)).map_err(|e| {
            StatusError::bad_request(format!("invalid agent address for node {node}: {e}"))
        })?;

        Ok(AgentEndpoint {
            node: node.to_owned(),
            base,
        })
    }

    /// Open `uri` and switch it to a raw stream.
    pub async fn connect(&self, uri: &Url) -> Result<RawConn, StatusError> {
        tokio::time::timeout(self.connect_timeout, self.connect_inner(uri))
            .await
            .map_err(|_| StatusError::internal(format!("dialing agent: {uri} timed out")))?
    }

    async fn connect_inner(&self, uri: &Url) -> Result<RawConn, StatusError> {
        let host = uri
            .host_str()
            .ok_or_else(|| StatusError::internal(format!("agent URI {uri} has no host")))?;
        let port = uri.port_or_known_default().unwrap_or(self.port);

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| StatusError::internal(format!("dialing agent {host}:{port}: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| StatusError::internal(format!("dialing agent {host}:{port}: {e}")))?;

        match &self.tls {
            Some(connector) => {
                let server_name = ServerName::try_from(host.to_owned())
                    .map_err(|e| StatusError::internal(format!("agent server name {host}: {e}")))?;
                let stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| StatusError::internal(format!("TLS handshake with agent {host}: {e}")))?;
                upgrade(stream, uri).await
            }
            None => upgrade(tcp, uri).await,
        }
    }
}

/// Send the upgrade request over `stream` and unwrap the switched connection.
async fn upgrade<S>(stream: S, uri: &Url) -> Result<RawConn, StatusError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let fail = |e: &dyn std::fmt::Display| StatusError::internal(format!("dialing agent: {e}"));

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| fail(&e))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "agent connection closed");
        }
    });

    let authority = match (uri.host_str(), uri.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => return Err(fail(&"missing host")),
    };
    let request = Request::get(&uri[url::Position::BeforePath..])
        .header(header::HOST, authority)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())
        .map_err(|e| fail(&e))?;

    let response = sender.send_request(request).await.map_err(|e| fail(&e))?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(fail(&format!(
            "agent answered {} instead of switching protocols",
            response.status()
        )));
    }

    let upgraded = hyper::upgrade::on(response).await.map_err(|e| fail(&e))?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

/// Load the mutual-TLS client configuration for agent connections.
pub fn load_client_config(paths: &TlsPaths) -> anyhow::Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&paths.ca)? {
        roots
            .add(cert)
            .with_context(|| format!("adding CA certificate from {}", paths.ca.display()))?;
    }

    let certs = read_certs(&paths.cert)?;
    let mut reader = BufReader::new(
        File::open(&paths.key).with_context(|| format!("opening {}", paths.key.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("reading {}", paths.key.display()))?
        .with_context(|| format!("no private key in {}", paths.key.display()))?;

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .context("selecting TLS protocol versions")?
    .with_root_certificates(roots)
    .with_client_auth_cert(certs, key)
    .context("loading agent client certificate")?;

    Ok(Arc::new(config))
}

fn read_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader =
        BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading certificates from {}", path.display()))
}

// ---------------------------------------------------------------------------
// Dialer
// ---------------------------------------------------------------------------

/// Dials one device endpoint on the instance's node agent.
#[derive(Clone)]
pub struct NodeAgentDialer {
    agents: Arc<NodeAgents>,
    uri: UriResolver,
}

impl NodeAgentDialer {
    pub fn new(agents: Arc<NodeAgents>, uri: UriResolver) -> Self {
        Self { agents, uri }
    }
}

impl Dial for NodeAgentDialer {
    fn dial<'a>(&'a self, instance: &'a Instance) -> BoxFuture<'a, Result<RawConn, StatusError>> {
        Box::pin(async move {
            let agent = self.agents.locate(instance)?;
            let uri = (self.uri)(&agent, instance)?;
            debug!(node = %agent.node, %uri, "Dialing node agent");
            self.agents.connect(&uri).await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
