//! Device adapters.
//!
//! Each device kind is a flat binding of a validator, a dialer and a copy
//! strategy onto the shared [`Streamer`]. [`DeviceTunnels`] builds the
//! streamer for a request and runs it with the device's metric hooks.

use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::config::{FeatureGates, TunnelConfig};
use crate::dial::node_agent::{device_uri, port_forward_uri, vsock_uri};
use crate::dial::{Dial, NetworkDialer, NodeAgentDialer, NodeAgents, UriResolver};
use crate::error::StatusError;
use crate::instance::Instance;
use crate::metrics::TunnelMetrics;
use crate::resolver::{
    DirectResolver, FetchFn, InstanceSource, fetch_instance, fetch_instance_for_vm, validate_fn,
};
use crate::stream::{
    NAME_PARAM, NAMESPACE_PARAM, PORT_PARAM, PROTOCOL_PARAM, PathParams, Streamer, ping_pong,
};

const VMI_RESOURCE: &str = "virtualmachineinstance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Console,
    Vnc,
    Serial,
    UsbRedir,
    PortForward,
    Vsock,
    Ssh,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Console,
        DeviceKind::Vnc,
        DeviceKind::Serial,
        DeviceKind::UsbRedir,
        DeviceKind::PortForward,
        DeviceKind::Vsock,
        DeviceKind::Ssh,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Console => "console",
            DeviceKind::Vnc => "vnc",
            DeviceKind::Serial => "serial",
            DeviceKind::UsbRedir => "usbredir",
            DeviceKind::PortForward => "portforward",
            DeviceKind::Vsock => "vsock",
            DeviceKind::Ssh => "ssh",
        }
    }

    /// Kinds that stamp the last-API-connection gauge.
    pub fn records_last_connection(self) -> bool {
        matches!(self, DeviceKind::Vnc | DeviceKind::Console)
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

pub fn validate_vnc(vmi: &Instance) -> Result<(), StatusError> {
    if !vmi.has_graphics_device() {
        return Err(StatusError::bad_request("No graphics devices are present."));
    }
    if !vmi.is_running() {
        return Err(StatusError::bad_request("VMI is not running"));
    }
    Ok(())
}

pub fn validate_console(vmi: &Instance) -> Result<(), StatusError> {
    if !vmi.has_serial_console() {
        return Err(StatusError::bad_request("No serial consoles are present."));
    }
    if vmi.is_failed() {
        return Err(StatusError::conflict(
            VMI_RESOURCE,
            &vmi.name,
            "VMI is in failed status",
        ));
    }
    if !vmi.is_running() {
        return Err(StatusError::bad_request("VMI is not running"));
    }
    Ok(())
}

pub fn validate_usb_redir(vmi: &Instance) -> Result<(), StatusError> {
    if !vmi.has_usb_redirection() {
        return Err(StatusError::bad_request("Not configured with USB Redirection"));
    }
    if !vmi.is_running() {
        return Err(StatusError::bad_request("vmi not running"));
    }
    Ok(())
}

pub fn validate_port_forward(vmi: &Instance) -> Result<(), StatusError> {
    if vmi.is_paused() {
        return Err(StatusError::conflict(VMI_RESOURCE, &vmi.name, "VMI is paused"));
    }
    Ok(())
}

pub fn validate_vsock(vmi: &Instance) -> Result<(), StatusError> {
    if !vmi.has_vsock() {
        return Err(StatusError::bad_request("VSOCK is not enabled in this VMI"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Builds and runs the tunnel for each device kind.
#[derive(Clone)]
pub struct DeviceTunnels {
    source: Arc<dyn InstanceSource>,
    agents: Arc<NodeAgents>,
    metrics: Arc<TunnelMetrics>,
    tunnel: TunnelConfig,
    feature_gates: FeatureGates,
    shutdown: CancellationToken,
}

impl DeviceTunnels {
    pub fn new(
        source: Arc<dyn InstanceSource>,
        agents: Arc<NodeAgents>,
        metrics: Arc<TunnelMetrics>,
        tunnel: TunnelConfig,
        feature_gates: FeatureGates,
    ) -> Self {
        Self {
            source,
            agents,
            metrics,
            tunnel,
            feature_gates,
            shutdown: CancellationToken::new(),
        }
    }

    /// Every tunnel started afterwards ends when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn metrics(&self) -> &Arc<TunnelMetrics> {
        &self.metrics
    }

    pub fn console(&self) -> Streamer {
        self.raw(self.agent_resolver(validate_console, device_uri("console")))
    }

    pub fn vnc(&self) -> Streamer {
        self.raw(self.agent_resolver(validate_vnc, device_uri("vnc")))
    }

    pub fn serial(&self) -> Streamer {
        self.raw(self.agent_resolver(validate_console, device_uri("serial")))
    }

    pub fn usb_redir(&self) -> Streamer {
        self.raw(self.agent_resolver(validate_usb_redir, device_uri("usbredir")))
    }

    /// Forward to a guest port through the node agent. With `for_vm`, the
    /// name in `params` is a VM and its running instance is used.
    pub fn port_forward(&self, params: &PathParams, for_vm: bool) -> Streamer {
        let port = params.get(PORT_PARAM).cloned().unwrap_or_default();
        let protocol = params.get(PROTOCOL_PARAM).cloned();
        let fetch = if for_vm {
            fetch_instance_for_vm(Arc::clone(&self.source))
        } else {
            fetch_instance(Arc::clone(&self.source))
        };
        let dialer = NodeAgentDialer::new(Arc::clone(&self.agents), port_forward_uri(port, protocol));
        self.interactive(self.resolver(fetch, validate_port_forward, Arc::new(dialer)))
    }

    /// VSOCK channel through the node agent; refused while the feature
    /// gate is off.
    pub fn vsock(&self, port: u32, tls: bool) -> Result<Streamer, StatusError> {
        if !self.feature_gates.vsock {
            return Err(StatusError::bad_request(
                "'VSOCK' feature gate is not enabled",
            ));
        }
        Ok(self.interactive(self.agent_resolver(validate_vsock, vsock_uri(port, tls))))
    }

    /// Forward to a guest port straight over the instance's network.
    pub fn ssh(&self, params: &PathParams) -> Streamer {
        let dialer = NetworkDialer::new(
            params.get(PORT_PARAM).cloned(),
            params.get(PROTOCOL_PARAM).cloned(),
            self.agents.connect_timeout(),
        );
        let fetch = fetch_instance(Arc::clone(&self.source));
        self.interactive(self.resolver(fetch, validate_port_forward, Arc::new(dialer)))
    }

    /// Run `streamer` for one request under the device's metric hooks.
    pub async fn serve(
        &self,
        kind: DeviceKind,
        streamer: Streamer,
        params: PathParams,
        request: Request,
    ) -> Response {
        let namespace = params.get(NAMESPACE_PARAM).cloned().unwrap_or_default();
        let name = params.get(NAME_PARAM).cloned().unwrap_or_default();

        if kind.records_last_connection() {
            self.metrics.record_api_connection(&namespace, &name);
        }
        let guard = self.metrics.track(kind, &namespace, &name);

        let span = info_span!("tunnel", device = kind.as_str(), %namespace, %name);
        streamer
            .serve(params, request, guard)
            .instrument(span)
            .await
    }

    fn agent_resolver<V>(&self, validate: V, uri: UriResolver) -> DirectResolver
    where
        V: Fn(&Instance) -> Result<(), StatusError> + Send + Sync + 'static,
    {
        let dialer = NodeAgentDialer::new(Arc::clone(&self.agents), uri);
        self.resolver(fetch_instance(Arc::clone(&self.source)), validate, Arc::new(dialer))
    }

    fn resolver<V>(&self, fetch: FetchFn, validate: V, dial: Arc<dyn Dial>) -> DirectResolver
    where
        V: Fn(&Instance) -> Result<(), StatusError> + Send + Sync + 'static,
    {
        DirectResolver::new(fetch, validate_fn(validate), dial)
    }

    fn raw(&self, resolver: DirectResolver) -> Streamer {
        Streamer::raw(resolver, self.tunnel.copy_buffer_bytes)
            .with_handshake_timeout(self.tunnel.handshake_timeout())
            .with_parent(self.shutdown.clone())
    }

    fn interactive(&self, resolver: DirectResolver) -> Streamer {
        let keep_alive = ping_pong(self.tunnel.ping_interval(), self.tunnel.pong_wait());
        Streamer::interactive(resolver, self.tunnel.copy_buffer_bytes, keep_alive)
            .with_handshake_timeout(self.tunnel.handshake_timeout())
            .with_parent(self.shutdown.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusKind;
    use crate::instance::{ClientPassthrough, PAUSED_CONDITION, Phase};

    fn running() -> Instance {
        Instance::new("default", "testvmi").with_phase(Phase::Running)
    }

    fn rejects(result: Result<(), StatusError>, kind: StatusKind, message: &str) {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), kind);
        assert!(
            err.message().contains(message),
            "{:?} does not mention {message:?}",
            err.message()
        );
    }

    #[test]
    fn vnc_requires_a_graphics_device() {
        let mut vmi = running();
        assert!(validate_vnc(&vmi).is_ok());

        vmi.spec.devices.autoattach_graphics_device = Some(false);
        rejects(validate_vnc(&vmi), StatusKind::BadRequest, "No graphics devices are present.");
    }

    #[test]
    fn console_checks_device_then_phase() {
        let mut vmi = running();
        assert!(validate_console(&vmi).is_ok());

        vmi.spec.devices.autoattach_serial_console = Some(false);
        rejects(validate_console(&vmi), StatusKind::BadRequest, "No serial consoles are present.");

        let failed = Instance::new("default", "testvmi").with_phase(Phase::Failed);
        rejects(validate_console(&failed), StatusKind::Conflict, "VMI is in failed status");

        let pending = Instance::new("default", "testvmi");
        rejects(validate_console(&pending), StatusKind::BadRequest, "VMI is not running");
    }

    #[test]
    fn usb_redirection_needs_passthrough_and_a_running_vmi() {
        rejects(
            validate_usb_redir(&running()),
            StatusKind::BadRequest,
            "Not configured with USB Redirection",
        );

        let mut scheduled = Instance::new("default", "testvmi").with_phase(Phase::Scheduled);
        scheduled.spec.devices.client_passthrough = Some(ClientPassthrough {});
        rejects(validate_usb_redir(&scheduled), StatusKind::BadRequest, "vmi not running");

        let mut vmi = running();
        vmi.spec.devices.client_passthrough = Some(ClientPassthrough {});
        assert!(validate_usb_redir(&vmi).is_ok());
    }

    #[test]
    fn port_forward_refuses_paused_instances() {
        assert!(validate_port_forward(&running()).is_ok());

        let paused = running().with_condition(PAUSED_CONDITION, true);
        rejects(validate_port_forward(&paused), StatusKind::Conflict, "VMI is paused");
    }

    #[test]
    fn vsock_must_be_attached() {
        rejects(
            validate_vsock(&running()),
            StatusKind::BadRequest,
            "VSOCK is not enabled in this VMI",
        );

        let mut vmi = running();
        vmi.spec.devices.autoattach_vsock = Some(true);
        assert!(validate_vsock(&vmi).is_ok());
    }

    #[test]
    fn every_kind_has_a_distinct_name() {
        let mut names: Vec<_> = DeviceKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DeviceKind::ALL.len());
    }
}
