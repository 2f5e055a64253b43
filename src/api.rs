//! HTTP surface.
//!
//! Every device route resolves to one [`DeviceTunnels`] adapter. Handlers
//! never fail on their own: refusals and tunnel errors are rendered as
//! status bodies by the tunnel itself.

use std::collections::HashMap;

use axum::Router;
use axum::extract::{Path, Query, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::header;

use crate::device::{DeviceKind, DeviceTunnels};
use crate::error::StatusError;
use crate::stream::PathParams;

/// Route prefix shared by every subresource.
pub const API_PREFIX: &str = "/apis/subresources.vmstream.io/v1/namespaces/{namespace}";

#[derive(Clone)]
pub struct AppState {
    pub tunnels: DeviceTunnels,
}

impl AppState {
    pub fn new(tunnels: DeviceTunnels) -> Self {
        Self { tunnels }
    }
}

/// Build the router with all endpoints.
pub fn router(state: AppState) -> Router {
    let vmi = |suffix: &str| format!("{API_PREFIX}/virtualmachineinstances/{{name}}/{suffix}");
    let vm = |suffix: &str| format!("{API_PREFIX}/virtualmachines/{{name}}/{suffix}");

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(&vmi("console"), get(console))
        .route(&vmi("vnc"), get(vnc))
        .route(&vmi("serial"), get(serial))
        .route(&vmi("usbredir"), get(usb_redir))
        .route(&vmi("vsock"), get(vsock))
        .route(&vmi("portforward/{port}"), get(port_forward))
        .route(&vmi("portforward/{port}/{protocol}"), get(port_forward))
        .route(&vmi("ssh/{port}"), get(ssh))
        .route(&vmi("ssh/{port}/{protocol}"), get(ssh))
        .route(&vm("portforward/{port}"), get(vm_port_forward))
        .route(&vm("portforward/{port}/{protocol}"), get(vm_port_forward))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.tunnels.metrics().render(),
    )
        .into_response()
}

async fn console(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    tunnels
        .serve(DeviceKind::Console, tunnels.console(), params, request)
        .await
}

async fn vnc(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    tunnels
        .serve(DeviceKind::Vnc, tunnels.vnc(), params, request)
        .await
}

async fn serial(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    tunnels
        .serve(DeviceKind::Serial, tunnels.serial(), params, request)
        .await
}

async fn usb_redir(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    tunnels
        .serve(DeviceKind::UsbRedir, tunnels.usb_redir(), params, request)
        .await
}

async fn port_forward(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    let streamer = tunnels.port_forward(&params, false);
    tunnels
        .serve(DeviceKind::PortForward, streamer, params, request)
        .await
}

async fn vm_port_forward(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    let streamer = tunnels.port_forward(&params, true);
    tunnels
        .serve(DeviceKind::PortForward, streamer, params, request)
        .await
}

async fn ssh(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    let streamer = tunnels.ssh(&params);
    tunnels
        .serve(DeviceKind::Ssh, streamer, params, request)
        .await
}

async fn vsock(
    State(state): State<AppState>,
    Path(params): Path<PathParams>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let tunnels = &state.tunnels;
    let streamer = match vsock_params(&query).and_then(|(port, tls)| tunnels.vsock(port, tls)) {
        Ok(streamer) => streamer,
        Err(e) => return e.into_response(),
    };
    tunnels
        .serve(DeviceKind::Vsock, streamer, params, request)
        .await
}

/// `port` is required; `tls` defaults to true.
fn vsock_params(query: &HashMap<String, String>) -> Result<(u32, bool), StatusError> {
    let port = query
        .get("port")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| StatusError::bad_request("port parameter is required"))?;
    let port = port
        .parse::<u32>()
        .map_err(|e| StatusError::bad_request(format!("invalid port {port:?}: {e}")))?;

    let tls = match query.get("tls").map(String::as_str) {
        None | Some("") => true,
        Some(tls) => tls
            .parse::<bool>()
            .map_err(|e| StatusError::bad_request(format!("invalid tls {tls:?}: {e}")))?,
    };
    Ok((port, tls))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusKind;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn vsock_port_is_required() {
        let err = vsock_params(&query(&[])).unwrap_err();
        assert_eq!(err.kind(), StatusKind::BadRequest);

        let err = vsock_params(&query(&[("port", "")])).unwrap_err();
        assert_eq!(err.kind(), StatusKind::BadRequest);
    }

    #[test]
    fn vsock_port_must_be_u32() {
        for bad in ["-1", "4294967296", "abc"] {
            let err = vsock_params(&query(&[("port", bad)])).unwrap_err();
            assert_eq!(err.kind(), StatusKind::BadRequest, "port {bad}");
        }
        assert_eq!(
            vsock_params(&query(&[("port", "4294967295")])).unwrap(),
            (u32::MAX, true)
        );
    }

    #[test]
    fn vsock_tls_defaults_to_true() {
        assert_eq!(vsock_params(&query(&[("port", "1024")])).unwrap(), (1024, true));
        assert_eq!(
            vsock_params(&query(&[("port", "1024"), ("tls", "false")])).unwrap(),
            (1024, false)
        );
        let err = vsock_params(&query(&[("port", "1024"), ("tls", "maybe")])).unwrap_err();
        assert_eq!(err.kind(), StatusKind::BadRequest);
    }
}
