//! Error types for the device-access tunnel.
//!
//! Failures before the protocol switch are classified ([`StatusError`]) and
//! written back to the client as an HTTP status. Failures after the switch
//! ([`StreamError`]) can only end the tunnel; they surface as the value
//! returned by [`crate::stream::Streamer::handle`], which the caller logs.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio_tungstenite::tungstenite;

// ---------------------------------------------------------------------------
// Classified errors
// ---------------------------------------------------------------------------

/// HTTP-style classification of a fetch, validate or dial failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// The instance (or the VM owning it) does not exist.
    NotFound,
    /// Malformed request, unattached device, missing parameter.
    BadRequest,
    /// The instance state precludes the operation.
    Conflict,
    /// Transport or datastore failure.
    Internal,
}

impl StatusKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            StatusKind::NotFound => StatusCode::NOT_FOUND,
            StatusKind::BadRequest => StatusCode::BAD_REQUEST,
            StatusKind::Conflict => StatusCode::CONFLICT,
            StatusKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason placed in the status body.
    pub fn reason(self) -> &'static str {
        match self {
            StatusKind::NotFound => "NotFound",
            StatusKind::BadRequest => "BadRequest",
            StatusKind::Conflict => "Conflict",
            StatusKind::Internal => "InternalError",
        }
    }
}

/// A tagged error carrying an HTTP status classification and a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StatusError {
    kind: StatusKind,
    message: String,
}

impl StatusError {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// `<resource> "<name>" not found`
    pub fn not_found(resource: &str, name: &str) -> Self {
        Self::new(
            StatusKind::NotFound,
            format!("{resource} \"{name}\" not found"),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusKind::BadRequest, message)
    }

    /// `Operation cannot be fulfilled on <resource> "<name>": <reason>`
    pub fn conflict(resource: &str, name: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            StatusKind::Conflict,
            format!("Operation cannot be fulfilled on {resource} \"{name}\": {reason}"),
        )
    }

    /// `Internal error occurred: <reason>`
    pub fn internal(reason: impl std::fmt::Display) -> Self {
        Self::new(
            StatusKind::Internal,
            format!("Internal error occurred: {reason}"),
        )
    }

    pub fn kind(&self) -> StatusKind {
        self.kind
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// JSON status body written for a classified error.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    kind: &'static str,
    api_version: &'static str,
    status: &'static str,
    message: &'a str,
    reason: &'static str,
    code: u16,
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(StatusBody {
            kind: "Status",
            api_version: "v1",
            status: "Failure",
            message: &self.message,
            reason: self.kind.reason(),
            code: status.as_u16(),
        });
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Upgrade and relay errors
// ---------------------------------------------------------------------------

/// The inbound request could not be switched to a WebSocket.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("the client is not using the websocket protocol: {0}")]
    NotWebSocket(&'static str),
    #[error("websocket: unsupported version: 13 not found in 'Sec-Websocket-Version' header")]
    UnsupportedVersion,
    #[error("websocket: not a websocket handshake: 'Sec-WebSocket-Key' header is missing or blank")]
    MissingKey,
    #[error("websocket: request method is not GET")]
    Method,
    #[error("websocket: connection does not support upgrades")]
    NotUpgradable,
    #[error("websocket: handshake did not complete within {0:?}")]
    HandshakeTimeout(std::time::Duration),
    #[error("websocket: upgrade failed: {0}")]
    Hyper(#[from] hyper::Error),
}

/// An untyped mid-stream failure. Always fatal to the tunnel.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
    #[error("use of closed connection")]
    Closed,
    #[error("read deadline exceeded")]
    DeadlineExceeded,
    #[error("unexpected websocket frame: {0}")]
    UnexpectedFrame(&'static str),
}

/// The terminal result of one tunnel request.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn status_error_codes() {
        let cases = [
            (
                StatusError::not_found("virtualmachineinstance", "x"),
                StatusCode::NOT_FOUND,
            ),
            (StatusError::bad_request("x"), StatusCode::BAD_REQUEST),
            (
                StatusError::conflict("virtualmachineinstance", "x", "VMI is paused"),
                StatusCode::CONFLICT,
            ),
            (
                StatusError::internal("x"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.status_code(), expected);
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn conflict_message_names_the_resource() {
        let err = StatusError::conflict("virtualmachineinstance", "testvmi", "VMI is paused");
        assert_eq!(
            err.to_string(),
            "Operation cannot be fulfilled on virtualmachineinstance \"testvmi\": VMI is paused"
        );
    }

    #[tokio::test]
    async fn status_body_is_json() {
        let response = StatusError::bad_request("No graphics devices are present.").into_response();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["kind"], "Status");
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["reason"], "BadRequest");
        assert_eq!(value["code"], 400);
        assert_eq!(value["message"], "No graphics devices are present.");
    }

    #[test]
    fn tunnel_error_is_transparent() {
        let err = TunnelError::from(StatusError::bad_request("vmi not running"));
        assert_eq!(err.to_string(), "vmi not running");

        let err = TunnelError::from(UpgradeError::NotWebSocket(
            "'upgrade' token not found in 'Connection' header",
        ));
        assert!(err.to_string().contains("the client is not using the websocket protocol"));
    }
}
