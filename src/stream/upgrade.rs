//! Server side of the WebSocket opening handshake.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use super::ResponseWriter;
use super::conn::ClientSocket;
use crate::error::UpgradeError;

/// Subprotocol selected when the client offers it.
pub const PLAIN_STREAM_PROTOCOL: &str = "plain.vmstream.io";

/// Check the opening handshake and build the `101 Switching Protocols`
/// answer. Nothing is written.
pub fn accept(req: &Request) -> Result<Response, UpgradeError> {
    let headers = req.headers();
    if !header_has_token(headers, header::CONNECTION, "upgrade") {
        return Err(UpgradeError::NotWebSocket(
            "'upgrade' token not found in 'Connection' header",
        ));
    }
    if !header_has_token(headers, header::UPGRADE, "websocket") {
        return Err(UpgradeError::NotWebSocket(
            "'websocket' token not found in 'Upgrade' header",
        ));
    }
    if req.method() != Method::GET {
        return Err(UpgradeError::Method);
    }
    if !header_has_token(headers, header::SEC_WEBSOCKET_VERSION, "13") {
        return Err(UpgradeError::UnsupportedVersion);
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(HeaderValue::as_bytes)
        .filter(|k| !k.is_empty())
        .ok_or(UpgradeError::MissingKey)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let out = response.headers_mut();
    out.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    out.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    if let Ok(accept_key) = HeaderValue::from_str(&derive_accept_key(key)) {
        out.insert(header::SEC_WEBSOCKET_ACCEPT, accept_key);
    }
    if header_has_token(headers, header::SEC_WEBSOCKET_PROTOCOL, PLAIN_STREAM_PROTOCOL) {
        out.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PLAIN_STREAM_PROTOCOL),
        );
    }
    Ok(response)
}

/// Answer the handshake through `response` and wait for the connection to
/// switch, at most `timeout`.
pub async fn upgrade(
    mut req: Request,
    response: &mut ResponseWriter,
    timeout: Duration,
) -> Result<ClientSocket, UpgradeError> {
    let accepted = accept(&req)?;
    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(UpgradeError::NotUpgradable)?;

    response.write(accepted);

    let upgraded = tokio::time::timeout(timeout, on_upgrade)
        .await
        .map_err(|_| UpgradeError::HandshakeTimeout(timeout))??;
    Ok(ClientSocket::from_raw(Box::new(TokioIo::new(upgraded))).await)
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> http::request::Builder {
        http::Request::builder()
            .method(Method::GET)
            .uri("/apis/subresources.vmstream.io/v1/namespaces/default/virtualmachineinstances/testvmi/vnc")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[test]
    fn accepts_a_websocket_handshake() {
        let req = handshake().body(Body::empty()).unwrap();
        let response = accept(&req).unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn selects_the_plain_stream_protocol() {
        let req = handshake()
            .header(header::SEC_WEBSOCKET_PROTOCOL, "base64.vmstream.io, plain.vmstream.io")
            .body(Body::empty())
            .unwrap();
        let response = accept(&req).unwrap();

        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_PROTOCOL],
            PLAIN_STREAM_PROTOCOL
        );
    }

    #[test]
    fn plain_http_is_not_a_websocket() {
        let req = http::Request::builder()
            .uri("/vnc")
            .body(Body::empty())
            .unwrap();
        let err = accept(&req).unwrap_err();

        assert!(matches!(err, UpgradeError::NotWebSocket(_)));
        assert!(
            err.to_string()
                .starts_with("the client is not using the websocket protocol")
        );
    }

    #[test]
    fn handshake_requirements() {
        let post = handshake().method(Method::POST).body(Body::empty()).unwrap();
        assert!(matches!(accept(&post), Err(UpgradeError::Method)));

        let mut old = handshake().body(Body::empty()).unwrap();
        old.headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert!(matches!(accept(&old), Err(UpgradeError::UnsupportedVersion)));

        let mut keyless = handshake().body(Body::empty()).unwrap();
        keyless.headers_mut().remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(accept(&keyless), Err(UpgradeError::MissingKey)));
    }

    #[tokio::test]
    async fn request_without_connection_cannot_upgrade() {
        let (mut writer, mut slot) = ResponseWriter::channel();
        let req = handshake().body(Body::empty()).unwrap();

        let err = match upgrade(req, &mut writer, Duration::from_secs(10)).await {
            Err(err) => err,
            Ok(_) => panic!("upgrade should fail"),
        };
        assert!(matches!(err, UpgradeError::NotUpgradable));
        assert!(slot.try_recv().is_err());
    }
}
