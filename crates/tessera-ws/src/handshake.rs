//! HTTP upgrade handshake (RFC 6455 §4.2).
//!
//! The HTTP layer hands over a parsed request; this module extracts what
//! negotiation needs into an [`UpgradeRequest`], computes the accept key
//! and builds the `101` or `400` response. Responses are assembled through
//! `headers_mut` so no builder can fail at runtime.

use base64::Engine;
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use sha1::{Digest, Sha1};

use crate::compression::{offers_deflate, CompressionMethod, PERMESSAGE_DEFLATE_RESPONSE};
use crate::error::{WsError, WsResult};

/// The GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

const SEC_WEBSOCKET_KEY: HeaderName = HeaderName::from_static("sec-websocket-key");
const SEC_WEBSOCKET_VERSION: HeaderName = HeaderName::from_static("sec-websocket-version");
const SEC_WEBSOCKET_PROTOCOL: HeaderName = HeaderName::from_static("sec-websocket-protocol");
const SEC_WEBSOCKET_ACCEPT: HeaderName = HeaderName::from_static("sec-websocket-accept");
const SEC_WEBSOCKET_EXTENSIONS: HeaderName = HeaderName::from_static("sec-websocket-extensions");

/// HTTP response type produced by the handshake.
pub type HandshakeResponse = Response<Full<Bytes>>;

/// Compute `Sec-WebSocket-Accept` for a client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Whether `name` is a non-empty RFC 2616 token.
pub fn is_valid_token(name: &str) -> bool {
    const SEPARATORS: &[u8] = b"()<>@,;:\\\"/[]?={} \t";
    !name.is_empty()
        && name
            .bytes()
            .all(|b| (0x21..0x7f).contains(&b) && !SEPARATORS.contains(&b))
}

/// Pick the subprotocol for a connection.
///
/// With no supported protocols, only clients that request none are
/// accepted. Otherwise the first requested protocol that is supported wins.
/// `None` means reject.
pub fn negotiate_protocol(requested: &[String], supported: &[String]) -> Option<Option<String>> {
    if supported.is_empty() {
        return requested.is_empty().then_some(None);
    }
    requested
        .iter()
        .find(|protocol| supported.contains(protocol))
        .map(|protocol| Some(protocol.clone()))
}

/// The parts of an upgrade request that negotiation looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path.
    pub path: String,
    /// `Connection` header.
    pub connection: Option<String>,
    /// `Upgrade` header.
    pub upgrade: Option<String>,
    /// `Sec-WebSocket-Version` header.
    pub version: Option<String>,
    /// `Sec-WebSocket-Key` header.
    pub key: Option<String>,
    /// Requested subprotocols, in client order.
    pub protocols: Vec<String>,
    /// Offered extensions, one entry per comma-separated offer.
    pub extensions: Vec<String>,
}

impl UpgradeRequest {
    /// Capture the handshake headers of `request`.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let headers = request.headers();
        let single = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        Self {
            path: request.uri().path().to_string(),
            connection: single(&header::CONNECTION),
            upgrade: single(&header::UPGRADE),
            version: single(&SEC_WEBSOCKET_VERSION),
            key: single(&SEC_WEBSOCKET_KEY),
            protocols: split_list(headers.get_all(&SEC_WEBSOCKET_PROTOCOL)),
            extensions: split_list(headers.get_all(&SEC_WEBSOCKET_EXTENSIONS)),
        }
    }

    /// Whether the request asks for a WebSocket upgrade at all.
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self.connection.as_deref().is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        let upgrade_websocket = self
            .upgrade
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        connection_upgrade && upgrade_websocket
    }

    /// Check the handshake headers and return the accept key.
    pub fn validate(&self) -> WsResult<String> {
        if !self.is_upgrade() {
            return Err(WsError::handshake_failed(
                "missing Connection: Upgrade or Upgrade: websocket header",
            ));
        }
        if self.version.as_deref() != Some(WEBSOCKET_VERSION) {
            return Err(WsError::handshake_failed(format!(
                "unsupported Sec-WebSocket-Version {:?}, expected {WEBSOCKET_VERSION}",
                self.version.as_deref().unwrap_or("")
            )));
        }
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => Ok(compute_accept_key(key)),
            _ => Err(WsError::handshake_failed("missing Sec-WebSocket-Key header")),
        }
    }

    /// Whether the client offered permessage-deflate.
    pub fn offers_deflate(&self) -> bool {
        self.extensions.iter().any(|ext| offers_deflate(ext))
    }
}

/// The outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Endpoint path.
    pub path: String,
    /// `Sec-WebSocket-Accept` value.
    pub accept_key: String,
    /// Selected subprotocol.
    pub protocol: Option<String>,
    /// Compression in effect for the connection.
    pub compression: CompressionMethod,
}

impl Handshake {
    /// The `101 Switching Protocols` response for this handshake.
    pub fn response(&self) -> HandshakeResponse {
        switching_protocols_response(&self.accept_key, self.protocol.as_deref(), self.compression)
    }
}

/// Build a `101 Switching Protocols` response.
pub fn switching_protocols_response(
    accept_key: &str,
    protocol: Option<&str>,
    compression: CompressionMethod,
) -> HandshakeResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(accept_key) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    if let Some(value) = protocol.and_then(|p| HeaderValue::from_str(p).ok()) {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    if compression == CompressionMethod::Deflate {
        headers.insert(
            SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static(PERMESSAGE_DEFLATE_RESPONSE),
        );
    }
    response
}

/// Build a `400 Bad Request` listing every supported subprotocol.
pub fn bad_request_response(reason: &str, supported_protocols: &[String]) -> HandshakeResponse {
    let mut response = plain_response(StatusCode::BAD_REQUEST, reason);
    let headers = response.headers_mut();
    for value in supported_protocols
        .iter()
        .filter_map(|p| HeaderValue::from_str(p).ok())
    {
        headers.append(SEC_WEBSOCKET_PROTOCOL, value);
    }
    response
}

/// A plain-text response with the given status.
pub fn plain_response(status: StatusCode, body: &str) -> HandshakeResponse {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn split_list(values: header::GetAll<'_, HeaderValue>) -> Vec<String> {
    values
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::request::Builder {
        Request::builder()
            .uri("/chat")
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compute_accept_key() {
        // RFC 6455 §1.3 example
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_from_request_splits_protocols() {
        let req = request()
            .header("Sec-WebSocket-Protocol", "foo, echo")
            .header("Sec-WebSocket-Protocol", " ,chat ")
            .body(())
            .unwrap();
        let upgrade = UpgradeRequest::from_request(&req);
        assert_eq!(upgrade.path, "/chat");
        assert_eq!(upgrade.protocols, strings(&["foo", "echo", "chat"]));
        assert!(upgrade.is_upgrade());
        assert_eq!(upgrade.validate().unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let req = Request::builder()
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "8")
            .header("Sec-WebSocket-Key", "abc")
            .body(())
            .unwrap();
        let err = UpgradeRequest::from_request(&req).validate().unwrap_err();
        assert!(err.to_string().contains("Sec-WebSocket-Version"));
    }

    #[test]
    fn test_validate_rejects_missing_key() {
        let req = Request::builder()
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .body(())
            .unwrap();
        let err = UpgradeRequest::from_request(&req).validate().unwrap_err();
        assert!(err.to_string().contains("Sec-WebSocket-Key"));
    }

    #[test]
    fn test_not_an_upgrade() {
        let req = Request::builder().uri("/chat").body(()).unwrap();
        assert!(!UpgradeRequest::from_request(&req).is_upgrade());
    }

    #[test]
    fn test_negotiate_protocol() {
        let supported = strings(&["chat", "echo"]);
        assert_eq!(
            negotiate_protocol(&strings(&["foo", "echo"]), &supported),
            Some(Some("echo".to_string()))
        );
        assert_eq!(
            negotiate_protocol(&strings(&["echo", "chat"]), &supported),
            Some(Some("echo".to_string()))
        );
        assert_eq!(negotiate_protocol(&strings(&["foo"]), &supported), None);
        assert_eq!(negotiate_protocol(&[], &supported), None);
        assert_eq!(negotiate_protocol(&[], &[]), Some(None));
        assert_eq!(negotiate_protocol(&strings(&["chat"]), &[]), None);
    }

    #[test]
    fn test_is_valid_token() {
        assert!(is_valid_token("chat"));
        assert!(is_valid_token("v2.json-rpc"));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token("two words"));
        assert!(!is_valid_token("a,b"));
        assert!(!is_valid_token("caf\u{e9}"));
    }

    #[test]
    fn test_bad_request_lists_protocols() {
        let response = bad_request_response("no match", &strings(&["chat", "echo"]));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let values: Vec<_> = response
            .headers()
            .get_all("sec-websocket-protocol")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, strings(&["chat", "echo"]));
    }

    #[test]
    fn test_switching_protocols_response() {
        let handshake = Handshake {
            path: "/chat".into(),
            accept_key: "key".into(),
            protocol: Some("echo".into()),
            compression: CompressionMethod::Deflate,
        };
        let response = handshake.response();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        let headers = response.headers();
        assert_eq!(headers["sec-websocket-accept"], "key");
        assert_eq!(headers["sec-websocket-protocol"], "echo");
        assert_eq!(headers["sec-websocket-extensions"], PERMESSAGE_DEFLATE_RESPONSE);
        assert_eq!(headers["upgrade"], "websocket");
    }
}
