//! Upgrade request building.

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request};

/// The sample nonce from RFC 6455 section 1.3.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// The accept key the server must answer [`SAMPLE_KEY`] with.
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Builder for WebSocket upgrade requests.
///
/// ```ignore
/// let request = TestUpgrade::new("/chat")
///     .protocol("foo")
///     .protocol("echo")
///     .build();
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct TestUpgrade {
    path: String,
    host: String,
    key: Option<String>,
    version: Option<String>,
    protocols: Vec<String>,
    extensions: Vec<String>,
    headers: HeaderMap,
}

impl TestUpgrade {
    /// A valid version 13 upgrade for `path` with [`SAMPLE_KEY`].
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: "localhost".to_string(),
            key: Some(SAMPLE_KEY.to_string()),
            version: Some("13".to_string()),
            protocols: Vec::new(),
            extensions: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    /// Set the `Host` header.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Replace the `Sec-WebSocket-Key`, or drop it with `None`.
    pub fn key(mut self, key: Option<&str>) -> Self {
        self.key = key.map(str::to_string);
        self
    }

    /// Replace the `Sec-WebSocket-Version`, or drop it with `None`.
    pub fn version(mut self, version: Option<&str>) -> Self {
        self.version = version.map(str::to_string);
        self
    }

    /// Request a subprotocol. Each call adds a `Sec-WebSocket-Protocol` header.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Offer an extension, e.g. `permessage-deflate`.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extensions.push(extension.into());
        self
    }

    /// Add an arbitrary header. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.append(name, value);
        }
        self
    }

    fn header_lines(&self) -> Vec<(String, String)> {
        let mut lines = vec![
            (header::HOST.to_string(), self.host.clone()),
            (header::CONNECTION.to_string(), "Upgrade".to_string()),
            (header::UPGRADE.to_string(), "websocket".to_string()),
        ];
        if let Some(version) = &self.version {
            lines.push((header::SEC_WEBSOCKET_VERSION.to_string(), version.clone()));
        }
        if let Some(key) = &self.key {
            lines.push((header::SEC_WEBSOCKET_KEY.to_string(), key.clone()));
        }
        for protocol in &self.protocols {
            lines.push((header::SEC_WEBSOCKET_PROTOCOL.to_string(), protocol.clone()));
        }
        for extension in &self.extensions {
            lines.push((header::SEC_WEBSOCKET_EXTENSIONS.to_string(), extension.clone()));
        }
        for (name, value) in &self.headers {
            if let Ok(value) = value.to_str() {
                lines.push((name.to_string(), value.to_string()));
            }
        }
        lines
    }

    /// An `http::Request` for calling the routing layer directly.
    pub fn build(&self) -> Request<()> {
        let mut request = Request::new(());
        *request.method_mut() = Method::GET;
        if let Ok(uri) = self.path.parse() {
            *request.uri_mut() = uri;
        }
        let headers = request.headers_mut();
        for (name, value) in self.header_lines() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(name, value);
            }
        }
        request
    }

    /// The raw HTTP/1.1 request for writing to a socket.
    pub fn to_http1(&self) -> Vec<u8> {
        let mut out = format!("GET {} HTTP/1.1\r\n", self.path);
        for (name, value) in self.header_lines() {
            out.push_str(&name);
            out.push_str(": ");
            out.push_str(&value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}
