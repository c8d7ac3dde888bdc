//! Parsed handshake replies.

use crate::error::TestError;

/// The server's answer to an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    status: u16,
    headers: Vec<(String, String)>,
}

impl HandshakeReply {
    /// Parse an HTTP/1.1 response head, ending with the blank line.
    pub fn parse(head: &[u8]) -> Result<Self, TestError> {
        let text = std::str::from_utf8(head).map_err(|e| TestError::Malformed(e.to_string()))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| TestError::Malformed(format!("bad status line {status_line:?}")))?;

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        Ok(Self { status, headers })
    }

    /// Status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the server switched protocols.
    pub fn is_upgraded(&self) -> bool {
        self.status == 101
    }

    /// First value of `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers_all(name).into_iter().next()
    }

    /// Every value of `name`, in order.
    pub fn headers_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}
