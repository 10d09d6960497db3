//! HTTP request parsing and response serialization
//!
//! The server speaks a deliberately small slice of HTTP/1.1: one request per
//! connection, explicit `Content-Length` bodies, JSON in and out. Requests
//! are accumulated incrementally: the reader is fed whatever chunks the
//! socket yields and re-attempts a parse after each one, so chunk boundaries
//! never affect the outcome. Ceilings on header and body size turn oversized
//! requests into explicit 413-class errors instead of unbounded buffering.

use crate::{ProtocolError, Result};
use serde::Serialize;

/// Size ceilings enforced while receiving a request
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    /// Maximum bytes of request line + headers
    pub max_header_bytes: usize,
    /// Maximum bytes of body
    pub max_body_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// A fully received HTTP request
#[derive(Debug)]
pub struct Request {
    /// Request method, uppercase as sent
    pub method: String,
    /// Path component, query string stripped
    pub path: String,
    /// Raw query string if one was present
    pub query: Option<String>,
    /// Header name/value pairs, names lowercased
    headers: Vec<(String, String)>,
    /// Request body bytes
    pub body: Vec<u8>,
}

impl Request {
    /// Look up a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Extract the bearer token from the authorization header
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }
}

/// Incremental request reader
///
/// Feed it socket chunks until it yields a complete [`Request`]. Violating a
/// ceiling or producing unparseable bytes fails the read permanently.
pub struct RequestReader {
    buf: Vec<u8>,
    limits: RequestLimits,
}

impl RequestReader {
    pub fn new(limits: RequestLimits) -> Self {
        Self {
            buf: Vec::new(),
            limits,
        }
    }

    /// Append a chunk and attempt a parse
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<Request>> {
        self.buf.extend_from_slice(chunk);
        self.try_parse()
    }

    fn try_parse(&mut self) -> Result<Option<Request>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);

        let header_len = match parsed.parse(&self.buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                // No end-of-headers yet; if the buffer already exceeds the
                // header ceiling it never will within bounds
                if self.buf.len() > self.limits.max_header_bytes {
                    return Err(ProtocolError::RequestTooLarge {
                        size: self.buf.len(),
                        max: self.limits.max_header_bytes,
                    });
                }
                return Ok(None);
            }
            Err(e) => return Err(ProtocolError::MalformedRequest(e.to_string())),
        };

        if header_len > self.limits.max_header_bytes {
            return Err(ProtocolError::RequestTooLarge {
                size: header_len,
                max: self.limits.max_header_bytes,
            });
        }

        let method = parsed
            .method
            .ok_or_else(|| ProtocolError::MalformedRequest("missing method".into()))?
            .to_string();
        let target = parsed
            .path
            .ok_or_else(|| ProtocolError::MalformedRequest("missing path".into()))?;

        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };

        let mut header_pairs = Vec::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            header_pairs.push((
                header.name.to_ascii_lowercase(),
                String::from_utf8_lossy(header.value).into_owned(),
            ));
        }

        if header_pairs.iter().any(|(n, _)| n == "transfer-encoding") {
            return Err(ProtocolError::MalformedRequest(
                "transfer-encoding is not supported".into(),
            ));
        }

        let content_length = match header_pairs.iter().find(|(n, _)| n == "content-length") {
            Some((_, v)) => v
                .trim()
                .parse::<usize>()
                .map_err(|_| ProtocolError::MalformedRequest("bad content-length".into()))?,
            None => 0,
        };

        if content_length > self.limits.max_body_bytes {
            return Err(ProtocolError::RequestTooLarge {
                size: content_length,
                max: self.limits.max_body_bytes,
            });
        }

        let total = header_len + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let body = self.buf[header_len..total].to_vec();

        Ok(Some(Request {
            method,
            path,
            query,
            headers: header_pairs,
            body,
        }))
    }
}

/// An HTTP response ready for serialization
#[derive(Debug)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    body: Vec<u8>,
}

impl Response {
    /// JSON response from any serializable value
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self { status, body }
    }

    /// Error response with the standard `{error, message}` body
    pub fn error(status: u16, code: &str, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "error": code, "message": message }))
    }

    /// Map a protocol error onto the wire
    pub fn from_protocol_error(err: &ProtocolError) -> Self {
        Self::error(err.status_code(), err.error_code(), &err.user_message())
    }

    pub fn not_found() -> Self {
        Self::error(404, "not_found", "No such route.")
    }

    /// Serialize status line, headers and body
    ///
    /// Every response closes the connection; the server is strictly
    /// one-request-per-connection.
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = status_reason(self.status);
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
