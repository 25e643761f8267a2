//! HTTP-style messages sharing the socket with old-style messages.
//!
//! A request is `METHOD uri\n`, a response `HTTP/1.1 code OK\n`; both are
//! followed by `key:value\n` headers, an empty line and `content-length`
//! bytes of body.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{ProtoError, Uri};

pub const RESPONSE_PREFIX: &str = "HTTP/1.1";
pub const CONTENT_LENGTH: &str = "content-length";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            other => Err(ProtoError::MalformedHttp(format!("unknown method '{other}'"))),
        }
    }
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    pub fn put(uri: Uri) -> Self {
        Self {
            method: Method::Put,
            uri,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    /// Builder method to set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn encode(&self) -> String {
        let first = format!("{} {}", self.method, self.uri);
        encode(&first, &self.headers, &self.body)
    }
}

/// A reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn encode(&self) -> String {
        let first = format!("{} {} OK", RESPONSE_PREFIX, self.status);
        encode(&first, &self.headers, &self.body)
    }
}

fn encode(first_line: &str, headers: &BTreeMap<String, String>, body: &str) -> String {
    let mut out = format!("{first_line}\n");
    for (key, value) in headers.iter().filter(|(k, _)| k.as_str() != CONTENT_LENGTH) {
        out.push_str(&format!("{key}:{value}\n"));
    }
    if !body.is_empty() {
        out.push_str(&format!("{CONTENT_LENGTH}:{}\n", body.len()));
    }
    out.push('\n');
    out.push_str(body);
    out
}

/// Either half of an HTTP-style exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMessage {
    Request(HttpRequest),
    Response(HttpResponse),
}

/// Parsed head of an HTTP-style message, before its body arrived.
#[derive(Debug)]
pub(crate) struct Head {
    first_line: String,
    pub(crate) headers: BTreeMap<String, String>,
}

impl Head {
    /// Parse the head (everything before the empty line).
    pub(crate) fn parse(head: &str) -> Result<Self, ProtoError> {
        let mut lines = head.lines();
        let first_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ProtoError::MalformedHttp("empty head".to_string()))?
            .to_string();

        let mut headers = BTreeMap::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ProtoError::MalformedHttp(format!("bad header '{line}'")))?;
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
        Ok(Self {
            first_line,
            headers,
        })
    }

    pub(crate) fn content_length(&self) -> Result<usize, ProtoError> {
        match self.headers.get(CONTENT_LENGTH) {
            Some(v) => v
                .parse()
                .map_err(|_| ProtoError::MalformedHttp(format!("bad content-length '{v}'"))),
            None => Ok(0),
        }
    }

    pub(crate) fn into_message(mut self, body: String) -> Result<HttpMessage, ProtoError> {
        self.headers.remove(CONTENT_LENGTH);
        let mut parts = self.first_line.split(' ');
        let first = parts.next().unwrap_or_default();

        if first == RESPONSE_PREFIX {
            let status = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtoError::MalformedHttp(self.first_line.clone()))?;
            return Ok(HttpMessage::Response(HttpResponse {
                status,
                headers: self.headers,
                body,
            }));
        }

        let method: Method = first.parse()?;
        let uri: Uri = parts
            .next()
            .ok_or_else(|| ProtoError::MalformedHttp(self.first_line.clone()))?
            .parse()?;
        Ok(HttpMessage::Request(HttpRequest {
            method,
            uri,
            headers: self.headers,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let req = HttpRequest::put(Uri::new("/run").with_param("temp_id", "t1"))
            .with_body("<flow/>");
        assert_eq!(req.encode(), "PUT /run?temp_id=t1\ncontent-length:7\n\n<flow/>");
    }

    #[test]
    fn test_response_encoding_without_body() {
        assert_eq!(HttpResponse::ok().encode(), "HTTP/1.1 200 OK\n\n");
    }

    #[test]
    fn test_head_parse_request() {
        let head = Head::parse("PUT /kill?id=4\nContent-Length: 0\nx-client:gui").unwrap();
        assert_eq!(head.content_length().unwrap(), 0);
        assert_eq!(head.headers.get("x-client").map(String::as_str), Some("gui"));
        match head.into_message(String::new()).unwrap() {
            HttpMessage::Request(req) => {
                assert_eq!(req.method, Method::Put);
                assert_eq!(req.uri.param("id"), Some("4"));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_head_parse_response() {
        let head = Head::parse("HTTP/1.1 409 OK").unwrap();
        match head.into_message("busy".into()).unwrap() {
            HttpMessage::Response(resp) => {
                assert_eq!(resp.status, 409);
                assert!(!resp.is_success());
                assert_eq!(resp.body, "busy");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_heads() {
        assert!(Head::parse("").is_err());
        assert!(Head::parse("PUT /x\nno-colon").is_err());
        assert!(Head::parse("PATCH /x").unwrap().into_message(String::new()).is_err());
    }
}
