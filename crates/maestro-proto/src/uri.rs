//! Request URIs: `/path?key=value;key2=value2`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::ProtoError;

/// Characters escaped in parameter values.
const VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'+')
    .add(b'<')
    .add(b'>');

/// A parsed request URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub path: String,
    pub params: BTreeMap<String, String>,
}

impl Uri {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder method to add a query parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Parameter value, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parameter value, or an empty string.
    pub fn param_or_empty(&self, key: &str) -> &str {
        self.param(key).unwrap_or("")
    }

    /// Parameter value, failing when it is missing or empty.
    pub fn require(&self, key: &'static str) -> Result<&str, ProtoError> {
        match self.param(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ProtoError::InvalidField {
                field: key,
                value: "missing".to_string(),
            }),
        }
    }

    /// Whether a yes/no style parameter is set.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.param(key), Some("yes" | "true" | "on" | "1"))
    }
}

impl FromStr for Uri {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, query) = match s.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (s, None),
        };
        if !path.starts_with('/') {
            return Err(ProtoError::MalformedHttp(format!("bad request path '{path}'")));
        }

        let mut uri = Uri::new(path);
        for pair in query.into_iter().flat_map(|q| q.split(';')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode_str(value)
                .decode_utf8()
                .map_err(|_| ProtoError::MalformedHttp(format!("bad escape in '{pair}'")))?;
            uri.params.insert(key.to_string(), value.into_owned());
        }
        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { ';' };
            write!(f, "{sep}{key}={}", utf8_percent_encode(value, VALUE))?;
        }
        Ok(())
    }
}
