//! URL parsing for the HTTP client.
//!
//! Accepted syntax: `scheme "://" host [ ":" port ] [ path ] [ "?" query ]
//! [ "#" fragment ]`. The scheme is matched case-sensitively by the client; a
//! missing path becomes `/` and the query is forwarded verbatim.

use crate::error::{NetError, Result};

/// A URL broken into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    /// Scheme without the trailing `://`.
    pub scheme: String,
    /// Host name or address literal.
    pub host: String,
    /// Port when present; the scheme default applies otherwise.
    pub port: Option<u16>,
    /// Path with the leading `/`.
    pub path: String,
    /// Query without the `?`, empty when absent.
    pub query: String,
    /// Fragment without the `#`, empty when absent.
    pub fragment: String,
}

impl Url {
    /// Parse a URL string.
    pub fn parse(url: &str) -> Result<Url> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| NetError::Protocol(format!("URL '{}' has no scheme", url)))?;
        if scheme.is_empty() {
            return Err(NetError::Protocol(format!("URL '{}' has no scheme", url)));
        }

        let host_end = rest.find([':', '/', '?', '#']).unwrap_or(rest.len());
        let host = &rest[..host_end];
        if host.is_empty() {
            return Err(NetError::Protocol(format!("URL '{}' has no host", url)));
        }
        let mut remainder = &rest[host_end..];

        let mut port = None;
        if let Some(after_colon) = remainder.strip_prefix(':') {
            let port_end = after_colon.find(['/', '?', '#']).unwrap_or(after_colon.len());
            let port_str = &after_colon[..port_end];
            let parsed = port_str.parse::<u16>().map_err(|_| {
                NetError::Protocol(format!("invalid port '{}' in URL '{}'", port_str, url))
            })?;
            port = Some(parsed);
            remainder = &after_colon[port_end..];
        }

        let (before_fragment, fragment) = match remainder.split_once('#') {
            Some((before, fragment)) => (before, fragment.to_string()),
            None => (remainder, String::new()),
        };
        let (path_str, query) = match before_fragment.split_once('?') {
            Some((path, query)) => (path, query.to_string()),
            None => (before_fragment, String::new()),
        };
        let path = if path_str.is_empty() {
            "/".to_string()
        } else {
            path_str.to_string()
        };

        Ok(Url {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path,
            query,
            fragment,
        })
    }

    /// The request target: path plus `?query` when a query is present.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Parse a query string of `a=b&c=d` pairs into ordered key/value pairs,
    /// percent-unescaping keys and values.
    pub fn parse_query(query: &str) -> Vec<(String, String)> {
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (unescape(key), unescape(value)),
                None => (unescape(pair), String::new()),
            })
            .collect()
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

// Percent-decode, treating '+' as a space. Malformed escapes pass through
// unchanged.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
