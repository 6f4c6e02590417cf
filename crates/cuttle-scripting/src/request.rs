//! Request capability: a read-only view of the incoming request

use crate::header::HeaderBridge;
use base64::{engine::general_purpose, Engine as _};
use http::header::{AUTHORIZATION, HOST};
use http::{HeaderMap, Request, Version};
use std::fmt;
use std::sync::Arc;

/// Username and password taken from a `Basic` authorization header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

/// Capability object exposing request metadata to scripts
///
/// Built once per request; clones share the same snapshot.
#[derive(Clone)]
pub struct RequestCapability {
    inner: Arc<RequestSnapshot>,
}

struct RequestSnapshot {
    method: String,
    url: String,
    proto: &'static str,
    proto_major: i64,
    proto_minor: i64,
    host: String,
    headers: HeaderMap,
}

impl RequestCapability {
    /// Snapshot `req`
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let (proto, proto_major, proto_minor) = match req.version() {
            Version::HTTP_09 => ("HTTP/0.9", 0, 9),
            Version::HTTP_10 => ("HTTP/1.0", 1, 0),
            Version::HTTP_2 => ("HTTP/2.0", 2, 0),
            Version::HTTP_3 => ("HTTP/3.0", 3, 0),
            _ => ("HTTP/1.1", 1, 1),
        };

        let host = req
            .uri()
            .authority()
            .map(|authority| authority.to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
            })
            .unwrap_or_default();

        Self {
            inner: Arc::new(RequestSnapshot {
                method: req.method().to_string(),
                url: req.uri().to_string(),
                proto,
                proto_major,
                proto_minor,
                host,
                headers: req.headers().clone(),
            }),
        }
    }

    /// Request method
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Request URL as received
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Protocol name, e.g. `HTTP/1.1`
    pub fn proto(&self) -> &str {
        self.inner.proto
    }

    /// Protocol major version
    pub fn proto_major(&self) -> i64 {
        self.inner.proto_major
    }

    /// Protocol minor version
    pub fn proto_minor(&self) -> i64 {
        self.inner.proto_minor
    }

    /// Target host
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Independent copy of the request headers
    pub fn header(&self) -> HeaderBridge {
        HeaderBridge::from_map(self.inner.headers.clone())
    }

    /// Credentials from a well-formed `Basic` authorization header
    ///
    /// Computed on every call; `None` when the header is missing, uses another
    /// scheme or does not decode to `user:password`.
    pub fn basic_auth(&self) -> Option<BasicCredentials> {
        let value = self.inner.headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }

        let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(BasicCredentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for RequestCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCapability")
            .field("method", &self.inner.method)
            .field("url", &self.inner.url)
            .field("proto", &self.inner.proto)
            .field("host", &self.inner.host)
            .finish()
    }
}
