//! Response capability and the sink it writes through

use crate::error::HostError;
use crate::header::{HeaderBridge, SharedHeaders};
use bytes::BytesMut;
use cuttle_core::Body;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{trace, warn};

/// Transport side of an in-flight response
///
/// Writes and status commits are final once issued: the transport is free to
/// put them on the wire immediately.
pub trait ResponseSink: Send + fmt::Debug {
    /// Live header store of the response
    fn headers(&self) -> SharedHeaders;

    /// Write body bytes, committing status 200 first if nothing was committed
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Commit the status line; only the first commit is honored
    fn write_status(&mut self, status: StatusCode);
}

/// Sink shared between a capability object and the pipeline
pub type SharedSink = Arc<Mutex<dyn ResponseSink>>;

/// In-process sink that records what a script sent
///
/// Follows the usual streaming-writer rules: the first status commit wins,
/// headers are frozen at commit time and body bytes accumulate in order.
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    headers: SharedHeaders,
    status: Option<StatusCode>,
    committed_headers: Option<HeaderMap>,
    body: BytesMut,
}

impl ResponseRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed status, if any
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Whether the status line (and with it the headers) has been committed
    pub fn is_committed(&self) -> bool {
        self.status.is_some()
    }

    /// Body bytes written so far
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Headers as they would be sent now
    pub fn header_map(&self) -> HeaderMap {
        match &self.committed_headers {
            Some(headers) => headers.clone(),
            None => self.headers.lock().clone(),
        }
    }

    fn commit(&mut self, status: StatusCode) {
        if let Some(committed) = self.status {
            warn!(
                committed = committed.as_u16(),
                ignored = status.as_u16(),
                "Superfluous status write ignored"
            );
            return;
        }
        self.status = Some(status);
        self.committed_headers = Some(self.headers.lock().clone());
    }

    /// Build a standalone response from what was recorded
    pub fn into_response(self) -> Response<Body> {
        let headers = self.header_map();
        let mut response = Response::new(Body::new(self.body.freeze()));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = headers;
        response
    }

    /// Combine the recorded output with the response of the downstream stage
    ///
    /// A committed status and its headers win over downstream's; otherwise the
    /// downstream status applies and its headers override recorded ones key by
    /// key. Recorded body bytes come first.
    pub async fn merge(self, downstream: Response<Body>) -> Response<Body> {
        let (mut parts, body) = downstream.into_parts();
        let downstream_body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        let headers = match self.committed_headers {
            Some(committed) => {
                trace!(
                    ignored_status = parts.status.as_u16(),
                    "Downstream status and headers ignored after script commit"
                );
                parts.status = self.status.unwrap_or(parts.status);
                committed
            }
            None => {
                let mut merged = self.headers.lock().clone();
                let mut last = None;
                for (name, value) in parts.headers.drain() {
                    let name = match name {
                        Some(name) => {
                            merged.remove(&name);
                            last = Some(name.clone());
                            name
                        }
                        None => match &last {
                            Some(name) => name.clone(),
                            None => continue,
                        },
                    };
                    merged.append(name, value);
                }
                merged
            }
        };
        parts.headers = headers;

        let body = if self.body.is_empty() {
            downstream_body
        } else {
            let mut combined = self.body;
            combined.extend_from_slice(&downstream_body);
            combined.freeze()
        };

        Response::from_parts(parts, Body::new(body))
    }
}

impl ResponseSink for ResponseRecorder {
    fn headers(&self) -> SharedHeaders {
        Arc::clone(&self.headers)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_committed() {
            self.commit(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn write_status(&mut self, status: StatusCode) {
        self.commit(status);
    }
}

/// Capability object wrapping the response of the current request
///
/// Clones share the same sink and the same memoized header bridge.
#[derive(Clone)]
pub struct ResponseCapability {
    inner: Arc<ResponseState>,
}

struct ResponseState {
    sink: SharedSink,
    header: OnceCell<HeaderBridge>,
}

impl ResponseCapability {
    /// Wrap a sink
    pub fn new(sink: SharedSink) -> Self {
        Self {
            inner: Arc::new(ResponseState {
                sink,
                header: OnceCell::new(),
            }),
        }
    }

    /// Header bridge over the sink's live headers, created on first use
    pub fn header(&self) -> HeaderBridge {
        self.inner
            .header
            .get_or_init(|| HeaderBridge::new(self.inner.sink.lock().headers()))
            .clone()
    }

    /// Forward `payload` to the sink; returns the number of bytes written
    pub fn write(&self, payload: &[u8]) -> io::Result<usize> {
        self.inner.sink.lock().write(payload)
    }

    /// Commit `code` as the response status
    pub fn write_status(&self, code: i64) -> crate::Result<()> {
        Ok(self.commit_status(code)?)
    }

    pub(crate) fn commit_status(&self, code: i64) -> Result<(), HostError> {
        let status = u16::try_from(code)
            .ok()
            .filter(|code| (100..=999).contains(code))
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| {
                HostError::invalid("first", format!("{} is not a valid HTTP status code", code))
            })?;
        self.inner.sink.lock().write_status(status);
        Ok(())
    }
}

impl fmt::Debug for ResponseCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCapability")
            .field("header_created", &self.inner.header.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::CONTENT_TYPE;

    fn recorder() -> (Arc<Mutex<ResponseRecorder>>, ResponseCapability) {
        let recorder = Arc::new(Mutex::new(ResponseRecorder::new()));
        let sink: SharedSink = recorder.clone();
        (recorder, ResponseCapability::new(sink))
    }

    #[test]
    fn test_header_is_memoized_and_live() {
        let (recorder, response) = recorder();
        let first = response.header();
        let second = response.header();
        assert!(Arc::ptr_eq(first.store(), second.store()));

        first.set("X-Script", "1").unwrap();
        assert_eq!(recorder.lock().header_map()["x-script"], "1");
    }

    #[test]
    fn test_write_commits_ok_and_accumulates() {
        let (recorder, response) = recorder();
        assert_eq!(response.write(b"hello ").unwrap(), 6);
        assert_eq!(response.write(b"world").unwrap(), 5);

        let recorder = recorder.lock();
        assert_eq!(recorder.status(), Some(StatusCode::OK));
        assert_eq!(recorder.body(), b"hello world");
    }

    #[test]
    fn test_status_is_one_shot() {
        let (recorder, response) = recorder();
        response.write_status(404).unwrap();
        response.write_status(500).unwrap();
        response.write(b"late").unwrap();
        assert_eq!(recorder.lock().status(), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_status_range_validated() {
        let (recorder, response) = recorder();
        assert!(response.write_status(99).is_err());
        assert!(response.write_status(1000).is_err());
        assert!(response.write_status(-200).is_err());
        assert!(!recorder.lock().is_committed());

        response.write_status(999).unwrap();
        assert_eq!(recorder.lock().status().map(|s| s.as_u16()), Some(999));
    }

    #[test]
    fn test_headers_frozen_at_commit() {
        let (recorder, response) = recorder();
        let header = response.header();
        header.set("x-before", "1").unwrap();
        response.write_status(201).unwrap();
        header.set("x-after", "2").unwrap();

        let sent = recorder.lock().header_map();
        assert!(sent.contains_key("x-before"));
        assert!(!sent.contains_key("x-after"));
    }

    #[tokio::test]
    async fn test_merge_uncommitted_overlays_downstream() {
        let (recorder, response) = recorder();
        response.header().set("X-Script", "1").unwrap();
        response.header().set("Content-Type", "text/plain").unwrap();

        let downstream = Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let recorded = std::mem::take(&mut *recorder.lock());
        let merged = recorded.merge(downstream).await;

        assert_eq!(merged.status(), StatusCode::ACCEPTED);
        assert_eq!(merged.headers()["x-script"], "1");
        assert_eq!(merged.headers()[CONTENT_TYPE], "application/json");
        let body = merged.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("{}"));
    }

    #[tokio::test]
    async fn test_merge_committed_wins() {
        let (recorder, response) = recorder();
        response.header().set("X-Script", "1").unwrap();
        response.write_status(418).unwrap();
        response.write(b"script;").unwrap();

        let downstream = Response::builder()
            .status(StatusCode::OK)
            .header("x-downstream", "1")
            .body(Body::from("downstream"))
            .unwrap();

        let recorded = std::mem::take(&mut *recorder.lock());
        let merged = recorded.merge(downstream).await;

        assert_eq!(merged.status(), StatusCode::IM_A_TEAPOT);
        assert!(merged.headers().contains_key("x-script"));
        assert!(!merged.headers().contains_key("x-downstream"));
        let body = merged.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("script;downstream"));
    }
}
