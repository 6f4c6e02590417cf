//! Handler stages, the pipeline that runs them and the continuation between them

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Request, Response};
use http_body_util::Full;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Body type alias
pub type Body = Full<Bytes>;

/// A stage in the request-processing pipeline
#[async_trait]
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Process a request
    ///
    /// A stage either answers the request itself or hands it on with
    /// `next.run(req)`. A stage that fails must not invoke `next`.
    async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>>;
}

/// Terminal handler that runs after the last stage
pub type Endpoint =
    Arc<dyn Fn(Request<Body>) -> BoxFuture<'static, Result<Response<Body>>> + Send + Sync>;

/// Wrap an async function as an [`Endpoint`]
pub fn endpoint<F, Fut>(f: F) -> Endpoint
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Body>>> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

/// Ordered stages in front of an endpoint
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Arc<dyn Middleware>>>,
    endpoint: Endpoint,
}

impl Pipeline {
    /// Pipeline with no stages in front of `endpoint`
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            stages: Arc::new(Vec::new()),
            endpoint,
        }
    }

    /// Append a stage
    pub fn stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        Arc::make_mut(&mut self.stages).push(stage);
        self
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Handle a request under a fresh cancellation scope
    ///
    /// The scope is cancelled when the returned future completes or is dropped.
    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>> {
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        self.handle_with(req, cancel).await
    }

    /// Handle a request under a caller-owned cancellation scope
    pub async fn handle_with(
        &self,
        req: Request<Body>,
        cancel: CancellationToken,
    ) -> Result<Response<Body>> {
        Next {
            stages: Arc::clone(&self.stages),
            position: 0,
            endpoint: Arc::clone(&self.endpoint),
            cancel,
        }
        .run(req)
        .await
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// Rest of the pipeline, as seen from one stage
///
/// Carries the request's cancellation scope; stages doing long work should
/// watch [`Next::cancellation`].
pub struct Next {
    stages: Arc<Vec<Arc<dyn Middleware>>>,
    position: usize,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

impl Next {
    /// Continuation that goes straight to `endpoint`
    pub fn terminal(endpoint: Endpoint) -> Self {
        Self {
            stages: Arc::new(Vec::new()),
            position: 0,
            endpoint,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation scope
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancellation scope of the current request
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stages still ahead, not counting the endpoint
    pub fn remaining(&self) -> usize {
        self.stages.len().saturating_sub(self.position)
    }

    /// Run the next stage, or the endpoint once every stage has run
    pub async fn run(self, req: Request<Body>) -> Result<Response<Body>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("pipeline cancelled".to_string()));
        }

        match self.stages.get(self.position).cloned() {
            Some(stage) => {
                let next = Self {
                    position: self.position + 1,
                    ..self
                };
                stage.call(req, next).await
            }
            None => (self.endpoint)(req).await,
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("position", &self.position)
            .field("remaining", &self.remaining())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
