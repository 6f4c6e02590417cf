//! Script handler stage

use crate::config::ScriptHandlerConfig;
use crate::error::{Result, ScriptError};
use crate::modules::ModuleRegistry;
use crate::request::RequestCapability;
use crate::response::{ResponseCapability, ResponseRecorder, SharedSink};
use crate::runtime::{ScriptRuntime, SharedProgram};
use async_trait::async_trait;
use cuttle_core::middleware::{Body, Middleware, Next};
use http::{Request, Response};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where the handler gets its program from
#[derive(Clone)]
enum ProgramState {
    /// Read and compiled on every request
    Uncompiled,
    /// Compiled once at provisioning
    Cached(SharedProgram),
}

/// Pipeline stage running a Rhai script for every request
///
/// The script sees two constants, `request` and `response`. When it finishes
/// without error the request continues down the pipeline and whatever the
/// script sent is merged into the downstream response. When it fails the
/// pipeline stops here: a response the script already committed is returned
/// as is, otherwise the error goes to the pipeline's error path.
pub struct ScriptHandler {
    config: ScriptHandlerConfig,
    runtime: Arc<ScriptRuntime>,
    state: ProgramState,
}

impl ScriptHandler {
    /// Validate `config` and, when caching is enabled, compile the script
    ///
    /// Any failure here means the handler does not exist.
    pub async fn provision(config: ScriptHandlerConfig, modules: ModuleRegistry) -> Result<Self> {
        config.validate()?;
        let runtime = Arc::new(ScriptRuntime::new(&config, modules));

        let state = if config.cache_compiled_script {
            let loader = Arc::clone(&runtime);
            let path = config.handler_path.clone();
            let program = tokio::task::spawn_blocking(move || loader.load(&path))
                .await
                .map_err(|e| ScriptError::runtime(format!("Script compilation task failed: {e}")))??;

            info!(
                script = %program.name(),
                constants = program.constants(),
                "Script compiled and cached"
            );
            ProgramState::Cached(Arc::new(program))
        } else {
            debug!(script = %config.script_name(), "Script will be compiled per request");
            ProgramState::Uncompiled
        };

        Ok(Self {
            config,
            runtime,
            state,
        })
    }

    /// Handler configuration
    pub fn config(&self) -> &ScriptHandlerConfig {
        &self.config
    }

    /// Whether the program was compiled at provisioning
    pub fn is_cached(&self) -> bool {
        matches!(self.state, ProgramState::Cached(_))
    }

    /// Run the script once against `request`, writing through `sink`
    ///
    /// The run happens on the blocking pool and stops early when `cancel`
    /// fires or the configured timeout passes.
    pub async fn execute(
        &self,
        request: RequestCapability,
        sink: SharedSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        let state = self.state.clone();
        let path = self.config.handler_path.clone();
        let deadline = self.config.timeout().map(|timeout| Instant::now() + timeout);
        let response = ResponseCapability::new(sink);

        tokio::task::spawn_blocking(move || {
            let program = match state {
                ProgramState::Cached(program) => program,
                ProgramState::Uncompiled => Arc::new(runtime.load(&path)?),
            };
            runtime.run(&program, request, response, &cancel, deadline)
        })
        .await
        .map_err(|e| ScriptError::runtime(format!("Script task failed: {e}")))?
    }
}

impl fmt::Debug for ScriptHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandler")
            .field("script", &self.config.script_name())
            .field("cached", &self.is_cached())
            .field("timeout_ms", &self.config.timeout_ms)
            .finish()
    }
}

#[async_trait]
impl Middleware for ScriptHandler {
    async fn call(&self, req: Request<Body>, next: Next) -> cuttle_core::Result<Response<Body>> {
        let start = Instant::now();

        // Cancelled when the pipeline's scope ends or this future is dropped
        let cancel = next.cancellation().child_token();
        let _guard = cancel.clone().drop_guard();

        let recorder = Arc::new(Mutex::new(ResponseRecorder::new()));
        let sink: SharedSink = recorder.clone();
        let request = RequestCapability::from_request(&req);

        if let Err(e) = self.execute(request, sink, cancel).await {
            if e.is_cancellation() {
                warn!(script = %self.config.script_name(), error = %e, "Script cancelled");
            } else {
                error!(
                    script = %self.config.script_name(),
                    error = %e,
                    "Script execution failed"
                );
            }

            // A committed status is already on its way to the client
            let recorded = std::mem::take(&mut *recorder.lock());
            if let Some(status) = recorded.status() {
                debug!(
                    script = %self.config.script_name(),
                    status = status.as_u16(),
                    "Keeping committed response after script failure"
                );
                return Ok(recorded.into_response());
            }
            return Err(e.into());
        }

        trace!(
            script = %self.config.script_name(),
            elapsed_us = start.elapsed().as_micros(),
            "Script executed"
        );

        let recorded = std::mem::take(&mut *recorder.lock());
        let downstream = next.run(req).await?;
        Ok(recorded.merge(downstream).await)
    }
}
