//! Script compilation and per-run execution contexts

use crate::api;
use crate::config::ScriptHandlerConfig;
use crate::error::{Result, ScriptError};
use crate::modules::{ImportResolver, ModuleRegistry};
use crate::request::RequestCapability;
use crate::response::ResponseCapability;
use rhai::packages::{Package, StandardPackage};
use rhai::{ASTNode, Dynamic, Engine, Module, Scope, Shared, AST};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Operations between two deadline checks
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Reason reported when the request scope is cancelled
pub(crate) const CANCELLED_REASON: &str = "request cancelled";

/// Reason reported when the run outlives its timeout
pub(crate) const DEADLINE_REASON: &str = "deadline exceeded";

/// A parsed script, shared read-only between runs
pub struct CompiledProgram {
    name: String,
    ast: AST,
    constants: usize,
}

impl CompiledProgram {
    /// Source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of constant expressions in the program
    pub fn constants(&self) -> usize {
        self.constants
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("name", &self.name)
            .field("constants", &self.constants)
            .finish()
    }
}

/// Compiled program shared between runs
pub type SharedProgram = Arc<CompiledProgram>;

/// Sandbox ceilings applied to every run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptLimits {
    /// Evaluation operations per run (0 = unlimited)
    pub max_operations: u64,
    /// Constant expressions per program (0 = unlimited)
    pub max_constants: usize,
    /// String length
    pub max_string_size: usize,
    /// Array length
    pub max_array_size: usize,
    /// Object map size
    pub max_map_size: usize,
    /// Expression nesting, top level and inside functions
    pub max_expr_depths: (usize, usize),
    /// Function call nesting
    pub max_call_levels: usize,
    /// Modules loaded per run
    pub max_modules: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_constants: 0,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_expr_depths: (64, 32),
            max_call_levels: 64,
            max_modules: 32,
        }
    }
}

impl From<&ScriptHandlerConfig> for ScriptLimits {
    fn from(config: &ScriptHandlerConfig) -> Self {
        Self {
            max_operations: config.max_allocs,
            max_constants: config.max_const_objects,
            max_string_size: config.max_string_size,
            max_array_size: config.max_array_size,
            max_map_size: config.max_map_size,
            ..Self::default()
        }
    }
}

/// Builds execution contexts and compiles programs
///
/// Everything here is shared by all runs of a handler: the standard library,
/// the host API module, the import resolver and the limits. Each run gets its
/// own engine and scope on top of them.
pub struct ScriptRuntime {
    stdlib: Shared<Module>,
    host_api: Shared<Module>,
    resolver: ImportResolver,
    limits: ScriptLimits,
}

impl ScriptRuntime {
    /// Create a runtime for `config`
    pub fn new(config: &ScriptHandlerConfig, modules: ModuleRegistry) -> Self {
        let files = config
            .import_dir
            .as_deref()
            .map(|dir| ImportResolver::files(dir, config.cache_compiled_script));

        Self {
            stdlib: StandardPackage::new().as_shared_module(),
            host_api: api::host_api(),
            resolver: ImportResolver::new(modules, files),
            limits: ScriptLimits::from(config),
        }
    }

    /// Limits applied to every run
    pub fn limits(&self) -> &ScriptLimits {
        &self.limits
    }

    /// A configured engine without per-run hooks
    pub fn engine(&self) -> Engine {
        let mut engine = Engine::new_raw();
        engine.register_global_module(self.stdlib.clone());
        engine.register_global_module(self.host_api.clone());
        api::register_types(&mut engine);
        engine.set_module_resolver(self.resolver.clone());

        let limits = &self.limits;
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_expr_depths(limits.max_expr_depths.0, limits.max_expr_depths.1);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_modules(limits.max_modules);
        engine.disable_symbol("eval");

        engine.on_print(|text| info!(target: "cuttle::script", "{}", text));
        engine.on_debug(|text, source, pos| {
            debug!(
                target: "cuttle::script",
                source = source.unwrap_or_default(),
                line = pos.line().unwrap_or_default(),
                "{}",
                text
            )
        });

        engine
    }

    /// Read and compile the script at `path`
    pub fn load(&self, path: &Path) -> Result<CompiledProgram> {
        let source = fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.compile(&path.display().to_string(), &source)
    }

    /// Parse `source` and check it against the constant ceiling
    pub fn compile(&self, name: &str, source: &str) -> Result<CompiledProgram> {
        let start = Instant::now();
        let mut ast = self.engine().compile(source)?;
        ast.set_source(name);

        let constants = count_constants(&ast);
        let max = self.limits.max_constants;
        if max > 0 && constants > max {
            return Err(ScriptError::ResourceExhausted {
                limit: format!("max_const_objects ({} > {})", constants, max),
            });
        }

        debug!(
            script = %name,
            constants,
            elapsed_us = start.elapsed().as_micros(),
            "Script compiled"
        );

        Ok(CompiledProgram {
            name: name.to_string(),
            ast,
            constants,
        })
    }

    /// Run `program` once with the given capabilities bound
    ///
    /// Blocks the calling thread. The run stops with a cancellation error as
    /// soon as `cancel` fires or `deadline` passes.
    pub fn run(
        &self,
        program: &CompiledProgram,
        request: RequestCapability,
        response: ResponseCapability,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut engine = self.engine();

        let cancel = cancel.clone();
        engine.on_progress(move |ops| {
            if cancel.is_cancelled() {
                return Some(Dynamic::from(CANCELLED_REASON));
            }
            match deadline {
                Some(deadline)
                    if ops % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline =>
                {
                    Some(Dynamic::from(DEADLINE_REASON))
                }
                _ => None,
            }
        });

        let mut scope = Scope::new();
        scope.push_constant("request", request);
        scope.push_constant("response", response);

        trace!(script = %program.name, "Running script");
        engine.run_ast_with_scope(&mut scope, &program.ast)?;
        Ok(())
    }
}

impl fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("resolver", &self.resolver)
            .field("limits", &self.limits)
            .finish()
    }
}

/// Count literal and constant-folded expressions
fn count_constants(ast: &AST) -> usize {
    let mut count = 0;
    ast.walk(&mut |path: &[ASTNode<'_>]| {
        if let Some(ASTNode::Expr(expr)) = path.last() {
            if expr.is_constant() {
                count += 1;
            }
        }
        true
    });
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{ResponseRecorder, SharedSink};
    use http::Request;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn runtime(config: ScriptHandlerConfig) -> ScriptRuntime {
        ScriptRuntime::new(&config, ModuleRegistry::standard())
    }

    fn capabilities() -> (Arc<Mutex<ResponseRecorder>>, RequestCapability, ResponseCapability) {
        let req = Request::builder()
            .uri("http://example.com/hello")
            .body(())
            .unwrap();
        let recorder = Arc::new(Mutex::new(ResponseRecorder::new()));
        let sink: SharedSink = recorder.clone();
        (
            recorder,
            RequestCapability::from_request(&req),
            ResponseCapability::new(sink),
        )
    }

    fn run(runtime: &ScriptRuntime, source: &str) -> (Arc<Mutex<ResponseRecorder>>, Result<()>) {
        let program = runtime.compile("test.rhai", source).unwrap();
        let (recorder, request, response) = capabilities();
        let result = runtime.run(&program, request, response, &CancellationToken::new(), None);
        (recorder, result)
    }

    #[test]
    fn test_compile_error_has_position() {
        let runtime = runtime(ScriptHandlerConfig::new("test.rhai"));
        match runtime.compile("test.rhai", "let x = ;\n") {
            Err(ScriptError::Compilation { line, .. }) => assert_eq!(line, Some(1)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_constant_ceiling() {
        let source = r#"let a = 1; let b = "two"; let c = 3.0; let d = 'x';"#;

        let counted = runtime(ScriptHandlerConfig::new("t.rhai"))
            .compile("t.rhai", source)
            .unwrap()
            .constants();
        assert!(counted >= 4);

        let exact = runtime(ScriptHandlerConfig::new("t.rhai").with_max_const_objects(counted));
        assert!(exact.compile("t.rhai", source).is_ok());

        let limited =
            runtime(ScriptHandlerConfig::new("t.rhai").with_max_const_objects(counted - 1));
        let err = limited.compile("t.rhai", source).unwrap_err();
        assert!(err.is_resource_exhausted(), "{err}");
    }

    #[test]
    fn test_capabilities_bound() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai"));
        let (recorder, result) = run(
            &runtime,
            r#"
                let h = response.header();
                h["Content-Type"] = "text/plain";
                response.write_status(202);
                response.write(request.method + " " + request.host);
            "#,
        );
        result.unwrap();

        let recorder = recorder.lock();
        assert_eq!(recorder.status(), Some(http::StatusCode::ACCEPTED));
        assert_eq!(recorder.body(), b"GET example.com");
        assert_eq!(recorder.header_map()["content-type"], "text/plain");
    }

    #[test]
    fn test_bindings_are_constant() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai"));
        let (_, result) = run(&runtime, "request = 1;");
        assert!(result.is_err());
    }

    #[test]
    fn test_operation_ceiling() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai").with_max_allocs(500));
        assert_eq!(runtime.limits().max_operations, 500);
        let (_, result) = run(&runtime, "let x = 0; loop { x += 1; }");
        let err = result.unwrap_err();
        assert!(err.is_resource_exhausted(), "{err}");
    }

    #[test]
    fn test_cancelled_token_stops_run() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai"));
        let program = runtime.compile("t.rhai", "loop { }").unwrap();
        let (_, request, response) = capabilities();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runtime
            .run(&program, request, response, &cancel, None)
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.to_string().contains(CANCELLED_REASON));
    }

    #[test]
    fn test_deadline_stops_run() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai"));
        let program = runtime.compile("t.rhai", "loop { }").unwrap();
        let (_, request, response) = capabilities();

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = runtime
            .run(&program, request, response, &CancellationToken::new(), Some(deadline))
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.to_string().contains(DEADLINE_REASON));
    }

    #[test]
    fn test_eval_disabled() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai"));
        assert!(runtime.compile("t.rhai", r#"eval("1 + 1")"#).is_err());
    }

    #[test]
    fn test_registry_imports() {
        let runtime = runtime(ScriptHandlerConfig::new("t.rhai"));
        let (recorder, result) = run(
            &runtime,
            r#"
                import "encoding" as enc;
                import "log" as log;
                log::info("encoding");
                response.write(enc::base64_encode("hi"));
            "#,
        );
        result.unwrap();
        assert_eq!(recorder.lock().body(), b"aGk=");
    }
}
