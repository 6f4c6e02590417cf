//! Importable utility modules
//!
//! Scripts reach these with `import "name" as alias;`. The registry is built
//! once and shared by every run; lookups fall back to script files under the
//! configured import directory.

use base64::{engine::general_purpose, Engine as _};
use rhai::module_resolvers::FileModuleResolver;
use rhai::plugin::*;
use rhai::{Blob, Map, ModuleResolver, Shared, INT};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[export_module]
mod log_module {
    use super::*;

    /// Log at trace level
    pub fn trace(message: Dynamic) {
        tracing::trace!(target: "cuttle::script", "{}", message);
    }

    /// Log at info level
    pub fn info(message: Dynamic) {
        tracing::info!(target: "cuttle::script", "{}", message);
    }

    /// Log at warn level
    pub fn warn(message: Dynamic) {
        tracing::warn!(target: "cuttle::script", "{}", message);
    }

    /// Log at error level
    pub fn error(message: Dynamic) {
        tracing::error!(target: "cuttle::script", "{}", message);
    }
}

#[export_module]
mod encoding_module {
    use super::*;

    pub fn base64_encode(text: &str) -> String {
        general_purpose::STANDARD.encode(text.as_bytes())
    }

    #[rhai_fn(name = "base64_encode")]
    pub fn base64_encode_blob(data: Blob) -> String {
        general_purpose::STANDARD.encode(data)
    }

    /// Decode to a string; malformed input raises an error.
    #[rhai_fn(return_raw)]
    pub fn base64_decode(text: &str) -> Result<String, Box<EvalAltResult>> {
        let bytes = general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|err| format!("invalid base64 input: {}", err))?;
        String::from_utf8(bytes).map_err(|_| "decoded base64 is not valid UTF-8".into())
    }

    pub fn url_encode(text: &str) -> String {
        form_urlencoded::byte_serialize(text.as_bytes()).collect()
    }

    /// Parse `a=1&b=2` into a map; a repeated key keeps its last value.
    pub fn parse_query(query: &str) -> Map {
        let query = query.strip_prefix('?').unwrap_or(query);
        form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.as_ref().into(), Dynamic::from(value.into_owned())))
            .collect()
    }
}

#[export_module]
mod time_module {
    use super::*;

    /// Seconds since the Unix epoch
    pub fn unix() -> INT {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as INT)
            .unwrap_or(0)
    }

    /// Milliseconds since the Unix epoch
    pub fn unix_millis() -> INT {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as INT)
            .unwrap_or(0)
    }
}

#[export_module]
mod uuid_module {
    /// Random (version 4) UUID in hyphenated form
    pub fn v4() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Named modules available to `import`
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: Arc<HashMap<String, Shared<Module>>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `log`, `encoding`, `time` and `uuid` modules
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register("log", exported_module!(log_module))
            .register("encoding", exported_module!(encoding_module))
            .register("time", exported_module!(time_module))
            .register("uuid", exported_module!(uuid_module));
        registry
    }

    /// Register `module` under `name`, replacing any previous module of that name
    pub fn register(&mut self, name: impl Into<String>, mut module: Module) -> &mut Self {
        module.build_index();
        Arc::make_mut(&mut self.modules).insert(name.into(), Shared::new(module));
        self
    }

    /// Look up a module
    pub fn get(&self, name: &str) -> Option<Shared<Module>> {
        self.modules.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

/// Resolves `import` paths: registry first, then files under the import directory
#[derive(Clone)]
pub(crate) struct ImportResolver {
    registry: ModuleRegistry,
    files: Option<Arc<FileModuleResolver>>,
}

impl ImportResolver {
    pub(crate) fn new(registry: ModuleRegistry, files: Option<Arc<FileModuleResolver>>) -> Self {
        Self { registry, files }
    }

    /// Build the file resolver for `dir`
    pub(crate) fn files(dir: &Path, cache: bool) -> Arc<FileModuleResolver> {
        let mut resolver = FileModuleResolver::new_with_path(dir);
        resolver.enable_cache(cache);
        Arc::new(resolver)
    }
}

/// Only plain relative paths may reach the file system
fn is_contained(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

impl ModuleResolver for ImportResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        if let Some(module) = self.registry.get(path) {
            return Ok(module);
        }

        match &self.files {
            Some(files) if is_contained(path) => files.resolve(engine, source, path, pos),
            _ => Err(Box::new(EvalAltResult::ErrorModuleNotFound(
                path.to_string(),
                pos,
            ))),
        }
    }
}

impl fmt::Debug for ImportResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportResolver")
            .field("registry", &self.registry)
            .field("files", &self.files.as_ref().map(|files| files.base_path()))
            .finish()
    }
}
