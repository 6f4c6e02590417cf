//! Handler registry

use crate::config;
use crate::error::{Result, ScriptError};
use crate::handler::ScriptHandler;
use crate::modules::ModuleRegistry;
use cuttle_core::Middleware;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Future returned by a handler factory
pub type HandlerFuture = BoxFuture<'static, Result<Arc<dyn Middleware>>>;

/// Builds a provisioned handler from its raw configuration
pub type HandlerFactory =
    Arc<dyn Fn(serde_json::Value, ModuleRegistry) -> HandlerFuture + Send + Sync>;

/// Name under which the script handler is registered by [`HandlerRegistry::with_defaults`]
pub const SCRIPT_HANDLER: &str = "script";

/// Maps handler names to their factories
///
/// Built once at startup and passed to whatever assembles the pipeline.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
    modules: ModuleRegistry,
}

impl HandlerRegistry {
    /// Create an empty registry whose handlers may import `modules`
    pub fn new(modules: ModuleRegistry) -> Self {
        Self {
            factories: HashMap::new(),
            modules,
        }
    }

    /// Registry with the standard modules and the `script` handler
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(ModuleRegistry::standard());
        registry
            .factories
            .insert(SCRIPT_HANDLER.to_string(), Arc::new(provision_script));
        registry
    }

    /// Register a factory
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(serde_json::Value, ModuleRegistry) -> HandlerFuture + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(ScriptError::config(format!(
                "handler '{}' is already registered",
                name
            )));
        }

        self.factories.insert(name.clone(), Arc::new(factory));
        info!(handler = %name, "Handler registered");
        Ok(())
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered handler names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Modules handed to every factory
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Provision handler `name` from its raw configuration
    pub async fn provision(
        &self,
        name: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn Middleware>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ScriptError::config(format!("unknown handler '{}'", name)))?;

        let handler = factory(config, self.modules.clone()).await?;
        info!(handler = %name, "Handler provisioned");
        Ok(handler)
    }
}

fn provision_script(value: serde_json::Value, modules: ModuleRegistry) -> HandlerFuture {
    async move {
        let config = config::from_value(value)?;
        let handler = ScriptHandler::provision(config, modules).await?;
        Ok::<Arc<dyn Middleware>, ScriptError>(Arc::new(handler))
    }
    .boxed()
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .field("modules", &self.modules)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let registry = HandlerRegistry::with_defaults();
        assert!(registry.contains(SCRIPT_HANDLER));
        assert_eq!(registry.names(), vec!["script"]);
        assert_eq!(
            registry.modules().names(),
            vec!["encoding", "log", "time", "uuid"]
        );
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::with_defaults();
        let err = registry
            .register(SCRIPT_HANDLER, |_, _| {
                async { Err::<Arc<dyn Middleware>, _>(ScriptError::config("unused")) }.boxed()
            })
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_provision_unknown_handler() {
        let registry = HandlerRegistry::with_defaults();
        let err = registry.provision("lua", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("unknown handler 'lua'"));
    }

    #[tokio::test]
    async fn test_provision_script_handler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handler.rhai");
        std::fs::write(&path, "let answer = 42;").unwrap();

        let registry = HandlerRegistry::with_defaults();
        let handler = registry
            .provision(
                SCRIPT_HANDLER,
                json!({ "handler_path": path, "cache_compiled_script": true }),
            )
            .await
            .unwrap();
        assert!(format!("{handler:?}").contains("cached: true"));

        let err = registry
            .provision(SCRIPT_HANDLER, json!({ "handler_path": path, "bogus": 1 }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bogus"), "{err}");
    }
}
