//! Handler configuration

use crate::error::{Result, ScriptError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of one script handler
///
/// ```yaml
/// handler_path: /etc/cuttle/handler.rhai
/// import_dir: /etc/cuttle/lib
/// max_allocs: 100000
/// max_const_objects: 512
/// cache_compiled_script: true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptHandlerConfig {
    /// Script file run for every request
    pub handler_path: PathBuf,

    /// Directory searched by file imports; file imports are disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_dir: Option<PathBuf>,

    /// Ceiling on evaluation operations per run (0 = unlimited)
    #[serde(default)]
    pub max_allocs: u64,

    /// Ceiling on constant expressions in the compiled program (0 = unlimited)
    #[serde(default)]
    pub max_const_objects: usize,

    /// Compile once at provisioning instead of on every request
    #[serde(default)]
    pub cache_compiled_script: bool,

    /// Wall-clock budget of a single run in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Maximum length of any string built by the script
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    /// Maximum number of array elements
    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,

    /// Maximum number of object map entries
    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,
}

fn default_max_string_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_collection_size() -> usize {
    10_000
}

impl ScriptHandlerConfig {
    /// Create config for a handler script
    pub fn new<P: Into<PathBuf>>(handler_path: P) -> Self {
        Self {
            handler_path: handler_path.into(),
            import_dir: None,
            max_allocs: 0,
            max_const_objects: 0,
            cache_compiled_script: false,
            timeout_ms: None,
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
        }
    }

    /// Enable file imports from `dir`
    pub fn with_import_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.import_dir = Some(dir.into());
        self
    }

    /// Set the operation ceiling
    pub fn with_max_allocs(mut self, max_allocs: u64) -> Self {
        self.max_allocs = max_allocs;
        self
    }

    /// Set the constant ceiling
    pub fn with_max_const_objects(mut self, max_const_objects: usize) -> Self {
        self.max_const_objects = max_const_objects;
        self
    }

    /// Compile once at provisioning
    pub fn cached(mut self) -> Self {
        self.cache_compiled_script = true;
        self
    }

    /// Set the per-run timeout
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Per-run timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Name used for the script in logs and error positions
    pub fn script_name(&self) -> String {
        self.handler_path.display().to_string()
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.handler_path.as_os_str().is_empty() {
            return Err(ScriptError::config(
                "the handler_path configuration option is required",
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(ScriptError::config("timeout_ms must be greater than zero"));
        }
        if let Some(dir) = &self.import_dir {
            if dir.as_os_str().is_empty() {
                return Err(ScriptError::config("import_dir must not be empty when set"));
            }
        }
        Ok(())
    }
}

/// Configuration text format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ScriptError::config("Unable to detect config format"))?;

        match ext {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            _ => Err(ScriptError::config(format!(
                "Unsupported config format: {}",
                ext
            ))),
        }
    }
}

/// Load and validate a handler configuration file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ScriptHandlerConfig> {
    let path = path.as_ref();

    let content = fs::read_to_string(path).map_err(|e| {
        ScriptError::config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Parse and validate a handler configuration
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<ScriptHandlerConfig> {
    let expanded = expand_env_vars(content)?;

    let config: ScriptHandlerConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded)
            .map_err(|e| ScriptError::config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded)
            .map_err(|e| ScriptError::config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded)
            .map_err(|e| ScriptError::config(format!("Failed to parse JSON: {e}")))?,
    };

    config.validate()?;
    Ok(config)
}

/// Build a configuration from an already-parsed JSON value
pub fn from_value(value: serde_json::Value) -> Result<ScriptHandlerConfig> {
    let config: ScriptHandlerConfig = serde_json::from_value(value)
        .map_err(|e| ScriptError::config(format!("Invalid handler configuration: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}`
fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| ScriptError::config(format!("Invalid regex: {e}")))?;

    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(3) {
                Some(default) => default.as_str().to_string(),
                None => {
                    return Err(ScriptError::config(format!(
                        "Environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML_CONFIG: &str = r#"
handler_path: "/srv/handler.rhai"
import_dir: "/srv/lib"
max_allocs: 5000
max_const_objects: 64
cache_compiled_script: true
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.handler_path, PathBuf::from("/srv/handler.rhai"));
        assert_eq!(config.import_dir, Some(PathBuf::from("/srv/lib")));
        assert_eq!(config.max_allocs, 5000);
        assert_eq!(config.max_const_objects, 64);
        assert!(config.cache_compiled_script);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.max_string_size, 1024 * 1024);
    }

    #[test]
    fn test_load_toml_and_json() {
        let toml = "handler_path = \"h.rhai\"\ntimeout_ms = 250\n";
        let config = load_from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert!(!config.cache_compiled_script);

        let json = r#"{"handler_path": "h.rhai", "max_allocs": 10}"#;
        let config = load_from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config, ScriptHandlerConfig::new("h.rhai").with_max_allocs(10));
    }

    #[test]
    fn test_unknown_field_is_named() {
        let err = load_from_str(
            "handler_path: h.rhai\nmax_allocations: 10\n",
            ConfigFormat::Yaml,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_allocations"), "{err}");
    }

    #[test]
    fn test_missing_handler_path() {
        let err = load_from_str("max_allocs: 10\n", ConfigFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("handler_path"), "{err}");

        let err = ScriptHandlerConfig::new("").validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: the handler_path configuration option is required"
        );
    }

    #[test]
    fn test_wrong_type_rejected() {
        let json = r#"{"handler_path": "h.rhai", "max_allocs": "many"}"#;
        assert!(load_from_str(json, ConfigFormat::Json).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ScriptHandlerConfig::new("h.rhai").with_timeout(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CUTTLE_TEST_SCRIPT_DIR", "/opt/scripts");
        env::remove_var("CUTTLE_TEST_UNSET");

        let yaml = "handler_path: \"${CUTTLE_TEST_SCRIPT_DIR}/main.rhai\"\nmax_allocs: ${CUTTLE_TEST_UNSET:-42}\n";
        let config = load_from_str(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.handler_path, PathBuf::from("/opt/scripts/main.rhai"));
        assert_eq!(config.max_allocs, 42);

        let err = load_from_str("handler_path: ${CUTTLE_TEST_UNSET}\n", ConfigFormat::Yaml)
            .unwrap_err();
        assert!(err.to_string().contains("CUTTLE_TEST_UNSET"));
    }

    #[test]
    fn test_detect_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("handler.yml")).unwrap(),
            ConfigFormat::Yaml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("handler.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("handler.json")).unwrap(),
            ConfigFormat::Json
        );
        assert!(ConfigFormat::from_path(Path::new("handler.ini")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handler.json");
        fs::write(&path, r#"{"handler_path": "main.rhai", "cache_compiled_script": true}"#)
            .unwrap();

        let config = load_from_file(&path).unwrap();
        assert!(config.cache_compiled_script);
        assert_eq!(config.script_name(), "main.rhai");
    }
}
