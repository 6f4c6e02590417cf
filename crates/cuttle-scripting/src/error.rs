//! Script execution error types

use rhai::{Dynamic, EvalAltResult, ParseError, Position};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Script execution result type
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Error raised while configuring, compiling or running a handler script
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Missing, unknown or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The script source could not be read
    #[error("Failed to read script {}: {source}", path.display())]
    Io {
        /// Path that was being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Script compilation/parsing error
    #[error("Script compilation error: {message}{}", location(.line, .column))]
    Compilation {
        /// Error message
        message: String,
        /// Line number if available
        line: Option<usize>,
        /// Column number if available
        column: Option<usize>,
    },

    /// A host function received an argument of the wrong kind
    #[error("Invalid type for argument '{name}': expected {expected}, found {found}")]
    InvalidArgumentType {
        /// Argument name
        name: String,
        /// Expected kind
        expected: String,
        /// Kind actually passed
        found: String,
    },

    /// A host function received a well-typed but unacceptable argument
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument {
        /// Argument name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// No host or script function matches the call (unknown name or wrong arity)
    #[error("No function matches the call {signature}")]
    NoMatchingFunction {
        /// Call signature as reported by the engine
        signature: String,
    },

    /// Error thrown by the script itself
    #[error("Script runtime error: {message}{}", location(.line, &None))]
    Runtime {
        /// Error message
        message: String,
        /// Script line where error occurred
        line: Option<usize>,
    },

    /// Writing to the response sink failed
    #[error("Response write failed: {0}")]
    Sink(#[source] io::Error),

    /// The run was cancelled by its request scope or hit its deadline
    #[error("Script cancelled: {reason}")]
    Cancelled {
        /// Why the run stopped
        reason: String,
    },

    /// A sandbox ceiling was exceeded
    #[error("Script resource limit exceeded: {limit}")]
    ResourceExhausted {
        /// Which ceiling was hit
        limit: String,
    },
}

fn location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(col)) => format!(" at line {}, column {}", line, col),
        (Some(line), None) => format!(" at line {}", line),
        _ => String::new(),
    }
}

impl ScriptError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
            line: None,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(reason: S) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Whether the run was stopped from outside rather than failing on its own
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the run was stopped by a sandbox ceiling
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

/// Error raised by a host function, carried through the engine as a thrown value
#[derive(Debug, Clone)]
pub(crate) enum HostError {
    InvalidArgumentType {
        name: &'static str,
        expected: &'static str,
        found: String,
    },
    InvalidArgument {
        name: &'static str,
        message: String,
    },
    Sink(Arc<io::Error>),
}

impl HostError {
    pub(crate) fn invalid_type(name: &'static str, expected: &'static str, found: &str) -> Self {
        Self::InvalidArgumentType {
            name,
            expected,
            found: found.to_string(),
        }
    }

    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgumentType {
                name,
                expected,
                found,
            } => write!(
                f,
                "invalid type for argument '{}': expected {}, found {}",
                name, expected, found
            ),
            Self::InvalidArgument { name, message } => {
                write!(f, "invalid argument '{}': {}", name, message)
            }
            Self::Sink(err) => write!(f, "response write failed: {}", err),
        }
    }
}

impl From<HostError> for Box<EvalAltResult> {
    fn from(err: HostError) -> Self {
        Box::new(EvalAltResult::ErrorRuntime(
            Dynamic::from(err),
            Position::NONE,
        ))
    }
}

impl From<HostError> for ScriptError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::InvalidArgumentType {
                name,
                expected,
                found,
            } => Self::InvalidArgumentType {
                name: name.to_string(),
                expected: expected.to_string(),
                found,
            },
            HostError::InvalidArgument { name, message } => Self::InvalidArgument {
                name: name.to_string(),
                message,
            },
            HostError::Sink(err) => Self::Sink(
                Arc::try_unwrap(err)
                    .unwrap_or_else(|shared| io::Error::new(shared.kind(), shared.to_string())),
            ),
        }
    }
}

impl From<ParseError> for ScriptError {
    fn from(err: ParseError) -> Self {
        let pos = err.1;
        Self::Compilation {
            message: err.0.to_string(),
            line: pos.line(),
            column: pos.position(),
        }
    }
}

/// Strip the call-site wrappers the engine adds around errors raised in
/// script-defined functions and imported modules.
fn innermost(err: EvalAltResult) -> EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(*inner),
        EvalAltResult::ErrorInModule(_, inner, _) => innermost(*inner),
        other => other,
    }
}

impl From<Box<EvalAltResult>> for ScriptError {
    fn from(err: Box<EvalAltResult>) -> Self {
        match innermost(*err) {
            EvalAltResult::ErrorRuntime(value, pos) => {
                if value.is::<HostError>() {
                    value.cast::<HostError>().into()
                } else {
                    Self::Runtime {
                        message: value.to_string(),
                        line: pos.line(),
                    }
                }
            }
            EvalAltResult::ErrorTerminated(token, _) => Self::Cancelled {
                reason: token.to_string(),
            },
            EvalAltResult::ErrorTooManyOperations(_) => Self::ResourceExhausted {
                limit: "max_allocs".to_string(),
            },
            EvalAltResult::ErrorDataTooLarge(what, _) => Self::ResourceExhausted { limit: what },
            EvalAltResult::ErrorTooManyModules(_) => Self::ResourceExhausted {
                limit: "modules".to_string(),
            },
            EvalAltResult::ErrorStackOverflow(_) => Self::ResourceExhausted {
                limit: "call stack".to_string(),
            },
            EvalAltResult::ErrorFunctionNotFound(signature, _) => {
                Self::NoMatchingFunction { signature }
            }
            EvalAltResult::ErrorParsing(kind, pos) => Self::Compilation {
                message: kind.to_string(),
                line: pos.line(),
                column: pos.position(),
            },
            other => Self::Runtime {
                line: other.position().line(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ScriptError> for cuttle_core::Error {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Config(message) => cuttle_core::Error::Config(message),
            ScriptError::Cancelled { reason } => cuttle_core::Error::Cancelled(reason),
            ScriptError::Sink(source) => cuttle_core::Error::Io(source),
            other => cuttle_core::Error::handler("script", other.to_string()),
        }
    }
}
