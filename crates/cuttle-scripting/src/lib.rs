//! # Cuttle Scripting
//!
//! A pipeline stage that runs a sandboxed Rhai script for every request.
//!
//! The script is handed two capability objects:
//!
//! - `request` - a read-only snapshot of the incoming request (method, URL,
//!   protocol, host, headers, Basic credentials)
//! - `response` - the live response: its headers, its status line and its body
//!
//! ```rhai
//! import "log" as log;
//!
//! let creds = request.basic_auth();
//! if creds == () {
//!     let h = response.header();
//!     h["WWW-Authenticate"] = "Basic realm=\"cuttle\"";
//!     response.write_status(401);
//!     throw "missing credentials";
//! }
//! log::info("user " + creds.username);
//! ```
//!
//! ## Features
//!
//! - Compile once at provisioning, or re-read and compile on every request
//! - Per-run engine and scope over a shared compiled program
//! - Operation, constant, size and wall-clock ceilings
//! - Cancellation through the pipeline's per-request scope
//! - Importable utility modules and file imports from a configured directory

#![forbid(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod api;
pub mod config;
pub mod error;
pub mod handler;
pub mod header;
pub mod modules;
pub mod registry;
pub mod request;
pub mod response;
pub mod runtime;

pub use config::{ConfigFormat, ScriptHandlerConfig};
pub use error::{Result, ScriptError};
pub use handler::ScriptHandler;
pub use header::{HeaderBridge, HeaderEntry, HeaderIterator, SharedHeaders};
pub use modules::ModuleRegistry;
pub use registry::{HandlerFactory, HandlerFuture, HandlerRegistry, SCRIPT_HANDLER};
pub use request::{BasicCredentials, RequestCapability};
pub use response::{ResponseCapability, ResponseRecorder, ResponseSink, SharedSink};
pub use runtime::{CompiledProgram, ScriptLimits, ScriptRuntime, SharedProgram};

/// Prelude with commonly used types
pub mod prelude {
    pub use crate::config::ScriptHandlerConfig;
    pub use crate::error::{Result, ScriptError};
    pub use crate::handler::ScriptHandler;
    pub use crate::modules::ModuleRegistry;
    pub use crate::registry::HandlerRegistry;
    pub use crate::response::{ResponseRecorder, ResponseSink};
}
