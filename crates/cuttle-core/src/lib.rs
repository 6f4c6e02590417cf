//! # Cuttle Core
//!
//! Pipeline primitives shared by Cuttle handlers.
//!
//! This crate provides the small contract every handler stage is written against:
//! - The [`Middleware`] trait, the [`Pipeline`] that runs stages in order and
//!   the [`Next`] continuation carrying the request's cancellation scope
//! - The pipeline [`Error`] type and its HTTP status mapping
//! - The [`Body`] type carried through the chain

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod middleware;

pub use error::{Error, Result};
pub use middleware::{endpoint, Body, Endpoint, Middleware, Next, Pipeline};
pub use tokio_util::sync::CancellationToken;

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::middleware::{endpoint, Body, Middleware, Next, Pipeline};
}
