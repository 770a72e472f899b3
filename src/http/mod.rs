//! HTTP-facing surface of the engine.
//!
//! The engine does not speak HTTP itself; it drives sockets and delegates
//! the wire format to a pluggable [`HttpDriver`](driver::HttpDriver).
//! This module holds that seam and the value types that cross it:
//!
//! - [`types`]: [`Method`], [`Request`], [`Response`]
//! - [`driver`]: the driver, factory, handler, and error-handler traits
//! - [`pages`]: built-in HTML error and debug pages

pub mod driver;
pub mod pages;
pub mod types;

pub use driver::{
    handler_fn, DefaultErrorHandler, ErrorHandler, HandlerFn, HttpDriver, HttpDriverFactory,
    ParseStep, RequestHandler,
};
pub use types::{default_reason, Method, Request, Response};
