//! Protocol driver and application seams.
//!
//! The engine owns the connection lifecycle; everything protocol- or
//! application-specific plugs in through the traits here:
//!
//! - [`HttpDriver`] parses wire bytes into [`Request`]s and serializes
//!   [`Response`]s back through the connection's write sink.
//! - [`HttpDriverFactory`] picks a driver per connection, typically from
//!   the ALPN result in [`HandshakeInfo`].
//! - [`RequestHandler`] is the application; [`handler_fn`] adapts a
//!   closure.
//! - [`ErrorHandler`] renders status codes into responses, with
//!   [`DefaultErrorHandler`] falling back to the built-in page.
//!
//! All futures are local: the engine runs on a single-threaded
//! cooperative event loop and nothing here is required to be `Send`.

use crate::http::pages;
use crate::http::types::{default_reason, Request, Response};
use crate::server::connection::WriteSink;
use crate::server::tls::HandshakeInfo;
use bytes::BytesMut;
use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;

/// One step of the driver's parser.
pub enum ParseStep {
    /// All buffered input has been consumed; read more from the socket.
    NeedInput,
    /// Backpressure: the read pump must pause until the future resolves,
    /// then step the parser again without new input.
    Suspend(LocalBoxFuture<'static, crate::Result<()>>),
    /// A complete request is ready for dispatch.
    Request(Request),
}

impl fmt::Debug for ParseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeedInput => f.write_str("ParseStep::NeedInput"),
            Self::Suspend(_) => f.write_str("ParseStep::Suspend(..)"),
            Self::Request(req) => f.debug_tuple("ParseStep::Request").field(req).finish(),
        }
    }
}

/// Protocol-specific parser and writer plugged into a connection.
///
/// The engine calls [`parse`](Self::parse) once before any input arrives
/// (priming), then after every socket read until the step is
/// [`ParseStep::NeedInput`]. `parse` must tolerate an empty input buffer.
/// Requests emitted here are dispatched in order; the engine guarantees
/// their responses are written back in the same order.
pub trait HttpDriver {
    /// Advance the parser over buffered input, consuming what it uses.
    fn parse(&mut self, input: &mut BytesMut) -> crate::Result<ParseStep>;

    /// Number of requests currently being parsed: head received, body not
    /// yet complete. The reaper uses this to distinguish "client is slow"
    /// from "handler is busy".
    fn pending_request_count(&self) -> usize;

    /// Serialize `response` onto the connection through `sink`. The
    /// returned future must not borrow the driver; it is awaited while
    /// other parser calls may run.
    fn write_response(
        &mut self,
        sink: WriteSink,
        response: Response,
        request: &Request,
    ) -> LocalBoxFuture<'static, crate::Result<()>>;
}

/// Picks a driver for a newly accepted connection.
pub trait HttpDriverFactory {
    /// Select a driver, typically by the ALPN result of the handshake.
    /// `handshake` is `None` for plaintext connections.
    fn select(&self, handshake: Option<&HandshakeInfo>) -> Box<dyn HttpDriver>;
}

/// The application's request handler.
///
/// A returned [`Error::ClientDisconnected`](crate::Error::ClientDisconnected)
/// closes the connection silently; any other error is rendered into an
/// exception response.
pub trait RequestHandler {
    /// Produce the response for one request.
    fn handle_request(&self, request: Request) -> LocalBoxFuture<'static, crate::Result<Response>>;
}

/// Adapt an async closure into a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = crate::Result<Response>> + 'static,
{
    HandlerFn { f }
}

/// A [`RequestHandler`] backed by a closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = crate::Result<Response>> + 'static,
{
    fn handle_request(&self, request: Request) -> LocalBoxFuture<'static, crate::Result<Response>> {
        (self.f)(request).boxed_local()
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// Renders an error status into a response.
///
/// May itself fail; the engine then falls back to the built-in template.
pub trait ErrorHandler {
    /// Produce the response for an error status. `request` is present
    /// when the error arose while responding to a specific request.
    fn handle_error(
        &self,
        status: u16,
        reason: &str,
        request: Option<&Request>,
    ) -> LocalBoxFuture<'static, crate::Result<Response>>;
}

/// The built-in error handler: renders the minimal `{code} {reason}` page.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle_error(
        &self,
        status: u16,
        reason: &str,
        _request: Option<&Request>,
    ) -> LocalBoxFuture<'static, crate::Result<Response>> {
        let response = pages::error_page(status, reason);
        async move { Ok(response) }.boxed_local()
    }
}

/// Render the last-resort fallback page for `status`, used when the error
/// handler itself fails.
#[must_use]
pub fn fallback_error_response(status: u16) -> Response {
    pages::error_page(status, default_reason(status))
}
