//! Test utilities.
//!
//! Shared helpers for unit and integration tests:
//! - logging initialization on top of `tracing-subscriber`
//! - [`run_test`], which drives a future on a current-thread runtime
//!   inside a `LocalSet`, the scheduling model the engine requires
//! - a scripted line-oriented protocol driver ([`LineDriver`]) so tests
//!   can exercise the engine without a real HTTP parser

use crate::http::driver::{HttpDriver, HttpDriverFactory, ParseStep};
use crate::http::types::{Method, Request, Response};
use crate::server::connection::WriteSink;
use crate::server::tls::HandshakeInfo;
use bytes::BytesMut;
use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with debug-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Run an async test body on a current-thread runtime inside a
/// `LocalSet`, the environment the engine's `!Send` tasks require.
pub fn run_test<F, Fut>(f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    init_test_logging();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(f()));
}

/// Give spawned engine tasks a moment to run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

/// Scripted wire protocol for tests: every `\n`-terminated input line
/// becomes a GET request whose target is the line; a response is written
/// as its body followed by `\n`. A response carrying
/// `Connection: close` closes the connection after flushing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineDriver;

impl HttpDriver for LineDriver {
    fn parse(&mut self, input: &mut BytesMut) -> crate::Result<ParseStep> {
        match input.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = input.split_to(pos + 1);
                let uri = String::from_utf8_lossy(&line[..pos]).into_owned();
                Ok(ParseStep::Request(Request::new(Method::Get, uri)))
            }
            None => Ok(ParseStep::NeedInput),
        }
    }

    fn pending_request_count(&self) -> usize {
        0
    }

    fn write_response(
        &mut self,
        sink: WriteSink,
        response: Response,
        _request: &Request,
    ) -> LocalBoxFuture<'static, crate::Result<()>> {
        let close_after = response.header("connection") == Some("close");
        let mut bytes = response.body.to_vec();
        bytes.push(b'\n');
        async move { sink.write(&bytes, close_after).await }.boxed_local()
    }
}

/// Factory producing [`LineDriver`]s regardless of handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineDriverFactory;

impl HttpDriverFactory for LineDriverFactory {
    fn select(&self, _handshake: Option<&HandshakeInfo>) -> Box<dyn HttpDriver> {
        Box::new(LineDriver)
    }
}
