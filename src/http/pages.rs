//! Built-in HTML responses.
//!
//! The engine renders two page shapes itself: the minimal error page used
//! as the last-resort fallback when the error handler fails, and the
//! debug trace page shown for handler faults when debug mode is on. Both
//! are plain placeholder substitution; every substituted value is
//! HTML-escaped.

use crate::http::types::{default_reason, Response};

const ERROR_TEMPLATE: &str = "\
<!DOCTYPE html>\n\
<html lang=\"en\">\n\
<head><title>{code} {reason}</title></head>\n\
<body><h1>{code} {reason}</h1></body>\n\
</html>\n";

const DEBUG_TEMPLATE: &str = "\
<!DOCTYPE html>\n\
<html lang=\"en\">\n\
<head><title>Internal server error</title></head>\n\
<body>\n\
<h1>Internal server error</h1>\n\
<p>Unhandled failure while responding to <code>{uri}</code>.</p>\n\
<dl>\n\
<dt>Class</dt><dd>{class}</dd>\n\
<dt>Message</dt><dd>{message}</dd>\n\
</dl>\n\
<h2>Trace</h2>\n\
<pre>{trace}</pre>\n\
</body>\n\
</html>\n";

/// Escape a string for inclusion in HTML text or attribute content.
#[must_use]
pub fn html_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Substitute `{key}` placeholders, escaping every value. Placeholders
/// with no matching key are left as-is.
fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut page = template.to_owned();
    for (key, value) in substitutions {
        page = page.replace(&format!("{{{key}}}"), &html_escape(value));
    }
    page
}

/// The minimal error page keyed on status code and reason.
pub(crate) fn error_page(status: u16, reason: &str) -> Response {
    let body = render(
        ERROR_TEMPLATE,
        &[("code", status.to_string().as_str()), ("reason", reason)],
    );
    Response::new(status, reason, body.into_bytes())
        .with_header("Content-Type", "text/html; charset=utf-8")
}

/// The debug trace page rendered for handler faults in debug mode.
pub(crate) fn debug_page(uri: &str, class: &str, message: &str, trace: &str) -> Response {
    let body = render(
        DEBUG_TEMPLATE,
        &[
            ("uri", uri),
            ("class", class),
            ("message", message),
            ("trace", trace),
        ],
    );
    Response::new(500, default_reason(500), body.into_bytes())
        .with_header("Content-Type", "text/html; charset=utf-8")
}

/// The full source chain of an error, one cause per line.
pub(crate) fn source_chain(error: &dyn std::error::Error) -> String {
    let mut lines = vec![error.to_string()];
    let mut cause = error.source();
    while let Some(err) = cause {
        lines.push(format!("caused by: {err}"));
        cause = err.source();
    }
    lines.join("\n")
}
