//! HTTP and HTTPS query driver
//!
//! Issues one GET or POST per tick over a shared client with redirects
//! disabled. A redirect is not an error: the response is surfaced as
//! data in the form `"<status>\n<location>"`. Error statuses become
//! CRITICAL failures carrying the response body as partial payload.

use shared::status::{Failure, Outcome};
use std::sync::Mutex;
use tracing::debug;

use crate::queries::{HttpSpec, QueryContext};
use crate::query_raw::tcp_failure;
use crate::runnable::lock;

/// Runs one HTTP exchange. The generated `X-Request-Id` is stored in
/// `request_id` so log lines on both ends can be correlated.
pub async fn execute(
    ctx: &QueryContext,
    spec: &HttpSpec,
    timeout: std::time::Duration,
    request_id: &Mutex<Option<String>>,
) -> Outcome {
    let client = if spec.verify {
        &ctx.http_verify
    } else {
        &ctx.http_no_verify
    };

    let url = format!(
        "{}://{}:{}{}",
        spec.scheme(),
        spec.host,
        spec.port,
        spec.path
    );
    debug!("{} {}", spec.method(), url);

    let mut builder = match &spec.data {
        Some(data) => client.post(&url).body(data.clone()),
        None => client.get(&url),
    };

    for (name, value) in &spec.headers {
        if name == "host" {
            builder = builder.header(reqwest::header::HOST, value);
        } else {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    builder = builder.header("x-request-id", &id);
    *lock(request_id) = Some(id);

    let response = match builder.timeout(timeout).send().await {
        Ok(response) => response,
        Err(err) => return Err(request_failure(&err)),
    };

    let status = response.status();
    let status_line = format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );

    if status.is_redirection() {
        // Redirects aren't actually an error: report where we were sent.
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        return Ok(format!("{status_line}\n{location}"));
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(err) => return Err(request_failure(&err)),
    };

    if status.is_success() {
        Ok(body)
    } else {
        Err(Failure::critical(format!("HTTP error: {status_line}")).with_partial(body))
    }
}

/// Maps a reqwest error onto the failure contract: request timeouts,
/// TCP-family connection errors, truncated responses, everything else.
fn request_failure(err: &reqwest::Error) -> Failure {
    if err.is_timeout() {
        return Failure::critical("Timeout waiting on HTTP response").with_error(err.to_string());
    }

    if let Some(io_err) = io_cause(err) {
        return tcp_failure(io_err);
    }

    let text = err.to_string();
    if text.contains("connection closed before message completed") {
        return Failure::critical("Empty HTTP Response").with_error(text);
    }

    Failure::critical(format!("HTTP error: {err}"))
}

/// Walks the error source chain looking for the underlying I/O error.
fn io_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            return Some(io_err);
        }
        source = cause.source();
    }
    None
}
