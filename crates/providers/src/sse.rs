//! Server-sent event plumbing shared by the streaming clients.

use futures::StreamExt;
use taskforge_core::error::{DEFAULT_RATE_LIMIT_BACKOFF_SECS, ProviderError};
use tracing::warn;

/// Splits a byte stream into complete SSE lines.
#[derive(Default)]
pub(crate) struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    /// Append `bytes` and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line = self.buffer[..end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=end);
            lines.push(line);
        }
        lines
    }
}

/// What a line carries, ignoring comments and blank keep-alives.
pub(crate) enum SseLine<'a> {
    Event(&'a str),
    Data(&'a str),
    Other,
}

pub(crate) fn classify(line: &str) -> SseLine<'_> {
    if let Some(event) = line.strip_prefix("event:") {
        SseLine::Event(event.trim())
    } else if let Some(data) = line.strip_prefix("data:") {
        SseLine::Data(data.trim())
    } else {
        SseLine::Other
    }
}

pub(crate) fn send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::Network(err.to_string())
    }
}

/// Map a non-success status to the provider error taxonomy.
pub(crate) fn status_error(
    provider: &str,
    status: u16,
    retry_after: Option<&str>,
    body: String,
) -> ProviderError {
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF_SECS),
        },
        401 | 403 => {
            ProviderError::AuthenticationFailed(format!("{provider} rejected the credentials"))
        }
        404 => ProviderError::ModelNotFound(body),
        529 => ProviderError::Overloaded(body),
        _ => {
            warn!(provider, status, body = %body, "Provider returned error");
            ProviderError::ApiError {
                status_code: status,
                message: body,
            }
        }
    }
}

/// Fail on non-success statuses, otherwise hand the response back.
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(status_error(provider, status, retry_after.as_deref(), body))
}

/// Feed every SSE line of `response` to `on_line` until it asks to stop.
pub(crate) async fn for_each_line(
    response: reqwest::Response,
    mut on_line: impl FnMut(&str) -> Result<bool, ProviderError>,
) -> Result<(), ProviderError> {
    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::default();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| ProviderError::StreamInterrupted(e.to_string()))?;
        for line in lines.push(&bytes) {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if !on_line(&line)? {
                return Ok(());
            }
        }
    }
    Ok(())
}
