use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

pub const DEFAULT_SANITIZE_TIMEOUT: Duration = Duration::from_millis(250);

/// Cleans message HTML before it is handed to a client. Implementations may be slow or
/// pathological on hostile input; callers bound them with [`sanitize_with_timeout`].
pub trait HtmlSanitizer: Send + Sync {
    fn sanitize(&self, html: &str, plaintext_fallback: &str) -> String;
}

/// Returns the HTML unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSanitizer;

impl HtmlSanitizer for PassthroughSanitizer {
    fn sanitize(&self, html: &str, _plaintext_fallback: &str) -> String {
        html.to_string()
    }
}

pub fn strip_html(html: &str) -> String {
    let mut bytes = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut bytes, 80)
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the sanitizer on a blocking thread. On timeout or panic the plaintext fallback is
/// returned: `body_text` when present, otherwise a text rendering of the HTML.
pub async fn sanitize_with_timeout(
    sanitizer: Arc<dyn HtmlSanitizer>,
    html: String,
    body_text: Option<String>,
    limit: Duration,
) -> String {
    let fallback = body_text.unwrap_or_else(|| strip_html(&html));
    let task_fallback = fallback.clone();
    let task = tokio::task::spawn_blocking(move || sanitizer.sanitize(&html, &task_fallback));

    match timeout(limit, task).await {
        Ok(Ok(clean)) => clean,
        Ok(Err(err)) => {
            warn!(error = %err, "html sanitizer failed, using plaintext fallback");
            fallback
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "html sanitizer timed out, using plaintext fallback");
            fallback
        }
    }
}
