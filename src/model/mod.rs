//! Language-model client interface.
//!
//! The pipeline only ever needs one operation: send a system message and a
//! prompt, get text back. Implementations decide transport, auth, and
//! concurrency limits; calls may block for seconds and fail transiently,
//! so the phases go through [`complete_json_with_retry`].

mod openai;

use async_trait::async_trait;

pub use openai::OpenAiClient;

use crate::cancel::CancelFlag;
use crate::error::{PipelineError, Result};

/// Attempts per model call before the surrounding round gives up.
pub const MODEL_RETRIES: usize = 3;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Implementation name, for logs.
    fn name(&self) -> &str;

    /// Issue one completion. With `expect_json` the implementation should
    /// request a JSON-only response where the transport supports it; the
    /// caller still validates the result either way.
    async fn complete(&self, system: &str, prompt: &str, expect_json: bool) -> Result<String>;
}

/// Call the model and parse a JSON value out of the reply, retrying with
/// the same prompt on transient transport failures and on malformed
/// output. Both error classes share one attempt budget.
pub async fn complete_json_with_retry(
    client: &dyn ModelClient,
    system: &str,
    prompt: &str,
    retries: usize,
    cancel: &CancelFlag,
) -> Result<serde_json::Value> {
    let mut last_err = None;
    for attempt in 0..retries {
        cancel.checkpoint()?;
        let outcome = match client.complete(system, prompt, true).await {
            Ok(reply) => extract_json(&reply),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    model = client.name(),
                    attempt = attempt + 1,
                    error = %err,
                    "model call failed, retrying"
                );
                last_err = Some(err);
                tokio::time::sleep(std::time::Duration::from_millis(500 * (attempt as u64 + 1)))
                    .await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::Model("no attempts were made".to_string())))
}

/// Pull the first JSON value out of a model reply.
///
/// Models wrap JSON in markdown fences or chat around it no matter how
/// firmly the prompt forbids it, so this tries, in order: the whole reply,
/// the contents of the first code fence, and the first balanced
/// `{...}` / `[...]` span.
pub fn extract_json(reply: &str) -> Result<serde_json::Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(fenced) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(fenced.trim()) {
            return Ok(value);
        }
    }

    if let Some(span) = balanced_span(trimmed) {
        if let Ok(value) = serde_json::from_str(span) {
            return Ok(value);
        }
    }

    Err(PipelineError::Parse(format!(
        "no JSON value found in model reply (first 200 chars: {:?})",
        &trimmed.chars().take(200).collect::<String>()
    )))
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let open = text.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.bytes().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn extracts_bare_json() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_fenced_json() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_embedded_json() {
        let reply = r#"The schema is {"title": {"type": "string"}} as requested."#;
        let value = extract_json(reply).unwrap();
        assert!(value["title"].is_object());
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let reply = r#"note {"a": "closing } inside", "b": 2} tail"#;
        let value = extract_json(reply).unwrap();
        assert_eq!(value["b"], 2);
    }

    #[test]
    fn no_json_is_a_parse_error() {
        assert!(matches!(
            extract_json("I could not produce a schema."),
            Err(PipelineError::Parse(_))
        ));
    }

    struct FlakyClient {
        /// Scripted replies; a `None` entry simulates a transport failure.
        replies: Mutex<Vec<Option<String>>>,
    }

    impl FlakyClient {
        fn new(replies: &[Option<&str>]) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .iter()
                        .rev()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl ModelClient for FlakyClient {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _: &str, _: &str, _: bool) -> Result<String> {
            match self.replies.lock().unwrap().pop() {
                Some(Some(reply)) => Ok(reply),
                _ => Err(PipelineError::Model("503".into())),
            }
        }
    }

    #[tokio::test]
    async fn retries_transport_failures() {
        let client = FlakyClient::new(&[None, None, Some(r#"{"ok": true}"#)]);
        let value = complete_json_with_retry(&client, "s", "p", 3, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn retries_malformed_output() {
        let client = FlakyClient::new(&[Some("not json at all"), Some(r#"{"ok": 1}"#)]);
        let value = complete_json_with_retry(&client, "s", "p", 3, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(value["ok"], 1);
    }

    #[tokio::test]
    async fn gives_up_after_the_retry_budget() {
        let client = FlakyClient::new(&[]);
        let err = complete_json_with_retry(&client, "s", "p", 3, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Model(_)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_retries() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let client = FlakyClient::new(&[Some("{}")]);
        let err = complete_json_with_retry(&client, "s", "p", 3, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
