//! Synchronous fallback chat completion path, used when the Upstream
//! Chat Bridge doesn't arm in time.
//!
//! Grounded on `providers::openai_compat::process_openai_sse_line` (the
//! per-event parsing shape, simplified to user-visible content only —
//! tool calls and reasoning tags are out of scope here) and
//! `providers::local_llm::models`'s `response.bytes_stream()` pattern
//! for consuming a streaming HTTP body.

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// POST a streaming chat completion request and forward each delta
/// chunk over `on_delta`. Returns the aggregated assistant text.
pub async fn stream_chat_completion(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: Option<&str>,
    model: &str,
    system_prompt: &str,
    user_message: &str,
    on_delta: mpsc::UnboundedSender<String>,
) -> Result<String> {
    let Some(api_key) = api_key else { return Err(Error::NoApiKey) };

    let body = ChatCompletionRequest {
        model,
        stream: true,
        messages: vec![
            ChatMessage { role: "system", content: system_prompt },
            ChatMessage { role: "user", content: user_message },
        ],
    };

    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut aggregated = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            if let Some(delta) = process_sse_line(&line) {
                if !delta.is_empty() {
                    aggregated.push_str(&delta);
                    let _ = on_delta.send(delta);
                }
            }
        }
    }

    Ok(aggregated)
}

/// Parse one SSE line, returning `Some(delta_text)` for a content
/// delta, `Some(String::new())` for an ignorable-but-recognized event,
/// or `None` for a blank/non-data line.
fn process_sse_line(line: &str) -> Option<String> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return Some(String::new());
    }
    if data == "[DONE]" {
        return Some(String::new());
    }

    let evt: Value = serde_json::from_str(data).ok()?;
    let content = evt["choices"][0]["delta"]["content"].as_str().unwrap_or_default();
    Some(content.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"hello"}}]}"#;
        assert_eq!(process_sse_line(line), Some("hello".to_string()));
    }

    #[test]
    fn done_marker_yields_empty_delta() {
        assert_eq!(process_sse_line("data: [DONE]"), Some(String::new()));
    }

    #[test]
    fn non_data_line_yields_none() {
        assert_eq!(process_sse_line(": keep-alive"), None);
        assert_eq!(process_sse_line(""), None);
    }

    #[test]
    fn delta_without_content_yields_empty_string() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(process_sse_line(line), Some(String::new()));
    }
}
