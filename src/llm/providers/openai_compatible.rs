use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::errors::{PilotError, PilotResult};
use crate::llm::provider::LlmProvider;
use crate::llm::sse_parser;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse, StreamChunkKind};

/// Any endpoint speaking the OpenAI chat-completions protocol.
pub struct OpenAiCompatibleProvider {
    id: String,
    /// Full chat-completions URL.
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, api_base: String, api_key: String, timeout: Option<Duration>) -> Self {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let client = builder.build().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "HTTP client build failed; using defaults");
            reqwest::Client::new()
        });
        Self {
            id,
            api_base,
            api_key,
            client,
        }
    }
}

/// Copy of the request body with inline images replaced, for logging.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for part in msgs
            .iter_mut()
            .filter_map(|m| m.get_mut("content").and_then(|c| c.as_array_mut()))
            .flatten()
        {
            if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                part["image_url"]["url"] = serde_json::Value::String("<image omitted>".into());
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(&self, messages: Vec<ChatMessage>, cfg: &CallConfig) -> PilotResult<LlmResponse> {
        let body = serde_json::json!({
            "model": cfg.model,
            "messages": &messages,
            "stream": cfg.stream,
            "temperature": cfg.temperature,
        });

        tracing::debug!(provider = %self.id, model = %cfg.model, stream = cfg.stream, "sending LLM request");
        tracing::trace!(body = %sanitized_body(&body), "request body");

        let response = self
            .client
            .post(&self.api_base)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(PilotError::LlmProvider(format!("{status}: {err_body}")));
        }

        if cfg.stream {
            self.handle_stream(response).await
        } else {
            self.handle_json(response).await
        }
    }
}

impl OpenAiCompatibleProvider {
    async fn handle_stream(&self, response: reqwest::Response) -> PilotResult<LlmResponse> {
        let mut byte_stream = response.bytes_stream();
        let mut pending = String::new();
        let mut out = LlmResponse::default();

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                match sse_parser::parse_sse_line(line.trim()) {
                    Ok(Some(chunk)) => match chunk.kind {
                        StreamChunkKind::Reasoning => out.reasoning.push_str(&chunk.content),
                        StreamChunkKind::Content => out.content.push_str(&chunk.content),
                        StreamChunkKind::Done => break 'stream,
                    },
                    Ok(None) => {}
                    Err(e) => tracing::debug!(error = %e, "SSE line skipped"),
                }
            }
        }

        tracing::info!(
            provider = %self.id,
            content_len = out.content.len(),
            reasoning_len = out.reasoning.len(),
            "LLM stream complete"
        );
        Ok(out)
    }

    async fn handle_json(&self, response: reqwest::Response) -> PilotResult<LlmResponse> {
        let json: serde_json::Value = response.json().await?;
        let message = &json["choices"][0]["message"];
        let out = LlmResponse {
            content: message["content"].as_str().unwrap_or_default().to_string(),
            reasoning: message["reasoning_content"].as_str().unwrap_or_default().to_string(),
        };
        tracing::info!(provider = %self.id, content_len = out.content.len(), "LLM JSON response received");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ChatMessage;

    #[test]
    fn sanitized_body_hides_images() {
        let body = serde_json::json!({
            "model": "m",
            "messages": [
                ChatMessage::system("sys"),
                ChatMessage::user_with_image("look", "data:image/png;base64,SECRET"),
            ],
        });
        let logged = sanitized_body(&body);
        assert!(!logged.contains("SECRET"));
        assert!(logged.contains("<image omitted>"));
        assert!(logged.contains("look"));
    }
}
