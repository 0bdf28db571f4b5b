use crate::errors::{PilotError, PilotResult};
use crate::llm::types::{StreamChunk, StreamChunkKind};

/// Parses one line of an OpenAI-style SSE stream. Keep-alives, comments and
/// deltas without text yield `None`.
pub fn parse_sse_line(line: &str) -> PilotResult<Option<StreamChunk>> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(None);
    };
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        }));
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|e| PilotError::SseParsing(e.to_string()))?;
    let Some(first) = json["choices"].as_array().and_then(|c| c.first()) else {
        return Ok(None);
    };
    let delta = &first["delta"];

    if let Some(reasoning) = delta["reasoning_content"].as_str().filter(|s| !s.is_empty()) {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Reasoning,
            content: reasoning.to_string(),
        }));
    }
    if let Some(content) = delta["content"].as_str().filter(|s| !s.is_empty()) {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Content,
            content: content.to_string(),
        }));
    }
    if first["finish_reason"].as_str().is_some() {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta() {
        let chunk = parse_sse_line(r#"data: {"choices":[{"delta":{"content":"{\"action\""}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.kind, StreamChunkKind::Content);
        assert_eq!(chunk.content, "{\"action\"");
    }

    #[test]
    fn reasoning_delta_takes_precedence() {
        let chunk = parse_sse_line(
            r#"data: {"choices":[{"delta":{"reasoning_content":"think","content":"x"}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(chunk.kind, StreamChunkKind::Reasoning);
    }

    #[test]
    fn done_marker_and_finish_reason() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap().unwrap().kind, StreamChunkKind::Done);
        let fin = parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(fin.kind, StreamChunkKind::Done);
    }

    #[test]
    fn ignores_comments_and_rejects_bad_json() {
        assert!(parse_sse_line(": keep-alive").unwrap().is_none());
        assert!(parse_sse_line("event: ping").unwrap().is_none());
        assert!(matches!(parse_sse_line("data: {oops"), Err(PilotError::SseParsing(_))));
    }
}
