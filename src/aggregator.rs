//! C10 — Response aggregator & SSE converter. Parses an Anthropic-shaped
//! SSE stream into a final JSON response, and the reverse: synthesizes an
//! SSE stream from a JSON body (used for the stream-exhausted-then-
//! non-stream-succeeded fallback path).
//!
//! SSE line framing (`data:` prefix stripping, `[DONE]` detection, partial
//! chunk buffering) mirrors the donor app's `forward::client` helpers of
//! the same name; the event-shape constructors mirror its
//! `push_content_block_*` family.

use bytes::Bytes;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default)]
pub struct UsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

#[derive(Debug, Default)]
pub struct StreamResponseAggregator {
    id: Option<String>,
    model: Option<String>,
    text: String,
    stop_reason: Option<String>,
    usage: UsageTotals,
    error: Option<Value>,
}

impl StreamResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one parsed SSE event (`event` name + decoded `data` JSON).
    pub fn feed(&mut self, event: &str, data: &Value) {
        match event {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    self.id = message.get("id").and_then(Value::as_str).map(String::from);
                    self.model = message.get("model").and_then(Value::as_str).map(String::from);
                    if let Some(usage) = message.get("usage") {
                        self.apply_usage(usage);
                    }
                }
            }
            "content_block_delta" => {
                if data.get("delta").and_then(|d| d.get("type")).and_then(Value::as_str) == Some("text_delta") {
                    if let Some(text) = data.pointer("/delta/text").and_then(Value::as_str) {
                        self.text.push_str(text);
                    }
                }
            }
            "message_delta" => {
                if let Some(usage) = data.get("usage") {
                    self.apply_usage(usage);
                }
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            "error" => {
                self.error = data.get("error").cloned().or_else(|| Some(data.clone()));
            }
            _ => {}
        }
    }

    fn apply_usage(&mut self, usage: &Value) {
        if let Some(v) = usage.get("input_tokens").and_then(Value::as_i64) {
            self.usage.input_tokens = v;
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_i64) {
            self.usage.output_tokens = v;
        }
        if let Some(v) = usage.get("cache_creation_input_tokens").and_then(Value::as_i64) {
            self.usage.cache_creation_input_tokens = v;
        }
        if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_i64) {
            self.usage.cache_read_input_tokens = v;
        }
    }

    pub fn error(&self) -> Option<&Value> {
        self.error.as_ref()
    }

    pub fn usage(&self) -> &UsageTotals {
        &self.usage
    }

    pub fn build_final_response(&self) -> Value {
        json!({
            "id": self.id.clone().unwrap_or_default(),
            "type": "message",
            "role": "assistant",
            "model": self.model.clone().unwrap_or_default(),
            "content": [{"type": "text", "text": self.text}],
            "stop_reason": self.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "cache_creation_input_tokens": self.usage.cache_creation_input_tokens,
                "cache_read_input_tokens": self.usage.cache_read_input_tokens,
            }
        })
    }
}

/// Strips a leading `data:` prefix (and exactly one following space) from
/// one SSE line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn parse_sse_event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(|rest| rest.strip_prefix(' ').unwrap_or(rest).trim())
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drains complete lines from a byte buffer, leaving any trailing partial
/// line for the next call — handles chunk boundaries that split a line.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

const CHUNK_CHARS: usize = 50;

/// Synthesizes `message_start`, `content_block_start`, N×
/// `content_block_delta` (chunked to ~50 chars), `content_block_stop`,
/// `message_delta`, `message_stop` from a final JSON response — the
/// fallback path taken when a stream retry loop is exhausted but a
/// non-stream retry succeeds on a still-connected streaming client.
pub fn convert_json_to_sse(body: &Value) -> Vec<Bytes> {
    let mut out = Vec::new();

    let start_event = json!({
        "type": "message_start",
        "message": {
            "id": body.get("id").cloned().unwrap_or(Value::Null),
            "type": "message",
            "role": "assistant",
            "model": body.get("model").cloned().unwrap_or(Value::Null),
            "content": [],
            "stop_reason": null,
            "usage": body.get("usage").cloned().unwrap_or(json!({})),
        }
    });
    push_event(&mut out, "message_start", &start_event);

    push_event(&mut out, "content_block_start", &json!({
        "type": "content_block_start",
        "index": 0,
        "content_block": {"type": "text", "text": ""}
    }));

    let text = body
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or("");
    let chars: Vec<char> = text.chars().collect();
    for piece in chars.chunks(CHUNK_CHARS) {
        let delta_text: String = piece.iter().collect();
        push_event(&mut out, "content_block_delta", &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": delta_text}
        }));
    }

    push_event(&mut out, "content_block_stop", &json!({"type": "content_block_stop", "index": 0}));

    push_event(&mut out, "message_delta", &json!({
        "type": "message_delta",
        "delta": {"stop_reason": body.get("stop_reason").cloned().unwrap_or(Value::Null)},
        "usage": body.get("usage").cloned().unwrap_or(json!({})),
    }));

    push_event(&mut out, "message_stop", &json!({"type": "message_stop"}));

    out
}

fn push_event(out: &mut Vec<Bytes>, event: &str, data: &Value) {
    out.push(Bytes::from(format!("event: {event}\ndata: {data}\n\n")));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_builds_final_response_from_events() {
        let mut agg = StreamResponseAggregator::new();
        agg.feed("message_start", &json!({"message": {"id": "msg_1", "model": "claude-sonnet-4-5-20250929", "usage": {"input_tokens": 10}}}));
        agg.feed("content_block_delta", &json!({"delta": {"type": "text_delta", "text": "hel"}}));
        agg.feed("content_block_delta", &json!({"delta": {"type": "text_delta", "text": "lo"}}));
        agg.feed("message_delta", &json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}}));

        let resp = agg.build_final_response();
        assert_eq!(resp["content"][0]["text"], "hello");
        assert_eq!(resp["stop_reason"], "end_turn");
        assert_eq!(resp["usage"]["input_tokens"], 10);
        assert_eq!(resp["usage"]["output_tokens"], 5);
    }

    #[test]
    fn convert_json_to_sse_round_trips_text() {
        let body = json!({
            "id": "msg_1", "model": "claude-sonnet-4-5-20250929",
            "content": [{"type": "text", "text": "a".repeat(120)}],
            "stop_reason": "end_turn", "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let events = convert_json_to_sse(&body);
        assert!(events.iter().any(|b| b.starts_with(b"event: message_start")));
        assert!(events.iter().any(|b| b.starts_with(b"event: message_stop")));
        let delta_count = events.iter().filter(|b| b.starts_with(b"event: content_block_delta")).count();
        assert_eq!(delta_count, 3); // 120 chars / 50-char chunks
    }

    #[test]
    fn drain_sse_lines_handles_partial_chunks() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":");
        assert!(lines.is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\n");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
    }

    #[test]
    fn is_sse_done_detects_terminator() {
        assert!(is_sse_done("[DONE]"));
        assert!(!is_sse_done("{}"));
    }
}
