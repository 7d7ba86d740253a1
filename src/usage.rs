//! Usage extraction from upstream response bodies.
//!
//! Parsing dispatches on the declared content type. Upstream-reported usage
//! wins; otherwise prompt and completion are estimated from the request
//! messages and the assembled completion text. Nothing here returns an error:
//! a body that cannot be understood yields an empty snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::tokens::{content_text, TokenEstimator};

/// Token counts and model for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: Option<String>,
    pub source: UsageSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    /// Reported by the upstream.
    Upstream,
    /// Estimated locally.
    Estimated,
    #[default]
    None,
}

impl UsageSnapshot {
    fn new(prompt: u64, completion: u64, model: Option<String>, source: UsageSource) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt.saturating_add(completion),
            model,
            source,
        }
    }
}

/// Response body framing, decided from the `content-type` header only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    EventStream,
    Unknown,
}

impl ContentKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let ct = content_type.unwrap_or("").trim().to_ascii_lowercase();
        if ct.starts_with("application/json") {
            ContentKind::Json
        } else if ct.starts_with("text/event-stream") {
            ContentKind::EventStream
        } else {
            ContentKind::Unknown
        }
    }
}

/// `usage` object as emitted by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ReportedUsage {
    fn from_value(value: &Value) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
        Self {
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
        }
    }

    fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// What a response body revealed, before any estimation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub model: Option<String>,
    pub text: String,
    pub usage: Option<ReportedUsage>,
}

/// Parse a single JSON response object.
pub fn parse_json_body(body: &[u8]) -> Option<ParsedResponse> {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => {
            debug!(error = %err, "response body is not valid JSON");
            return None;
        }
    };
    Some(ParsedResponse {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string),
        text: value.get("content").map(content_text).unwrap_or_default(),
        usage: value.get("usage").map(ReportedUsage::from_value),
    })
}

/// Parse a `data: ` framed event stream. Fragments under `delta.text` or
/// `content[].text` are concatenated; the last `usage` seen wins; the first
/// non-empty model is kept. Frames that are not JSON are skipped.
pub fn parse_event_stream(body: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();

    for line in body.lines() {
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(payload) else {
            continue;
        };

        if parsed.model.is_none() {
            parsed.model = event_model(&event);
        }

        if let Some(text) = event
            .get("delta")
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
        {
            parsed.text.push_str(text);
        } else if let Some(parts) = event.get("content").and_then(Value::as_array) {
            for part in parts {
                if part.get("type").and_then(Value::as_str) == Some("text") {
                    parsed
                        .text
                        .push_str(part.get("text").and_then(Value::as_str).unwrap_or(""));
                }
            }
        }

        if let Some(usage) = event.get("usage") {
            parsed.usage = Some(ReportedUsage::from_value(usage));
        }
    }

    parsed
}

fn event_model(event: &Value) -> Option<String> {
    event
        .get("model")
        .or_else(|| event.get("message").and_then(|m| m.get("model")))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Concatenate the contents of every inbound message, space separated.
pub fn prompt_text(request_body: &[u8]) -> String {
    if request_body.is_empty() {
        return String::new();
    }
    match serde_json::from_slice::<Value>(request_body) {
        Ok(request) => request
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| m.get("content").map(content_text).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, "request body is not valid JSON; prompt treated as empty");
            String::new()
        }
    }
}

fn request_model(request_body: &[u8]) -> Option<String> {
    serde_json::from_slice::<Value>(request_body)
        .ok()?
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Produce the usage snapshot for one completed upstream exchange.
pub fn extract_usage(
    content_type: Option<&str>,
    request_body: &[u8],
    response_body: &[u8],
    estimator: &TokenEstimator,
) -> UsageSnapshot {
    let parsed = match ContentKind::from_content_type(content_type) {
        ContentKind::Json => parse_json_body(response_body),
        ContentKind::EventStream => {
            Some(parse_event_stream(&String::from_utf8_lossy(response_body)))
        }
        ContentKind::Unknown => None,
    };

    let Some(parsed) = parsed else {
        return UsageSnapshot::default();
    };

    if let Some(usage) = parsed.usage.filter(|u| u.total() > 0) {
        debug!(
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "usage reported by upstream"
        );
        return UsageSnapshot::new(
            usage.input_tokens,
            usage.output_tokens,
            parsed.model,
            UsageSource::Upstream,
        );
    }

    let model = parsed.model.or_else(|| request_model(request_body));
    let prompt = prompt_text(request_body);
    let prompt_tokens = estimator.count(&prompt, model.as_deref());
    let completion_tokens = estimator.count(&parsed.text, model.as_deref());
    debug!(
        prompt_chars = prompt.len(),
        completion_chars = parsed.text.len(),
        prompt_tokens,
        completion_tokens,
        "usage estimated locally"
    );
    UsageSnapshot::new(prompt_tokens, completion_tokens, model, UsageSource::Estimated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::EstimationMode;
    use serde_json::json;

    fn heuristic() -> TokenEstimator {
        TokenEstimator::new(EstimationMode::Heuristic)
    }

    #[test]
    fn content_kind_dispatches_on_prefix() {
        assert_eq!(
            ContentKind::from_content_type(Some("application/json; charset=utf-8")),
            ContentKind::Json
        );
        assert_eq!(
            ContentKind::from_content_type(Some("Text/Event-Stream")),
            ContentKind::EventStream
        );
        assert_eq!(
            ContentKind::from_content_type(Some("text/plain")),
            ContentKind::Unknown
        );
        assert_eq!(ContentKind::from_content_type(None), ContentKind::Unknown);
    }

    #[test]
    fn event_stream_collects_model_text_and_last_usage() {
        let body = "data: {\"model\":\"m1\"}\n\
                    data: {\"delta\":{\"text\":\"hi\"}}\n\
                    data: {\"usage\":{\"input_tokens\":3,\"output_tokens\":2}}\n\
                    data: [DONE]\n";
        let parsed = parse_event_stream(body);
        assert_eq!(parsed.model.as_deref(), Some("m1"));
        assert_eq!(parsed.text, "hi");
        assert_eq!(
            parsed.usage,
            Some(ReportedUsage {
                input_tokens: 3,
                output_tokens: 2
            })
        );

        let snapshot = extract_usage(Some("text/event-stream"), b"{}", body.as_bytes(), &heuristic());
        assert_eq!(snapshot.prompt_tokens, 3);
        assert_eq!(snapshot.completion_tokens, 2);
        assert_eq!(snapshot.total_tokens, 5);
        assert_eq!(snapshot.model.as_deref(), Some("m1"));
        assert_eq!(snapshot.source, UsageSource::Upstream);
    }

    #[test]
    fn event_stream_last_usage_wins_and_first_model_kept() {
        let body = "event: message_start\n\
                    data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-haiku\"}}\n\
                    data: {\"model\":\"other\"}\n\
                    data: {\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}\n\
                    data: not json\n\
                    data: {\"content\":[{\"type\":\"text\",\"text\":\"a\"},{\"type\":\"tool_use\"},{\"type\":\"text\",\"text\":\"b\"}]}\n\
                    data: {\"usage\":{\"input_tokens\":10,\"output_tokens\":7}}\n";
        let parsed = parse_event_stream(body);
        assert_eq!(parsed.model.as_deref(), Some("claude-3-haiku"));
        assert_eq!(parsed.text, "ab");
        assert_eq!(parsed.usage.map(|u| u.total()), Some(17));
    }

    #[test]
    fn json_usage_is_authoritative() {
        let body = json!({
            "model": "claude-3-sonnet",
            "content": [{"type": "text", "text": "hello there"}],
            "usage": {"input_tokens": 12, "output_tokens": 30}
        });
        let snapshot = extract_usage(
            Some("application/json"),
            b"{}",
            body.to_string().as_bytes(),
            &heuristic(),
        );
        assert_eq!(snapshot.total_tokens, 42);
        assert_eq!(snapshot.model.as_deref(), Some("claude-3-sonnet"));
        assert_eq!(snapshot.source, UsageSource::Upstream);
    }

    #[test]
    fn json_without_usage_falls_back_to_estimation() {
        let request = json!({
            "model": "claude-3-haiku",
            "messages": [
                {"role": "user", "content": "abcdefgh"},
                {"role": "user", "content": [{"type": "text", "text": "abcdefg"}]}
            ]
        });
        let response = json!({"content": [{"type": "text", "text": "abcdefghijkl"}]});
        let snapshot = extract_usage(
            Some("application/json"),
            request.to_string().as_bytes(),
            response.to_string().as_bytes(),
            &heuristic(),
        );
        // "abcdefgh abcdefg" = 16 chars -> 4, completion 12 chars -> 3
        assert_eq!(snapshot.prompt_tokens, 4);
        assert_eq!(snapshot.completion_tokens, 3);
        assert_eq!(snapshot.total_tokens, 7);
        assert_eq!(snapshot.model.as_deref(), Some("claude-3-haiku"));
        assert_eq!(snapshot.source, UsageSource::Estimated);
    }

    #[test]
    fn zero_usage_counts_as_absent() {
        let response = json!({"content": "abcdefgh", "usage": {"input_tokens": 0, "output_tokens": 0}});
        let snapshot = extract_usage(
            Some("application/json"),
            b"",
            response.to_string().as_bytes(),
            &heuristic(),
        );
        assert_eq!(snapshot.completion_tokens, 2);
        assert_eq!(snapshot.source, UsageSource::Estimated);
    }

    #[test]
    fn oversized_reported_usage_saturates() {
        let body = br#"{"usage":{"input_tokens":18446744073709551615,"output_tokens":1}}"#;
        let snapshot = extract_usage(Some("application/json"), b"{}", body, &heuristic());
        assert_eq!(snapshot.source, UsageSource::Upstream);
        assert_eq!(snapshot.prompt_tokens, u64::MAX);
        assert_eq!(snapshot.completion_tokens, 1);
        assert_eq!(snapshot.total_tokens, u64::MAX);
    }

    #[test]
    fn malformed_or_unknown_bodies_yield_empty_snapshot() {
        let estimator = heuristic();
        assert_eq!(
            extract_usage(Some("application/json"), b"{}", b"{not json", &estimator),
            UsageSnapshot::default()
        );
        assert_eq!(
            extract_usage(Some("text/html"), b"{}", b"<html></html>", &estimator),
            UsageSnapshot::default()
        );
        assert_eq!(
            extract_usage(None, b"{}", b"{\"usage\":{\"input_tokens\":1}}", &estimator),
            UsageSnapshot::default()
        );
    }

    #[test]
    fn malformed_request_body_estimates_completion_only() {
        let snapshot = extract_usage(
            Some("application/json"),
            b"not json",
            br#"{"content":"abcdefgh"}"#,
            &heuristic(),
        );
        assert_eq!(snapshot.prompt_tokens, 0);
        assert_eq!(snapshot.completion_tokens, 2);
    }
}
