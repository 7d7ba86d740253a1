//! Token estimation used when the upstream reports no usage.
//!
//! Counting goes through a BPE tokenizer picked by model prefix. In heuristic
//! mode a character-class estimate is used instead: CJK code points weigh 2.5
//! tokens each, everything else 0.25 (four characters per token).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::trace;

/// Fixed per-message formatting overhead added by chat templates.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// BPE encodings known to the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Cl100kBase,
    P50kBase,
    O200kBase,
}

impl Encoding {
    fn bpe(self) -> &'static CoreBPE {
        match self {
            Encoding::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
            Encoding::P50kBase => tiktoken_rs::p50k_base_singleton(),
            Encoding::O200kBase => tiktoken_rs::o200k_base_singleton(),
        }
    }
}

/// Model prefix -> encoding. Claude models have no public tokenizer, cl100k is
/// the closest approximation.
const MODEL_ENCODINGS: &[(&str, Encoding)] = &[
    ("claude-3-opus", Encoding::Cl100kBase),
    ("claude-3-sonnet", Encoding::Cl100kBase),
    ("claude-3-haiku", Encoding::Cl100kBase),
    ("claude-2.1", Encoding::Cl100kBase),
    ("claude-2.0", Encoding::Cl100kBase),
    ("claude-instant-1.2", Encoding::Cl100kBase),
    ("claude", Encoding::Cl100kBase),
    ("gpt-4o", Encoding::O200kBase),
    ("gpt-4", Encoding::Cl100kBase),
    ("gpt-4-32k", Encoding::Cl100kBase),
    ("gpt-3.5-turbo", Encoding::Cl100kBase),
    ("text-davinci-003", Encoding::P50kBase),
    ("text-davinci-002", Encoding::P50kBase),
];

const DEFAULT_ENCODING: Encoding = Encoding::Cl100kBase;

/// Select an encoding by the longest table prefix matching `model`.
pub fn encoding_for_model(model: Option<&str>) -> Encoding {
    let Some(model) = model.map(|m| m.trim().to_ascii_lowercase()) else {
        return DEFAULT_ENCODING;
    };
    MODEL_ENCODINGS
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, enc)| *enc)
        .unwrap_or(DEFAULT_ENCODING)
}

/// How counts are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMode {
    #[default]
    Tiktoken,
    Heuristic,
}

#[derive(Debug, Clone, Default)]
pub struct TokenEstimator {
    mode: EstimationMode,
}

impl TokenEstimator {
    pub fn new(mode: EstimationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> EstimationMode {
        self.mode
    }

    /// Count tokens in `text`. Always 0 for the empty string.
    pub fn count(&self, text: &str, model: Option<&str>) -> u64 {
        if text.is_empty() {
            return 0;
        }
        match self.mode {
            EstimationMode::Heuristic => heuristic_count(text),
            EstimationMode::Tiktoken => {
                let encoding = encoding_for_model(model);
                let tokens = encoding.bpe().encode_with_special_tokens(text).len() as u64;
                trace!(?encoding, tokens, "tokenized text");
                tokens
            }
        }
    }

    /// Sum of `role + content + 4` over chat messages.
    pub fn count_messages(&self, messages: &[Value], model: Option<&str>) -> u64 {
        messages
            .iter()
            .map(|message| {
                let role = message.get("role").and_then(Value::as_str).unwrap_or("");
                let content = message.get("content").map(content_text).unwrap_or_default();
                self.count(role, model) + self.count(&content, model) + MESSAGE_OVERHEAD_TOKENS
            })
            .sum()
    }
}

/// Character-class estimate: 2.5 tokens per CJK char, 4 chars per token otherwise.
pub fn heuristic_count(text: &str) -> u64 {
    let (cjk, other) = text.chars().fold((0u64, 0u64), |(cjk, other), ch| {
        if is_cjk(ch) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    (cjk as f64 * 2.5 + other as f64 / 4.0) as u64
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4e00}'..='\u{9fff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{3040}'..='\u{309f}'
        | '\u{30a0}'..='\u{30ff}')
}

/// Flatten a message `content` value into plain text. Strings pass through;
/// part lists contribute their `text` parts joined by a space.
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_text_is_zero_in_every_mode() {
        for mode in [EstimationMode::Tiktoken, EstimationMode::Heuristic] {
            let estimator = TokenEstimator::new(mode);
            assert_eq!(estimator.count("", None), 0);
            assert_eq!(estimator.count("", Some("gpt-4")), 0);
        }
    }

    #[test]
    fn count_is_deterministic() {
        let estimator = TokenEstimator::default();
        let text = "The quick brown fox jumps over the lazy dog.";
        let first = estimator.count(text, Some("claude-3-haiku-20240307"));
        for _ in 0..5 {
            assert_eq!(estimator.count(text, Some("claude-3-haiku-20240307")), first);
        }
        assert!(first > 0);
    }

    #[test]
    fn longest_prefix_selects_encoding() {
        assert_eq!(encoding_for_model(Some("gpt-4o-mini")), Encoding::O200kBase);
        assert_eq!(encoding_for_model(Some("gpt-4-turbo")), Encoding::Cl100kBase);
        assert_eq!(
            encoding_for_model(Some("TEXT-DAVINCI-003")),
            Encoding::P50kBase
        );
        assert_eq!(encoding_for_model(Some("mystery-model")), DEFAULT_ENCODING);
        assert_eq!(encoding_for_model(None), DEFAULT_ENCODING);
    }

    #[test]
    fn heuristic_weighs_cjk_and_latin_separately() {
        // 8 latin chars -> 2 tokens
        assert_eq!(heuristic_count("abcdefgh"), 2);
        // 2 CJK chars -> 5 tokens
        assert_eq!(heuristic_count("你好"), 5);
        // 1 kana (2.5) + 3 latin (0.75) -> 3.25 truncated
        assert_eq!(heuristic_count("あabc"), 3);
        assert_eq!(heuristic_count("abc"), 0);
    }

    #[test]
    fn message_list_adds_fixed_overhead() {
        let estimator = TokenEstimator::new(EstimationMode::Heuristic);
        let messages = vec![
            json!({"role": "user", "content": "abcdefgh"}),
            json!({"role": "assistant", "content": [{"type": "text", "text": "abcd"}]}),
        ];
        // user: 1 + 2 + 4, assistant: 2 + 1 + 4
        assert_eq!(estimator.count_messages(&messages, None), 14);
        assert_eq!(estimator.count_messages(&[], None), 0);
    }

    #[test]
    fn content_text_skips_non_text_parts() {
        let content = json!([
            {"type": "text", "text": "one"},
            {"type": "image", "source": {}},
            {"type": "text", "text": "two"}
        ]);
        assert_eq!(content_text(&content), "one two");
        assert_eq!(content_text(&json!(null)), "");
    }
}
