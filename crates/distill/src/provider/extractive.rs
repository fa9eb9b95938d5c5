//! Offline summarizer that picks the highest-scoring sentences.
//!
//! Used as the last resort in the default summarize chain so text jobs can
//! finish without any remote provider configured.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::{Provider, ProviderError, ProviderReply, ProviderRequest};

static RE_SENTENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]*").unwrap());
static RE_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}']+").unwrap());

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "will",
    "with",
];

pub const MODEL_NAME: &str = "extractive";

pub struct ExtractiveSummarizer {
    max_sentences: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self { max_sentences: 3 }
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_sentences: usize) -> Self {
        Self {
            max_sentences: max_sentences.max(1),
        }
    }

    /// Returns the chosen sentences in their original order.
    pub fn summarize(&self, text: &str, max_sentences: usize) -> Vec<String> {
        let sentences: Vec<&str> = RE_SENTENCE
            .find_iter(text)
            .map(|m| m.as_str().trim())
            .filter(|s| !s.is_empty())
            .collect();

        let mut frequency: HashMap<String, usize> = HashMap::new();
        for word in RE_WORD.find_iter(text) {
            let word = word.as_str().to_lowercase();
            if !STOP_WORDS.contains(&word.as_str()) {
                *frequency.entry(word).or_default() += 1;
            }
        }

        let mut scored: Vec<(usize, f64)> = sentences
            .iter()
            .enumerate()
            .map(|(i, sentence)| {
                let words: Vec<String> = RE_WORD
                    .find_iter(sentence)
                    .map(|w| w.as_str().to_lowercase())
                    .collect();
                let total: usize = words
                    .iter()
                    .filter_map(|w| frequency.get(w))
                    .sum();
                let score = if words.is_empty() {
                    0.0
                } else {
                    total as f64 / words.len() as f64
                };
                (i, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut picked: Vec<usize> = scored
            .into_iter()
            .take(max_sentences.max(1))
            .map(|(i, _)| i)
            .collect();
        picked.sort_unstable();
        picked.into_iter().map(|i| sentences[i].to_string()).collect()
    }
}

#[async_trait]
impl Provider for ExtractiveSummarizer {
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderReply, ProviderError> {
        let text = request
            .input
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidInput("missing text".to_string()))?;

        let max_sentences = request
            .options
            .get("max_sentences")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_sentences);

        let key_points = self.summarize(text, max_sentences);
        let word_count = RE_WORD.find_iter(text).count();

        Ok(ProviderReply::Ready(json!({
            "summary": key_points.join(" "),
            "key_points": key_points,
            "model_used": MODEL_NAME,
            "tokens_used": word_count,
            "confidence_score": 0.5,
        })))
    }
}
