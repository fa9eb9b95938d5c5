//! Capability-specific normalization of raw provider payloads.
//!
//! Providers disagree on field names; each shape accepts the common
//! aliases and rejects empty payloads so a chain can fall through.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Capability, ProviderError};

/// Model accounting reported by AI providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    #[serde(alias = "transcript", alias = "content")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(alias = "text")]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(flatten)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    #[serde(alias = "solution")]
    pub answer: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(flatten)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    #[serde(alias = "question")]
    pub front: String,
    #[serde(alias = "answer")]
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardSet {
    #[serde(alias = "flashcards")]
    pub cards: Vec<Flashcard>,
    #[serde(flatten)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    #[serde(default, alias = "options")]
    pub choices: Vec<String>,
    #[serde(alias = "correct_answer")]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSet {
    pub questions: Vec<QuizQuestion>,
    #[serde(flatten)]
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedResponse {
    Text(ExtractedText),
    Summary(Summary),
    Solution(Solution),
    Flashcards(FlashcardSet),
    Quiz(QuizSet),
}

impl NormalizedResponse {
    pub fn usage(&self) -> Option<&Usage> {
        match self {
            NormalizedResponse::Text(_) => None,
            NormalizedResponse::Summary(s) => Some(&s.usage),
            NormalizedResponse::Solution(s) => Some(&s.usage),
            NormalizedResponse::Flashcards(f) => Some(&f.usage),
            NormalizedResponse::Quiz(q) => Some(&q.usage),
        }
    }
}

fn parse<T: DeserializeOwned>(capability: Capability, raw: Value) -> Result<T, ProviderError> {
    serde_json::from_value(raw)
        .map_err(|e| ProviderError::Malformed(format!("{} payload: {}", capability, e)))
}

fn require(ok: bool, what: &str) -> Result<(), ProviderError> {
    if ok {
        Ok(())
    } else {
        Err(ProviderError::Malformed(format!("empty {}", what)))
    }
}

/// Converts a raw provider payload into the shape expected for `capability`.
pub fn normalize(capability: Capability, raw: Value) -> Result<NormalizedResponse, ProviderError> {
    match capability {
        Capability::Transcribe | Capability::ExtractText | Capability::FetchPage => {
            let text: ExtractedText = parse(capability, raw)?;
            require(!text.text.trim().is_empty(), "text")?;
            Ok(NormalizedResponse::Text(text))
        }
        Capability::Summarize => {
            let summary: Summary = parse(capability, raw)?;
            require(!summary.summary.trim().is_empty(), "summary")?;
            Ok(NormalizedResponse::Summary(summary))
        }
        Capability::SolveMath => {
            let solution: Solution = parse(capability, raw)?;
            require(!solution.answer.trim().is_empty(), "answer")?;
            Ok(NormalizedResponse::Solution(solution))
        }
        Capability::GenerateFlashcards => {
            let set: FlashcardSet = parse(capability, raw)?;
            require(!set.cards.is_empty(), "flashcard set")?;
            Ok(NormalizedResponse::Flashcards(set))
        }
        Capability::GenerateQuiz => {
            let quiz: QuizSet = parse(capability, raw)?;
            require(!quiz.questions.is_empty(), "quiz")?;
            Ok(NormalizedResponse::Quiz(quiz))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcript_alias() {
        let normalized = normalize(
            Capability::Transcribe,
            json!({"transcript": "hello there", "language": "en"}),
        )
        .unwrap();
        match normalized {
            NormalizedResponse::Text(t) => {
                assert_eq!(t.text, "hello there");
                assert_eq!(t.language.as_deref(), Some("en"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_summary_with_usage() {
        let normalized = normalize(
            Capability::Summarize,
            json!({
                "text": "Short version.",
                "key_points": ["one"],
                "model_used": "small-1",
                "tokens_used": 42,
                "confidence_score": 0.9
            }),
        )
        .unwrap();
        let usage = normalized.usage().unwrap();
        assert_eq!(usage.model_used.as_deref(), Some("small-1"));
        assert_eq!(usage.tokens_used, Some(42));
        assert_eq!(usage.confidence_score, Some(0.9));
        match normalized {
            NormalizedResponse::Summary(s) => assert_eq!(s.summary, "Short version."),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_payloads_are_malformed() {
        assert!(matches!(
            normalize(Capability::FetchPage, json!({"text": "   "})),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            normalize(Capability::GenerateFlashcards, json!({"cards": []})),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            normalize(Capability::SolveMath, json!({"steps": ["x"]})),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_flashcard_and_quiz_aliases() {
        let cards = normalize(
            Capability::GenerateFlashcards,
            json!({"flashcards": [{"question": "2+2", "answer": "4"}]}),
        )
        .unwrap();
        assert!(matches!(cards, NormalizedResponse::Flashcards(ref s) if s.cards[0].back == "4"));

        let quiz = normalize(
            Capability::GenerateQuiz,
            json!({"questions": [{"question": "Q?", "options": ["a", "b"], "correct_answer": "a"}]}),
        )
        .unwrap();
        assert!(matches!(quiz, NormalizedResponse::Quiz(ref q) if q.questions[0].choices.len() == 2));
    }
}
