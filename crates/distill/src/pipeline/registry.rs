//! The static (tool type, content type) → stage list table.

use std::collections::BTreeSet;

use super::error::StageError;
use super::stage::StageHandler;
use crate::job::{ContentType, ToolType};
use crate::provider::Capability;

/// One step of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub name: &'static str,
    /// Progress reported when the stage begins.
    pub progress: u8,
    pub handler: StageHandler,
}

const fn stage(name: &'static str, progress: u8, handler: StageHandler) -> StageSpec {
    StageSpec {
        name,
        progress,
        handler,
    }
}

use StageHandler::*;

static SUMMARIZE_TEXT: &[StageSpec] = &[
    stage("initializing", 5, Initialize),
    stage("analyzing_content", 10, LoadSource),
    stage("processing_text", 20, PrepareText),
    stage("ai_processing", 50, Summarize),
    stage("finalizing", 90, Finalize),
    stage("done", 100, Done),
];

static SUMMARIZE_YOUTUBE: &[StageSpec] = &[
    stage("initializing", 5, Initialize),
    stage("analyzing_content", 10, LoadSource),
    stage("analyzing_url", 20, InspectUrl),
    stage("processing_video", 30, ProbeMedia),
    stage("transcribing", 50, Transcribe),
    stage("ai_processing", 80, Summarize),
    stage("finalizing", 95, Finalize),
    stage("done", 100, Done),
];

static SUMMARIZE_LINK: &[StageSpec] = &[
    stage("initializing", 5, Initialize),
    stage("analyzing_content", 10, LoadSource),
    stage("analyzing_url", 20, InspectUrl),
    stage("fetching_content", 40, FetchPage),
    stage("ai_processing", 70, Summarize),
    stage("finalizing", 90, Finalize),
    stage("done", 100, Done),
];

static SUMMARIZE_DOCUMENT: &[StageSpec] = &[
    stage("initializing", 5, Initialize),
    stage("analyzing_content", 10, LoadSource),
    stage("extracting_text", 30, ExtractText),
    stage("ai_processing", 60, Summarize),
    stage("finalizing", 90, Finalize),
    stage("done", 100, Done),
];

static SUMMARIZE_MEDIA: &[StageSpec] = &[
    stage("initializing", 5, Initialize),
    stage("analyzing_content", 10, LoadSource),
    stage("processing_media", 30, ProbeMedia),
    stage("transcribing", 50, Transcribe),
    stage("ai_processing", 80, Summarize),
    stage("finalizing", 95, Finalize),
    stage("done", 100, Done),
];

static MATH: &[StageSpec] = &[
    stage("analyzing_problem", 20, AcquireText),
    stage("solving_problem", 60, Solve),
    stage("finalizing", 90, Finalize),
    stage("done", 100, Done),
];

static FLASHCARDS: &[StageSpec] = &[
    stage("analyzing_content", 20, AcquireText),
    stage("generating_flashcards", 60, GenerateFlashcards),
    stage("finalizing", 90, Finalize),
    stage("done", 100, Done),
];

static QUIZ: &[StageSpec] = &[
    stage("analyzing_content", 20, AcquireText),
    stage("generating_quiz", 60, GenerateQuiz),
    stage("finalizing", 90, Finalize),
    stage("done", 100, Done),
];

/// The resolved stage list for one job.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    pub tool_type: ToolType,
    pub content_type: ContentType,
    pub stages: &'static [StageSpec],
}

impl Pipeline {
    /// Capabilities this pipeline may call, in stage order.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        for spec in self.stages {
            if let Some(cap) = spec.handler.capability(self.content_type) {
                if !caps.contains(&cap) {
                    caps.push(cap);
                }
            }
        }
        caps
    }
}

/// Looks up the pipeline for a pair. There is no default pipeline.
pub fn resolve(tool_type: ToolType, content_type: ContentType) -> Result<Pipeline, StageError> {
    use ContentType as C;
    use ToolType as T;

    let stages = match (tool_type, content_type) {
        (T::Summarize, C::Text) => SUMMARIZE_TEXT,
        (T::Summarize, C::Youtube) => SUMMARIZE_YOUTUBE,
        (T::Summarize, C::Link) => SUMMARIZE_LINK,
        (T::Summarize, C::Pdf | C::Image) => SUMMARIZE_DOCUMENT,
        (T::Summarize, C::Audio | C::Video) => SUMMARIZE_MEDIA,
        (T::Math, C::Text | C::Image | C::Pdf) => MATH,
        (T::Math, C::Link | C::Youtube | C::Audio | C::Video) => {
            return Err(unsupported(tool_type, content_type))
        }
        (T::Flashcards, C::Text | C::Link | C::Youtube | C::Pdf) => FLASHCARDS,
        (T::Flashcards, C::Audio | C::Video | C::Image) => {
            return Err(unsupported(tool_type, content_type))
        }
        (T::Quiz, C::Text | C::Link | C::Pdf) => QUIZ,
        (T::Quiz, C::Youtube | C::Audio | C::Video | C::Image) => {
            return Err(unsupported(tool_type, content_type))
        }
    };

    Ok(Pipeline {
        tool_type,
        content_type,
        stages,
    })
}

fn unsupported(tool_type: ToolType, content_type: ContentType) -> StageError {
    StageError::Unsupported {
        tool_type,
        content_type,
    }
}

/// Every pair with a pipeline.
pub fn supported_pairs() -> Vec<(ToolType, ContentType)> {
    ToolType::ALL
        .iter()
        .flat_map(|&t| ContentType::ALL.iter().map(move |&c| (t, c)))
        .filter(|&(t, c)| resolve(t, c).is_ok())
        .collect()
}

/// Capabilities used by at least one pipeline.
pub fn required_capabilities() -> BTreeSet<Capability> {
    supported_pairs()
        .into_iter()
        .filter_map(|(t, c)| resolve(t, c).ok())
        .flat_map(|p| p.capabilities())
        .collect()
}
