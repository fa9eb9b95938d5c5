//! Stage handlers.

use std::sync::LazyLock;

use base64::Engine as _;
use regex::Regex;
use reqwest::Url;
use serde_json::{json, Value};

use super::context::{StageContext, StageServices};
use super::error::StageError;
use crate::job::{ContentType, Source};
use crate::provider::{Capability, NormalizedResponse};
use crate::storage::StoredContent;

static RE_YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtu\.be/|youtube\.com/(?:watch\?(?:.*&)?v=|shorts/|embed/|live/))([A-Za-z0-9_-]{6,})")
        .unwrap()
});
static RE_BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

/// Longest text handed to a provider.
const MAX_TEXT_CHARS: usize = 200_000;
const TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageHandler {
    Initialize,
    LoadSource,
    PrepareText,
    InspectUrl,
    ProbeMedia,
    Transcribe,
    FetchPage,
    ExtractText,
    /// Loads the source and turns it into text with whatever extraction the
    /// content type needs.
    AcquireText,
    Summarize,
    Solve,
    GenerateFlashcards,
    GenerateQuiz,
    Finalize,
    Done,
}

/// Extraction capability for turning `content_type` into text.
pub fn extraction_capability(content_type: ContentType) -> Option<Capability> {
    match content_type {
        ContentType::Text => None,
        ContentType::Link => Some(Capability::FetchPage),
        ContentType::Youtube | ContentType::Audio | ContentType::Video => {
            Some(Capability::Transcribe)
        }
        ContentType::Pdf | ContentType::Image => Some(Capability::ExtractText),
    }
}

impl StageHandler {
    /// The provider capability this handler calls for `content_type`, if any.
    pub fn capability(&self, content_type: ContentType) -> Option<Capability> {
        match self {
            StageHandler::Transcribe => Some(Capability::Transcribe),
            StageHandler::FetchPage => Some(Capability::FetchPage),
            StageHandler::ExtractText => Some(Capability::ExtractText),
            StageHandler::AcquireText => extraction_capability(content_type),
            StageHandler::Summarize => Some(Capability::Summarize),
            StageHandler::Solve => Some(Capability::SolveMath),
            StageHandler::GenerateFlashcards => Some(Capability::GenerateFlashcards),
            StageHandler::GenerateQuiz => Some(Capability::GenerateQuiz),
            StageHandler::Initialize
            | StageHandler::LoadSource
            | StageHandler::PrepareText
            | StageHandler::InspectUrl
            | StageHandler::ProbeMedia
            | StageHandler::Finalize
            | StageHandler::Done => None,
        }
    }

    pub async fn run(
        self,
        ctx: &mut StageContext,
        services: &StageServices,
    ) -> Result<(), StageError> {
        match self {
            StageHandler::Initialize => initialize(ctx),
            StageHandler::LoadSource => load_source(ctx, services).await,
            StageHandler::PrepareText => prepare_text(ctx),
            StageHandler::InspectUrl => inspect_url(ctx),
            StageHandler::ProbeMedia => probe_media(ctx),
            StageHandler::Transcribe => extract(ctx, services, Capability::Transcribe).await,
            StageHandler::FetchPage => extract(ctx, services, Capability::FetchPage).await,
            StageHandler::ExtractText => extract(ctx, services, Capability::ExtractText).await,
            StageHandler::AcquireText => acquire_text(ctx, services).await,
            StageHandler::Summarize => summarize(ctx, services).await,
            StageHandler::Solve => solve(ctx, services).await,
            StageHandler::GenerateFlashcards => generate_flashcards(ctx, services).await,
            StageHandler::GenerateQuiz => generate_quiz(ctx, services).await,
            StageHandler::Finalize => finalize(ctx),
            StageHandler::Done => Ok(()),
        }
    }
}

fn initialize(ctx: &mut StageContext) -> Result<(), StageError> {
    if !(ctx.job.options.is_object() || ctx.job.options.is_null()) {
        return Err(StageError::Validation(
            "options must be an object".to_string(),
        ));
    }
    ctx.metadata.insert(
        "pipeline".to_string(),
        json!(format!("{}/{}", ctx.job.tool_type, ctx.job.content_type)),
    );
    Ok(())
}

fn option_str<'a>(options: &'a Value, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}

fn decode_inline(data: &str, options: &Value) -> Result<StoredContent, StageError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| StageError::Validation(format!("Inline data is not valid base64: {}", e)))?;
    let name = option_str(options, "filename").unwrap_or("inline").to_string();
    let mime = match option_str(options, "mime_type") {
        Some(mime) => mime.to_string(),
        None => mime_guess::from_path(&name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    };
    Ok(StoredContent { bytes, mime, name })
}

fn parse_url(raw: &str) -> Result<Url, StageError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| StageError::Validation(format!("Invalid URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(StageError::Validation(format!(
            "Unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

async fn load_source(ctx: &mut StageContext, services: &StageServices) -> Result<(), StageError> {
    let source = ctx.job.source.clone();
    match source {
        Source::Text(text) => {
            if text.trim().is_empty() {
                return Err(StageError::Validation("Text source is empty".to_string()));
            }
            ctx.text = Some(text);
        }
        Source::Url(raw) => {
            ctx.url = Some(parse_url(&raw)?);
            ctx.metadata
                .insert("source_url".to_string(), json!(raw.trim()));
        }
        Source::Stored(key) => {
            let content = services.content.fetch(&key).await?;
            ctx.title.get_or_insert_with(|| content.name.clone());
            ctx.stored = Some(content);
        }
        Source::Inline(data) => {
            ctx.stored = Some(decode_inline(&data, &ctx.job.options)?);
        }
    }

    if let Some(ref stored) = ctx.stored {
        if stored.bytes.is_empty() {
            return Err(StageError::Validation("Source content is empty".to_string()));
        }
        ctx.metadata
            .insert("content_bytes".to_string(), json!(stored.bytes.len()));
        ctx.metadata
            .insert("mime_type".to_string(), json!(stored.mime));
    }
    ctx.metadata
        .insert("source_type".to_string(), json!(ctx.job.source.kind()));
    Ok(())
}

/// Normalizes whitespace and caps the length of `text`.
pub fn clean_text(text: &str) -> (String, bool) {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = RE_SPACES.replace_all(&text, " ");
    let text = RE_BLANK_LINES.replace_all(&text, "\n\n");
    let text = text.trim();
    if text.chars().count() > MAX_TEXT_CHARS {
        (text.chars().take(MAX_TEXT_CHARS).collect(), true)
    } else {
        (text.to_string(), false)
    }
}

fn prepare_text(ctx: &mut StageContext) -> Result<(), StageError> {
    let (cleaned, truncated) = clean_text(ctx.require_text()?);
    ctx.metadata.insert(
        "word_count".to_string(),
        json!(cleaned.split_whitespace().count()),
    );
    if truncated {
        ctx.metadata.insert("truncated".to_string(), json!(true));
    }
    ctx.text = Some(cleaned);
    Ok(())
}

/// Extracts the video id from a YouTube URL.
pub fn youtube_video_id(url: &str) -> Option<String> {
    RE_YOUTUBE_ID
        .captures(url)
        .map(|c| c[1].to_string())
}

fn inspect_url(ctx: &mut StageContext) -> Result<(), StageError> {
    let url = ctx
        .url
        .as_ref()
        .ok_or_else(|| StageError::Validation("A URL source is required".to_string()))?;
    let host = url.host_str().unwrap_or_default().to_string();

    if ctx.job.content_type == ContentType::Youtube {
        let id = youtube_video_id(url.as_str()).ok_or_else(|| {
            StageError::Validation(format!("'{}' is not a YouTube video URL", url))
        })?;
        ctx.metadata.insert("video_id".to_string(), json!(id));
        ctx.video_id = Some(id);
    }
    ctx.metadata.insert("source_host".to_string(), json!(host));
    Ok(())
}

fn probe_media(ctx: &mut StageContext) -> Result<(), StageError> {
    let expected = match ctx.job.content_type {
        ContentType::Audio => "audio/",
        ContentType::Video | ContentType::Youtube => "video/",
        other => {
            return Err(StageError::Internal(format!(
                "media probe on {} content",
                other
            )))
        }
    };

    match (&ctx.stored, &ctx.url) {
        (Some(stored), _) => {
            let mime = stored.mime.as_str();
            if !(mime.starts_with(expected) || mime == "application/octet-stream") {
                return Err(StageError::Validation(format!(
                    "Expected {} content, got {}",
                    ctx.job.content_type, mime
                )));
            }
            ctx.metadata.insert("media_source".to_string(), json!("upload"));
        }
        (None, Some(_)) => {
            ctx.metadata.insert("media_source".to_string(), json!("remote"));
        }
        (None, None) => {
            return Err(StageError::Validation(
                "No media available to process".to_string(),
            ))
        }
    }
    Ok(())
}

async fn extract(
    ctx: &mut StageContext,
    services: &StageServices,
    capability: Capability,
) -> Result<(), StageError> {
    let input = ctx.source_input();
    let response = ctx.run_chain(services, capability, input).await?;
    let NormalizedResponse::Text(extracted) = response else {
        return Err(StageError::Internal(format!(
            "{} returned a non-text response",
            capability
        )));
    };

    if let Some(title) = extracted.title {
        ctx.title = Some(title);
    }
    if let Some(language) = extracted.language {
        ctx.metadata.insert("language".to_string(), json!(language));
    }
    let (cleaned, truncated) = clean_text(&extracted.text);
    ctx.metadata.insert(
        "word_count".to_string(),
        json!(cleaned.split_whitespace().count()),
    );
    if truncated {
        ctx.metadata.insert("truncated".to_string(), json!(true));
    }
    ctx.text = Some(cleaned);
    Ok(())
}

async fn acquire_text(ctx: &mut StageContext, services: &StageServices) -> Result<(), StageError> {
    load_source(ctx, services).await?;
    match ctx.job.content_type {
        ContentType::Text => prepare_text(ctx),
        ContentType::Link => {
            inspect_url(ctx)?;
            extract(ctx, services, Capability::FetchPage).await
        }
        ContentType::Youtube => {
            inspect_url(ctx)?;
            extract(ctx, services, Capability::Transcribe).await
        }
        ContentType::Pdf | ContentType::Image => {
            extract(ctx, services, Capability::ExtractText).await
        }
        ContentType::Audio | ContentType::Video => {
            probe_media(ctx)?;
            extract(ctx, services, Capability::Transcribe).await
        }
    }
}

fn text_input(ctx: &StageContext) -> Result<Value, StageError> {
    Ok(json!({
        "text": ctx.require_text()?,
        "title": ctx.title,
    }))
}

fn unexpected(capability: Capability) -> StageError {
    StageError::Internal(format!("{} returned an unexpected response shape", capability))
}

async fn summarize(ctx: &mut StageContext, services: &StageServices) -> Result<(), StageError> {
    let input = text_input(ctx)?;
    match ctx.run_chain(services, Capability::Summarize, input).await? {
        NormalizedResponse::Summary(summary) => {
            ctx.result = Some(json!({
                "summary": summary.summary,
                "key_points": summary.key_points,
            }));
            Ok(())
        }
        _ => Err(unexpected(Capability::Summarize)),
    }
}

async fn solve(ctx: &mut StageContext, services: &StageServices) -> Result<(), StageError> {
    let problem = ctx.require_text()?.to_string();
    let input = json!({ "problem": problem, "text": problem });
    match ctx.run_chain(services, Capability::SolveMath, input).await? {
        NormalizedResponse::Solution(solution) => {
            ctx.result = Some(json!({
                "problem": problem,
                "answer": solution.answer,
                "steps": solution.steps,
            }));
            Ok(())
        }
        _ => Err(unexpected(Capability::SolveMath)),
    }
}

async fn generate_flashcards(
    ctx: &mut StageContext,
    services: &StageServices,
) -> Result<(), StageError> {
    let input = text_input(ctx)?;
    match ctx
        .run_chain(services, Capability::GenerateFlashcards, input)
        .await?
    {
        NormalizedResponse::Flashcards(set) => {
            ctx.metadata
                .insert("card_count".to_string(), json!(set.cards.len()));
            ctx.result = Some(json!({ "cards": set.cards }));
            Ok(())
        }
        _ => Err(unexpected(Capability::GenerateFlashcards)),
    }
}

async fn generate_quiz(ctx: &mut StageContext, services: &StageServices) -> Result<(), StageError> {
    let input = text_input(ctx)?;
    match ctx.run_chain(services, Capability::GenerateQuiz, input).await? {
        NormalizedResponse::Quiz(quiz) => {
            ctx.metadata
                .insert("question_count".to_string(), json!(quiz.questions.len()));
            ctx.result = Some(json!({ "questions": quiz.questions }));
            Ok(())
        }
        _ => Err(unexpected(Capability::GenerateQuiz)),
    }
}

fn derive_title(ctx: &StageContext) -> String {
    if let Some(title) = ctx.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    if let Some(line) = ctx
        .text
        .as_deref()
        .and_then(|t| t.lines().map(str::trim).find(|l| !l.is_empty()))
    {
        let mut title: String = line.chars().take(TITLE_CHARS).collect();
        if line.chars().count() > TITLE_CHARS {
            title.push_str("...");
        }
        return title;
    }
    format!("{} ({})", ctx.job.tool_type, ctx.job.content_type)
}

fn finalize(ctx: &mut StageContext) -> Result<(), StageError> {
    if ctx.result.is_none() {
        return Err(StageError::Internal("No result was produced".to_string()));
    }
    let title = derive_title(ctx);
    ctx.metadata.insert("title".to_string(), json!(title));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_ids() {
        assert_eq!(
            youtube_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            youtube_video_id("https://youtube.com/watch?feature=share&v=abc123XYZ"),
            Some("abc123XYZ".to_string())
        );
        assert_eq!(
            youtube_video_id("https://youtu.be/dQw4w9WgXcQ?t=10"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            youtube_video_id("https://www.youtube.com/shorts/aBcDeF123"),
            Some("aBcDeF123".to_string())
        );
        assert_eq!(youtube_video_id("https://example.com/watch?v=abc"), None);
    }

    #[test]
    fn test_clean_text() {
        let (text, truncated) = clean_text("  Hello\t\tworld\r\n\r\n\r\n\r\nBye  ");
        assert_eq!(text, "Hello world\n\nBye");
        assert!(!truncated);

        let long = "a".repeat(MAX_TEXT_CHARS + 10);
        let (text, truncated) = clean_text(&long);
        assert!(truncated);
        assert_eq!(text.len(), MAX_TEXT_CHARS);
    }

    #[test]
    fn test_extraction_capability() {
        assert_eq!(extraction_capability(ContentType::Text), None);
        assert_eq!(
            extraction_capability(ContentType::Youtube),
            Some(Capability::Transcribe)
        );
        assert_eq!(
            extraction_capability(ContentType::Image),
            Some(Capability::ExtractText)
        );
    }

    #[test]
    fn test_decode_inline() {
        let stored = decode_inline(
            &base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.4"),
            &json!({"filename": "paper.pdf"}),
        )
        .unwrap();
        assert_eq!(stored.mime, "application/pdf");
        assert_eq!(stored.bytes, b"%PDF-1.4");

        assert!(matches!(
            decode_inline("not base64!!", &Value::Null),
            Err(StageError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_url_schemes() {
        assert!(parse_url("https://example.com/a").is_ok());
        assert!(parse_url("ftp://example.com/a").is_err());
        assert!(parse_url("nope").is_err());
    }
}
