//! HTTP surface: the three pipelines, the status probe and static files.

use crate::{
    CaptionEngine,
    assistant::{AssistError, Assistant},
    error::{ApiError, InvalidInput},
    frame::Frame,
    messages::{
        AskRequest, AskResponse, CaptionRequest, CaptionResponse, StatusResponse, VoiceAskResponse,
    },
    store::{AUDIO_ROUTE, AudioKind, AudioStore, audio_url},
    tts::SpeechSynthesizer,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use std::{path::Path, sync::Arc};
use tower_http::{cors::CorsLayer, services::ServeDir};

/// Request bodies carry full camera frames and voice recordings.
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Everything the handlers need, constructed once at startup.
pub struct AppState {
    pub engine: Arc<CaptionEngine>,
    /// `None` when no credential is configured.
    pub assistant: Option<Arc<dyn Assistant>>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub audio: Arc<AudioStore>,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    let audio_files = ServeDir::new(state.audio.dir());

    Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .route("/api/caption", post(post_caption))
        .route("/api/ask", post(post_ask))
        .route("/api/voice-ask", post(post_voice_ask))
        .nest_service(AUDIO_ROUTE, audio_files)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn status(State(state): State<SharedState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.engine.state().as_str().to_string(),
        assistant_configured: state.assistant.is_some(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn post_caption(
    State(state): State<SharedState>,
    payload: Result<Json<CaptionRequest>, JsonRejection>,
) -> Response {
    match caption(&state, payload).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_caption_response(),
    }
}

async fn caption(
    state: &AppState,
    payload: Result<Json<CaptionRequest>, JsonRejection>,
) -> Result<CaptionResponse, ApiError> {
    let Json(request) = payload.map_err(|e| InvalidInput::Body(e.body_text()))?;
    let image = non_empty(request.image).ok_or(InvalidInput::MissingImage)?;
    let frame = Frame::decode(&image).map_err(InvalidInput::from)?;

    let captioned = state.engine.caption(frame.image).await?;
    log::info!(
        "Caption #{} in {:.2}s: {}",
        captioned.id,
        captioned.duration.as_secs_f64(),
        captioned.caption
    );

    let raw_caption = captioned.caption;
    let korean_caption = polish_caption(state.assistant.as_deref(), &raw_caption).await?;
    let tts_url = speak(state, &korean_caption, AudioKind::Caption).await;

    Ok(CaptionResponse {
        raw_caption,
        korean_caption,
        tts_url,
    })
}

/// Rewrites a caption for listening, or hands it back untouched when no
/// assistant is configured.
pub async fn polish_caption(
    assistant: Option<&dyn Assistant>,
    raw_caption: &str,
) -> Result<String, AssistError> {
    match assistant {
        Some(assistant) => assistant.rewrite_caption(raw_caption).await,
        None => Ok(raw_caption.to_string()),
    }
}

async fn post_ask(
    State(state): State<SharedState>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    match ask(&state, payload).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_answer_response(),
    }
}

async fn ask(
    state: &AppState,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<AskResponse, ApiError> {
    let Json(request) = payload.map_err(|e| InvalidInput::Body(e.body_text()))?;
    let question = request.question.as_deref().map(str::trim).unwrap_or_default();
    if question.is_empty() {
        return Err(InvalidInput::EmptyQuestion.into());
    }
    let image = non_empty(request.image).ok_or(InvalidInput::MissingImage)?;
    let frame = Frame::decode(&image).map_err(InvalidInput::from)?;

    let assistant = state.assistant.as_deref().ok_or(ApiError::NotConfigured)?;
    let answer = assistant.answer(&frame.data_url(), question).await?;
    let tts_url = speak(state, &answer, AudioKind::Answer).await;

    Ok(AskResponse {
        answer,
        error: false,
        tts_url,
    })
}

async fn post_voice_ask(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    match voice_ask(&state, multipart).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => e.into_answer_response(),
    }
}

struct VoiceUpload {
    file_name: Option<String>,
    bytes: Bytes,
}

async fn voice_ask(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<VoiceAskResponse, ApiError> {
    let mut multipart = multipart.map_err(|e| InvalidInput::Body(e.body_text()))?;

    let mut audio = None;
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| InvalidInput::Body(e.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("audio") => {
                let file_name = field.file_name().map(str::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| InvalidInput::Body(e.body_text()))?;
                if !bytes.is_empty() {
                    audio = Some(VoiceUpload { file_name, bytes });
                }
            }
            Some("image") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| InvalidInput::Body(e.body_text()))?;
                image = Some(text);
            }
            _ => log::debug!("Ignoring multipart field {:?}", name),
        }
    }

    let audio = audio.ok_or(InvalidInput::MissingAudio)?;
    let image = non_empty(image).ok_or(InvalidInput::MissingImage)?;
    let frame = Frame::decode(&image).map_err(InvalidInput::from)?;

    let assistant = state.assistant.as_deref().ok_or(ApiError::NotConfigured)?;

    let question = transcribe_upload(&state.audio, assistant, &audio)
        .await?
        .trim()
        .to_string();
    log::info!("[STT] {}", question);
    if question.is_empty() {
        return Err(ApiError::NoSpeech);
    }

    let answer = assistant.answer(&frame.data_url(), &question).await?;
    let tts_url = speak(state, &answer, AudioKind::VoiceAnswer).await;

    Ok(VoiceAskResponse {
        question,
        answer,
        tts_url,
        error: false,
    })
}

/// Stores the upload in the scratch area for the duration of the
/// transcription call.
async fn transcribe_upload(
    store: &AudioStore,
    assistant: &dyn Assistant,
    upload: &VoiceUpload,
) -> Result<String, ApiError> {
    let extension = upload
        .file_name
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str());
    let path = store.scratch_path(extension);

    tokio::fs::write(&path, &upload.bytes)
        .await
        .map_err(ApiError::Scratch)?;
    log::debug!("[STT] scratch audio at {}", path.display());

    let result = assistant.transcribe(&path).await;

    if let Err(e) = tokio::fs::remove_file(&path).await {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }

    result.map_err(ApiError::Transcription)
}

/// Synthesizes and stores speech, returning its URL. Failures only cost the
/// audio, never the response.
async fn speak(state: &AppState, text: &str, kind: AudioKind) -> Option<String> {
    let audio = match state.speech.synthesize(text).await {
        Ok(audio) => audio,
        Err(e) => {
            log::error!("Speech synthesis failed: {}", e);
            return None;
        }
    };

    match state.audio.save(kind, &audio).await {
        Ok(file_name) => Some(audio_url(&file_name)),
        Err(e) => {
            log::error!("Failed to store synthesized speech: {}", e);
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
