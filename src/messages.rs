use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaptionRequest {
    /// Base64 image, optionally wrapped in a `data:` URL.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptionResponse {
    pub raw_caption: String,
    pub korean_caption: String,
    pub tts_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AskRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub error: bool,
    pub tts_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceAskResponse {
    pub question: String,
    pub answer: String,
    pub tts_url: Option<String>,
    pub error: bool,
}

/// Failure body of the question answering endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnswerFailure {
    pub answer: String,
    pub error: bool,
}

/// Failure body of the caption endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusResponse {
    /// Engine state: `idle` or `processing`.
    pub status: String,
    /// Whether hosted rewriting, answering and transcription are available.
    pub assistant_configured: bool,
    pub version: String,
}
