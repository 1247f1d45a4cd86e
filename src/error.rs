//! Request level errors and their mapping onto HTTP responses.
//!
//! Every endpoint shares one status convention; only the body shape differs
//! between the caption endpoint (`{error}`) and the question answering
//! endpoints (`{answer, error: true}`).

use crate::{
    EngineError,
    assistant::AssistError,
    frame::FrameError,
    messages::{AnswerFailure, ErrorResponse},
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Problems with what the caller sent.
#[derive(Debug, thiserror::Error)]
pub enum InvalidInput {
    #[error("image field not found")]
    MissingImage,
    #[error("question is empty")]
    EmptyQuestion,
    #[error("audio field not found")]
    MissingAudio,
    #[error("invalid image: {0}")]
    Image(#[from] FrameError),
    #[error("invalid request body: {0}")]
    Body(String),
}

impl InvalidInput {
    fn korean(&self) -> &'static str {
        match self {
            InvalidInput::MissingImage => "이미지가 전송되지 않았습니다.",
            InvalidInput::EmptyQuestion => "질문이 비어 있습니다.",
            InvalidInput::MissingAudio => "오디오가 전송되지 않았습니다.",
            InvalidInput::Image(_) => "이미지를 해석할 수 없습니다.",
            InvalidInput::Body(_) => "요청 형식이 올바르지 않습니다.",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),
    #[error("speech was not recognized")]
    NoSpeech,
    #[error("hosted assistant is not configured, set OPENAI_API_KEY")]
    NotConfigured,
    // upstream details stay in the server log
    #[error("hosted assistant call failed")]
    Upstream(#[from] AssistError),
    #[error("speech transcription failed")]
    Transcription(#[source] AssistError),
    #[error("failed to stage the voice upload: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("caption error: {0}")]
    Caption(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NoSpeech => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) | ApiError::Transcription(_) => StatusCode::BAD_GATEWAY,
            ApiError::Caption(_) | ApiError::Scratch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the same request could succeed if sent again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Upstream(e) | ApiError::Transcription(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Message for the listener, in Korean.
    pub fn korean_message(&self) -> String {
        match self {
            ApiError::InvalidInput(input) => input.korean().to_string(),
            ApiError::NoSpeech => "음성을 인식하지 못했습니다.".to_string(),
            ApiError::NotConfigured => "LLM API 키가 설정되지 않았습니다. \
                터미널에서 OPENAI_API_KEY 환경변수를 설정해 주세요."
                .to_string(),
            ApiError::Upstream(_) => "LLM 호출 중 오류가 발생했습니다.".to_string(),
            ApiError::Transcription(_) => "음성 인식 중 오류가 발생했습니다.".to_string(),
            ApiError::Caption(_) => "장면을 설명하는 중 오류가 발생했습니다.".to_string(),
            ApiError::Scratch(_) => "음성 파일을 처리하는 중 오류가 발생했습니다.".to_string(),
        }
    }

    fn log(&self) {
        match self {
            ApiError::Upstream(e) | ApiError::Transcription(e) => {
                log::error!("{}: {} (retryable: {})", self, e, e.is_retryable())
            }
            ApiError::Caption(_) | ApiError::Scratch(_) => log::error!("{}", self),
            _ => log::warn!("Rejected request: {}", self),
        }
    }

    /// `{error}` body used by the caption endpoint.
    pub fn into_caption_response(self) -> Response {
        self.log();
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }

    /// `{answer, error: true}` body used by the question answering endpoints.
    pub fn into_answer_response(self) -> Response {
        self.log();
        let body = AnswerFailure {
            answer: self.korean_message(),
            error: true,
        };
        (self.status(), Json(body)).into_response()
    }
}
