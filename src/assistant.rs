//! Hosted language services: caption rewriting, visual question answering and
//! speech transcription through an OpenAI compatible API.

use async_trait::async_trait;
use reqwest::{StatusCode, multipart};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;
use std::{
    path::Path,
    time::{Duration, Instant},
};

/// Instruction for turning a raw English caption into spoken Korean.
pub const REWRITE_INSTRUCTION: &str = "너는 시각장애인을 위한 화면 설명 도우미야. \
    입력된 문장을 바탕으로, 자연스러운 한국어 한두 문장으로 존댓말로 설명해줘. \
    군더더기 없이 핵심만 말해.";

/// Instruction for answering a question about the attached image.
pub const ANSWER_INSTRUCTION: &str = "너는 시각장애인을 위한 장면 설명 도우미야. \
    아래 이미지를 보고, 사용자의 질문에 대해 한국어로 1~2문장 정도로 짧고 분명하게 대답해 줘.";

const CHAT_ENDPOINT: &str = "chat/completions";
const TRANSCRIPTION_ENDPOINT: &str = "audio/transcriptions";

#[derive(Debug, thiserror::Error)]
pub enum AssistError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("{endpoint} returned an unreadable body: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned no content")]
    EmptyResponse { endpoint: &'static str },
    #[error("failed to read the recorded audio: {0}")]
    Audio(#[from] std::io::Error),
}

impl AssistError {
    /// Whether trying the same call again later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AssistError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            AssistError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            AssistError::Decode { .. } | AssistError::EmptyResponse { .. } => true,
            AssistError::Audio(_) => false,
        }
    }
}

/// The hosted capabilities the request handlers depend on.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Rewrites a raw caption as one or two polite Korean sentences.
    async fn rewrite_caption(&self, caption: &str) -> Result<String, AssistError>;

    /// Answers `question` about the image behind `image_url` (a `data:` URL).
    async fn answer(&self, image_url: &str, question: &str) -> Result<String, AssistError>;

    /// Transcribes the recording stored at `audio`.
    async fn transcribe(&self, audio: &Path) -> Result<String, AssistError>;
}

/// Connection settings for an OpenAI compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub transcription_model: String,
    /// Spoken language passed to the transcription endpoint.
    pub language: String,
    pub timeout: Duration,
}

pub struct OpenAiAssistant {
    config: OpenAiConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: String,
}

impl OpenAiAssistant {
    pub fn new(config: OpenAiConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    async fn chat(&self, messages: serde_json::Value) -> Result<String, AssistError> {
        let request = json!({
            "model": self.config.chat_model,
            "messages": messages,
        });

        log::info!(
            "Chat completion request: endpoint={}, model={}",
            self.config.base_url,
            self.config.chat_model
        );
        let start_time = Instant::now();

        let response = self
            .client
            .post(self.url(CHAT_ENDPOINT))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| AssistError::Transport {
                endpoint: CHAT_ENDPOINT,
                source,
            })?;

        let completion: ChatCompletion = read_json(CHAT_ENDPOINT, response).await?;
        log::info!("Chat completion finished in {:.2}s", start_time.elapsed().as_secs_f64());

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(AssistError::EmptyResponse {
                endpoint: CHAT_ENDPOINT,
            })
    }
}

#[async_trait]
impl Assistant for OpenAiAssistant {
    async fn rewrite_caption(&self, caption: &str) -> Result<String, AssistError> {
        let text = self
            .chat(json!([
                { "role": "system", "content": REWRITE_INSTRUCTION },
                { "role": "user", "content": format!("다음 캡션을 한국어로 정리해줘: {caption}") },
            ]))
            .await?;
        log::info!("[Korean caption] {}", text);
        Ok(text)
    }

    async fn answer(&self, image_url: &str, question: &str) -> Result<String, AssistError> {
        let text = self
            .chat(json!([{
                "role": "user",
                "content": [
                    { "type": "text", "text": format!("{ANSWER_INSTRUCTION}\n\n질문: {question}") },
                    { "type": "image_url", "image_url": { "url": image_url } },
                ],
            }]))
            .await?;
        log::info!("[Answer] {}", text);
        Ok(text)
    }

    async fn transcribe(&self, audio: &Path) -> Result<String, AssistError> {
        let bytes = tokio::fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("voice.webm")
            .to_string();

        let form = multipart::Form::new()
            .text("model", self.config.transcription_model.clone())
            .text("language", self.config.language.clone())
            .part("file", multipart::Part::bytes(bytes).file_name(file_name));

        let response = self
            .client
            .post(self.url(TRANSCRIPTION_ENDPOINT))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|source| AssistError::Transport {
                endpoint: TRANSCRIPTION_ENDPOINT,
                source,
            })?;

        let transcription: Transcription = read_json(TRANSCRIPTION_ENDPOINT, response).await?;
        log::info!("[STT] {}", transcription.text);
        Ok(transcription.text.trim().to_string())
    }
}

async fn read_json<T: DeserializeOwned>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T, AssistError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        log::warn!("{} error: status={}, body={}", endpoint, status, body);
        return Err(AssistError::Status {
            endpoint,
            status,
            body,
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|source| AssistError::Decode { endpoint, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(base_url: &str) -> OpenAiAssistant {
        OpenAiAssistant::new(OpenAiConfig {
            base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            transcription_model: "whisper-1".to_string(),
            language: "ko".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_url_joining() {
        assert_eq!(
            assistant("https://api.openai.com/v1/").url(CHAT_ENDPOINT),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            assistant("http://localhost:11434/v1").url(TRANSCRIPTION_ENDPOINT),
            "http://localhost:11434/v1/audio/transcriptions"
        );
    }

    #[test]
    fn test_status_retryability() {
        let status = |status| AssistError::Status {
            endpoint: CHAT_ENDPOINT,
            status,
            body: String::new(),
        };
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!status(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(!AssistError::Audio(std::io::ErrorKind::NotFound.into()).is_retryable());
    }

    #[test]
    fn test_completion_parsing() {
        let raw = r#"{
            "id": "x",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "  빨간 사과가 있습니다. "}
            }]
        }"#;
        let completion: ChatCompletion = serde_json::from_str(raw).unwrap();
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("  빨간 사과가 있습니다. ")
        );
    }

    #[tokio::test]
    async fn test_missing_audio_file() {
        let err = assistant("http://127.0.0.1:9")
            .transcribe(Path::new("/definitely/not/here.webm"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::Audio(_)));
    }
}
