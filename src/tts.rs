//! Korean speech synthesis.

use async_trait::async_trait;
use reqwest::{StatusCode, header::USER_AGENT};
use std::time::Duration;

/// The public text-to-speech endpoint of Google Translate.
pub const GOOGLE_TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";

/// Longest chunk the endpoint accepts, in characters.
pub const MAX_CHUNK_CHARS: usize = 100;

const SENTENCE_BREAKS: &[char] = &['.', '!', '?', '。', '\n', ',', ';', ':'];

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("nothing to synthesize")]
    EmptyText,
    #[error("speech request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("speech service returned {0}")]
    Status(StatusCode),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns MP3 audio speaking `text`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError>;
}

/// Synthesizes speech through the Google Translate TTS endpoint.
pub struct GoogleTts {
    client: reqwest::Client,
    endpoint: String,
    language: String,
}

impl GoogleTts {
    pub fn new(language: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            endpoint: GOOGLE_TTS_ENDPOINT.to_string(),
            language: language.to_string(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for GoogleTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SpeechError> {
        let chunks = split_for_speech(text, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            return Err(SpeechError::EmptyText);
        }

        let total = chunks.len().to_string();
        let mut audio = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let idx = idx.to_string();
            let textlen = chunk.chars().count().to_string();
            let response = self
                .client
                .get(&self.endpoint)
                .header(USER_AGENT, "Mozilla/5.0")
                .query(&[
                    ("ie", "UTF-8"),
                    ("client", "tw-ob"),
                    ("tl", self.language.as_str()),
                    ("q", chunk.as_str()),
                    ("total", total.as_str()),
                    ("idx", idx.as_str()),
                    ("textlen", textlen.as_str()),
                ])
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(SpeechError::Status(status));
            }
            // MP3 frames are self-delimiting, so chunks concatenate cleanly
            audio.extend_from_slice(&response.bytes().await?);
        }

        log::debug!("Synthesized {} bytes of speech in {} chunks", audio.len(), total);
        Ok(audio)
    }
}

/// Splits `text` into chunks of at most `max_chars` characters.
///
/// Cuts prefer sentence punctuation, then whitespace, and fall back to a hard
/// cut inside long words.
pub fn split_for_speech(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest.to_string());
            break;
        };

        let window = &rest[..limit];
        let cut = window
            .char_indices()
            .filter(|(_, c)| SENTENCE_BREAKS.contains(c))
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .or_else(|| window.rfind(char::is_whitespace))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        let (head, tail) = rest.split_at(cut);
        let head = head.trim();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = tail.trim_start();
    }

    chunks
}
