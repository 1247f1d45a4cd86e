use crate::assistant::OpenAiConfig;
use argh::FromArgs;
use std::{path::PathBuf, time::Duration};

// defaults for the server
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MODEL_DIR: &str = "blip_lora_ko";
pub const DEFAULT_AUDIO_DIR: &str = "static/tts";
pub const DEFAULT_AUDIO_TTL_SECS: u64 = 3600;
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_STT_MODEL: &str = "whisper-1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Environment variable holding the hosted API credential.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Spoken language for transcription and speech synthesis.
pub const SPEECH_LANGUAGE: &str = "ko";

#[derive(FromArgs, Debug)]
/// scene-voice describes camera frames in spoken Korean.
pub struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    pub host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    pub port: u16,

    /// directory with model.safetensors and tokenizer.json of BLIP base
    #[argh(option, default = "PathBuf::from(DEFAULT_MODEL_DIR)")]
    pub model_dir: PathBuf,

    /// the LoRA adapter directory (default: <model-dir>/adapter)
    #[argh(option)]
    pub adapter_dir: Option<PathBuf>,

    /// directory where synthesized speech is stored and served from
    #[argh(option, default = "PathBuf::from(DEFAULT_AUDIO_DIR)")]
    pub audio_dir: PathBuf,

    /// seconds a synthesized audio file is kept before it is swept
    #[argh(option, default = "DEFAULT_AUDIO_TTL_SECS")]
    pub audio_ttl_secs: u64,

    /// root of the OpenAI compatible API
    #[argh(option, default = "DEFAULT_OPENAI_BASE_URL.to_string()")]
    pub openai_base_url: String,

    /// chat model used for rewriting and question answering
    #[argh(option, default = "DEFAULT_CHAT_MODEL.to_string()")]
    pub chat_model: String,

    /// speech-to-text model
    #[argh(option, default = "DEFAULT_STT_MODEL.to_string()")]
    pub stt_model: String,

    /// timeout in seconds for every outbound HTTP request
    #[argh(option, default = "DEFAULT_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: u64,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub model_dir: PathBuf,
    pub adapter_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub audio_ttl: Duration,
    pub request_timeout: Duration,
    /// `None` when no credential is configured.
    pub openai: Option<OpenAiConfig>,
}

impl Config {
    pub fn new(args: ServerArgs, api_key: Option<String>) -> Self {
        let request_timeout = Duration::from_secs(args.request_timeout_secs);
        let adapter_dir = args
            .adapter_dir
            .unwrap_or_else(|| args.model_dir.join("adapter"));

        let openai = api_key.map(|api_key| OpenAiConfig {
            base_url: args.openai_base_url,
            api_key,
            chat_model: args.chat_model,
            transcription_model: args.stt_model,
            language: SPEECH_LANGUAGE.to_string(),
            timeout: request_timeout,
        });

        Self {
            addr: format!("{}:{}", args.host, args.port),
            model_dir: args.model_dir,
            adapter_dir,
            audio_dir: args.audio_dir,
            scratch_dir: std::env::temp_dir().join("scene-voice"),
            audio_ttl: Duration::from_secs(args.audio_ttl_secs),
            request_timeout,
            openai,
        }
    }
}

/// Reads the credential from the environment; blank values count as unset.
pub fn api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerArgs {
        ServerArgs::from_args(&["scene-voice"], args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::new(parse(&[]), None);
        assert_eq!(config.addr, "0.0.0.0:5000");
        assert_eq!(config.model_dir, PathBuf::from("blip_lora_ko"));
        assert_eq!(config.adapter_dir, PathBuf::from("blip_lora_ko/adapter"));
        assert_eq!(config.audio_dir, PathBuf::from("static/tts"));
        assert_eq!(config.audio_ttl, Duration::from_secs(3600));
        assert!(config.openai.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = parse(&[
            "-p",
            "8080",
            "--model-dir",
            "/models/blip",
            "--adapter-dir",
            "/models/lora",
            "--request-timeout-secs",
            "5",
        ]);
        let config = Config::new(args, Some("sk-test".to_string()));
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.adapter_dir, PathBuf::from("/models/lora"));

        let openai = config.openai.unwrap();
        assert_eq!(openai.api_key, "sk-test");
        assert_eq!(openai.chat_model, "gpt-4o-mini");
        assert_eq!(openai.transcription_model, "whisper-1");
        assert_eq!(openai.language, "ko");
        assert_eq!(openai.timeout, Duration::from_secs(5));
    }
}
