use scene_voice::{
    CaptionEngine,
    assistant::{Assistant, OpenAiAssistant},
    config::{Config, SPEECH_LANGUAGE, ServerArgs, api_key_from_env},
    model::BlipCaptioner,
    server::{self, AppState},
    store::{self, AudioStore},
    tts::GoogleTts,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();
    env_logger::init();
    let args: ServerArgs = argh::from_env();

    let config = Config::new(args, api_key_from_env());

    log::info!("Loading caption model from {}", config.model_dir.display());
    let model = BlipCaptioner::load(&config.model_dir, Some(&config.adapter_dir))?;
    let engine = Arc::new(CaptionEngine::new(model));

    let assistant: Option<Arc<dyn Assistant>> = match config.openai.clone() {
        Some(openai) => Some(Arc::new(OpenAiAssistant::new(openai)?)),
        None => {
            log::warn!(
                "OPENAI_API_KEY is not set: captions are returned unrewritten \
                 and questions are refused"
            );
            None
        }
    };

    let speech = Arc::new(GoogleTts::new(SPEECH_LANGUAGE, config.request_timeout)?);

    let audio = Arc::new(AudioStore::open(&config.audio_dir, &config.scratch_dir).await?);
    match audio.sweep(config.audio_ttl).await {
        Ok(removed) if removed > 0 => log::info!("Removed {} stale audio files", removed),
        Ok(_) => {}
        Err(e) => log::warn!("Initial audio sweep failed: {}", e),
    }
    store::spawn_sweeper(audio.clone(), config.audio_ttl);

    let app = server::router(Arc::new(AppState {
        engine,
        assistant,
        speech,
        audio,
    }));

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", config.addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
