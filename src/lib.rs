use image::DynamicImage;
use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

pub mod assistant;
pub mod beam;
pub mod config;
pub mod error;
pub mod frame;
pub mod lora;
pub mod messages;
pub mod model;
pub mod server;
pub mod store;
pub mod tts;

/// Trait for image captioning models that can be driven by the [`CaptionEngine`].
///
/// The model is moved onto the engine's worker thread, so implementations are
/// free to keep mutable inference state (KV caches, scratch buffers) without
/// any locking.
pub trait CaptionModel {
    /// The error type that can be returned during inference.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Produces a short caption for the given image.
    fn caption(&mut self, image: &DynamicImage) -> Result<String, Self::Error>;
}

/// Represents the current state of the caption engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// The engine is waiting for work.
    Idle,
    /// The engine is currently running a caption job.
    Processing,
}

impl EngineState {
    /// Returns the state as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Processing => "processing",
        }
    }
}

/// Errors surfaced to callers of [`CaptionEngine::caption`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The worker thread is gone, either stopped or crashed.
    #[error("caption engine is not running")]
    Stopped,
    /// The model failed on this particular job.
    #[error("{0}")]
    Model(String),
    /// The model finished but produced no text.
    #[error("model produced an empty caption")]
    EmptyCaption,
}

/// A finished caption job together with its telemetry.
#[derive(Debug, Clone)]
pub struct Captioned {
    /// Identifier assigned when the job was submitted.
    pub id: u64,
    /// Time spent inside the model.
    pub duration: Duration,
    /// The caption text produced by the model.
    pub caption: String,
}

struct CaptionJob {
    id: u64,
    image: DynamicImage,
    reply: oneshot::Sender<Result<Captioned, EngineError>>,
}

/// Owns a [`CaptionModel`] on a dedicated thread and serves caption jobs to
/// async callers.
///
/// Jobs are processed one at a time in submission order. A model error only
/// fails the job that triggered it; the worker keeps serving later jobs.
pub struct CaptionEngine {
    state: Arc<Mutex<EngineState>>,
    job_tx: Option<mpsc::Sender<CaptionJob>>,
    worker: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl CaptionEngine {
    /// Creates a new engine and moves the model onto its worker thread.
    pub fn new<M>(mut model: M) -> Self
    where
        M: CaptionModel + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel::<CaptionJob>();
        let state = Arc::new(Mutex::new(EngineState::Idle));

        let worker = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(job) = job_rx.recv() {
                    log::debug!("Running caption job #{}", job.id);

                    *lock(&state) = EngineState::Processing;
                    let start_time = Instant::now();

                    let result = match model.caption(&job.image) {
                        Ok(caption) if caption.trim().is_empty() => Err(EngineError::EmptyCaption),
                        Ok(caption) => Ok(Captioned {
                            id: job.id,
                            duration: start_time.elapsed(),
                            caption: caption.trim().to_string(),
                        }),
                        Err(e) => Err(EngineError::Model(e.to_string())),
                    };

                    *lock(&state) = EngineState::Idle;

                    match &result {
                        Ok(done) => {
                            log::debug!("Caption job #{} took {:?}", done.id, done.duration)
                        }
                        Err(e) => log::error!("Caption job #{} failed: {}", job.id, e),
                    }

                    if job.reply.send(result).is_err() {
                        log::warn!("Caller of caption job #{} went away", job.id);
                    }
                }
                log::debug!("Caption engine worker exiting");
            }
        });

        Self {
            state,
            job_tx: Some(job_tx),
            worker: Some(worker),
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns the current state of the engine.
    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    /// Submits an image and waits for its caption.
    pub async fn caption(&self, image: DynamicImage) -> Result<Captioned, EngineError> {
        let tx = self.job_tx.as_ref().ok_or(EngineError::Stopped)?;
        let (reply, reply_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        tx.send(CaptionJob { id, image, reply })
            .map_err(|_| EngineError::Stopped)?;

        reply_rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Stops the engine and waits for the worker to finish queued jobs.
    pub fn stop(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptionEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
