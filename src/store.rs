//! Storage of generated speech and temporary voice uploads.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// URL prefix under which stored audio is served.
pub const AUDIO_ROUTE: &str = "/tts";

const AUDIO_EXTENSION: &str = "mp3";

/// What a piece of stored audio was generated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioKind {
    Caption,
    Answer,
    VoiceAnswer,
}

impl AudioKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            AudioKind::Caption => "caption",
            AudioKind::Answer => "answer",
            AudioKind::VoiceAnswer => "voice_answer",
        }
    }
}

/// Directory of generated MP3 files plus a scratch area for uploads.
///
/// Every saved file gets a fresh name, so concurrent requests never share a
/// file.
pub struct AudioStore {
    dir: PathBuf,
    scratch_dir: PathBuf,
}

impl AudioStore {
    /// Creates the audio and scratch directories if they do not exist.
    pub async fn open(
        dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
    ) -> io::Result<Self> {
        let store = Self {
            dir: dir.into(),
            scratch_dir: scratch_dir.into(),
        };
        tokio::fs::create_dir_all(&store.dir).await?;
        tokio::fs::create_dir_all(&store.scratch_dir).await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `audio` under a new unique name and returns that name.
    pub async fn save(&self, kind: AudioKind, audio: &[u8]) -> io::Result<String> {
        let file_name = format!(
            "{}_{}.{}",
            kind.prefix(),
            Uuid::new_v4().simple(),
            AUDIO_EXTENSION
        );
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, audio).await?;
        log::info!("[TTS] saved {}", path.display());
        Ok(file_name)
    }

    /// Fresh scratch path for an upload; `extension` comes from the client's
    /// file name and is reduced to a safe alphanumeric form.
    pub fn scratch_path(&self, extension: Option<&str>) -> PathBuf {
        let extension = extension
            .filter(|ext| {
                !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .unwrap_or("webm");
        self.scratch_dir
            .join(format!("voice_{}.{}", Uuid::new_v4().simple(), extension))
    }

    /// Deletes stored audio and scratch files older than `max_age`.
    pub async fn sweep(&self, max_age: Duration) -> io::Result<usize> {
        let mut removed = sweep_dir(&self.dir, max_age, |path| {
            path.extension().is_some_and(|ext| ext == AUDIO_EXTENSION)
        })
        .await?;
        removed += sweep_dir(&self.scratch_dir, max_age, |_| true).await?;
        Ok(removed)
    }
}

/// Public URL of a stored audio file.
pub fn audio_url(file_name: &str) -> String {
    format!("{AUDIO_ROUTE}/{file_name}")
}

async fn sweep_dir(
    dir: &Path,
    max_age: Duration,
    wanted: impl Fn(&Path) -> bool,
) -> io::Result<usize> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if wanted(&path) {
            paths.push(path);
        }
    }
    Ok(remove_expired(&paths, max_age).await)
}

/// Removes the files in `paths` older than `max_age`. A file that cannot be
/// inspected or removed is skipped, the rest are still swept.
async fn remove_expired(paths: &[PathBuf], max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;

    for path in paths {
        match is_expired(path, now, max_age).await {
            Ok(false) => continue,
            Ok(true) => {}
            // a request cleaned up its own file while we were scanning
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::warn!("Failed to inspect {}: {}", path.display(), e);
                continue;
            }
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    removed
}

async fn is_expired(path: &Path, now: SystemTime, max_age: Duration) -> io::Result<bool> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if !metadata.is_file() {
        return Ok(false);
    }
    let age = now
        .duration_since(metadata.modified()?)
        .unwrap_or(Duration::ZERO);
    Ok(age >= max_age)
}

/// Periodically sweeps audio older than `ttl` for as long as the runtime lives.
pub fn spawn_sweeper(store: Arc<AudioStore>, ttl: Duration) -> JoinHandle<()> {
    let period = (ttl / 4).max(Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match store.sweep(ttl).await {
                Ok(0) => {}
                Ok(removed) => log::info!("Removed {} expired audio files", removed),
                Err(e) => log::warn!("Audio sweep failed: {}", e),
            }
        }
    })
}
