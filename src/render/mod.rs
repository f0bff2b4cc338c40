//! Markup renderer port
//!
//! Rendering markup to a preview bitmap is an external concern; the task
//! handlers only see this trait. The recording implementation backs
//! handler tests and can be scripted to fail.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `markup` to a bitmap at `dest`.
    async fn render(&self, markup: &str, dest: &Path) -> Result<(), RenderError>;
}

/// Stand-in used until a real renderer is wired in: acknowledges every
/// call without producing output, so preview tasks succeed and never
/// block the queue.
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn render(&self, _markup: &str, dest: &Path) -> Result<(), RenderError> {
        tracing::debug!(dest = %dest.display(), "no renderer configured, skipping preview");
        Ok(())
    }
}

/// Records render calls; fails the first `fail_times` invocations.
#[derive(Default)]
pub struct RecordingRenderer {
    calls: Mutex<Vec<(String, PathBuf)>>,
    fail_times: std::sync::atomic::AtomicU32,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: u32) -> Self {
        let renderer = Self::default();
        renderer
            .fail_times
            .store(times, std::sync::atomic::Ordering::SeqCst);
        renderer
    }

    pub async fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn render(&self, markup: &str, dest: &Path) -> Result<(), RenderError> {
        let remaining = self.fail_times.load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times
                .store(remaining - 1, std::sync::atomic::Ordering::SeqCst);
            return Err(RenderError::Failed("scripted failure".into()));
        }
        self.calls
            .lock()
            .await
            .push((markup.to_string(), dest.to_path_buf()));
        tokio::fs::write(dest, b"\x89PNG\r\n\x1a\n").await?;
        Ok(())
    }
}
