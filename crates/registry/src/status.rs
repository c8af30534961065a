use chrono::Utc;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use steward_core::{AssetEvent, ProgressReporter, RuntimeState, RuntimeStatus, StewardError};

/// Owner of a handle's status record. Every critical section is a plain
/// field update, so nothing here is ever held across an `.await`.
pub(crate) struct StatusCell {
    inner: RwLock<RuntimeStatus>,
}

impl StatusCell {
    pub fn new(status: RuntimeStatus) -> Self {
        Self {
            inner: RwLock::new(status),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RuntimeStatus> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RuntimeStatus> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> RuntimeStatus {
        self.read().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut RuntimeStatus)) {
        let mut status = self.write();
        f(&mut status);
        status.updated_at = Utc::now();
    }

    /// Enter a working state. Starting a new operation clears the previous
    /// error and resets the progress bar.
    pub fn begin(&self, state: RuntimeState, message: impl Into<String>, progress: f32) {
        let message = message.into();
        self.update(|s| {
            s.state = state;
            s.progress = progress;
            s.status_message = message;
            s.last_error = None;
        });
    }

    /// Move progress forward; lower values are ignored.
    pub fn advance(&self, progress: f32, message: Option<String>) {
        self.update(|s| {
            let next = progress.clamp(0.0, 100.0);
            if next > s.progress {
                s.progress = next;
            }
            if let Some(message) = message {
                s.status_message = message;
            }
        });
    }

    pub fn fail(&self, err: &StewardError) {
        let message = err.message().to_string();
        self.update(|s| {
            s.state = RuntimeState::Error;
            s.status_message = err.to_string();
            s.last_error = Some(message);
        });
    }
}

/// Slice of the overall progress bar that one phase of an operation owns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ProgressSpan {
    pub start: f32,
    pub end: f32,
}

impl ProgressSpan {
    pub const FULL: ProgressSpan = ProgressSpan {
        start: 0.0,
        end: 100.0,
    };

    /// Download phase of a load that has to fetch artifacts first.
    pub const LOAD_DOWNLOAD: ProgressSpan = ProgressSpan {
        start: 0.0,
        end: 80.0,
    };

    /// Initialization after an inline download.
    pub const LOAD_INIT_START: f32 = 85.0;

    pub fn map(&self, done: u64, total: u64) -> Option<f32> {
        if total == 0 {
            return None;
        }
        let fraction = (done as f64 / total as f64).clamp(0.0, 1.0) as f32;
        Some(self.start + (self.end - self.start) * fraction)
    }
}

/// Reporter that folds asset events into `cell` within `span`.
pub(crate) fn progress_into(
    cell: std::sync::Arc<StatusCell>,
    span: ProgressSpan,
) -> ProgressReporter {
    ProgressReporter::new(move |event| match event {
        AssetEvent::Started(name) => cell.advance(0.0, Some(format!("Downloading {}", name))),
        AssetEvent::Progress(done, total) => {
            if let Some(progress) = span.map(done, total) {
                cell.advance(progress, None);
            }
        }
        AssetEvent::Complete(name) => log::debug!("{} complete", name),
    })
}
