use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{write_atomic, MailboxLayout};

/// Latest progress/error state shown by the host-side MCP view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
    pub error: bool,
    pub timestamp: f64,
}

impl StatusMessage {
    pub fn now(message: impl Into<String>, error: bool) -> Self {
        Self {
            message: message.into(),
            error,
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        }
    }
}

/// One-way notification interface. Implementations must not block on a
/// reader and must not surface failures to the caller.
pub trait StatusSink: Send + Sync + 'static {
    fn publish(&self, message: &str, is_error: bool);
}

pub type SharedStatusSink = Arc<dyn StatusSink>;

#[derive(Debug)]
pub struct StatusChannel {
    path: PathBuf,
    // Publishers share one staging file; serialize them so a rename never
    // moves another writer's half-written document into place.
    write_lock: Mutex<()>,
}

impl StatusChannel {
    pub fn new(layout: &MailboxLayout) -> Self {
        Self {
            path: layout.status_path(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn read_latest(&self) -> Option<StatusMessage> {
        read_status_file(self.path.as_path())
    }

    fn try_publish(&self, status: &StatusMessage) -> std::io::Result<()> {
        let payload = serde_json::to_vec(status)?;
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(self.path.as_path(), payload.as_slice())
    }
}

impl StatusSink for StatusChannel {
    fn publish(&self, message: &str, is_error: bool) {
        let status = StatusMessage::now(message, is_error);
        match self.try_publish(&status) {
            Ok(()) => debug!(error = is_error, status = message, "status published"),
            Err(err) => warn!(error = %err, path = %self.path.display(), "failed to publish status"),
        }
    }
}

pub fn read_status_file(path: &Path) -> Option<StatusMessage> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(raw.as_slice()).ok()
}
