use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::BridgeConfig;
use crate::runner::{find_program, CommandRunner, CommandSpec, RunnerError, StdCommandRunner};

/// Body of an `upload_*.json` drop file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub source_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_remote: Option<String>,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("File not found: {0}")]
    SourceMissing(PathBuf),
    #[error("Rclone error: {0}")]
    Rclone(String),
    #[error("Execution error: {0}")]
    Execution(#[from] RunnerError),
}

pub trait Uploader: Send + Sync + 'static {
    /// Returns a human-readable success message.
    fn upload(&self, source: &Path, remote: &str) -> Result<String, UploadError>;
}

pub type SharedUploader = Arc<dyn Uploader>;

/// `rclone copy <file> <remote>` when rclone is installed, otherwise a
/// simulated upload so the GUI flow stays usable on machines without it.
#[derive(Debug, Clone)]
pub struct RcloneUploader<R> {
    runner: R,
    binary: String,
    mock_delay: Duration,
}

impl RcloneUploader<StdCommandRunner> {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            StdCommandRunner,
            config.rclone_binary.clone(),
            config.mock_upload_delay,
        )
    }
}

impl<R> RcloneUploader<R>
where
    R: CommandRunner,
{
    pub fn new(runner: R, binary: impl Into<String>, mock_delay: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            mock_delay,
        }
    }

    pub fn rclone_available(&self) -> bool {
        find_program(self.binary.as_str()).is_some()
    }
}

impl<R> Uploader for RcloneUploader<R>
where
    R: CommandRunner,
{
    fn upload(&self, source: &Path, remote: &str) -> Result<String, UploadError> {
        if !source.exists() {
            return Err(UploadError::SourceMissing(source.to_path_buf()));
        }
        let display = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| source.display().to_string());

        if !self.rclone_available() {
            info!(source = %source.display(), "rclone not found, simulating upload");
            thread::sleep(self.mock_delay);
            return Ok(format!("[MOCK] Uploaded {display} (Rclone not found)"));
        }

        let spec = CommandSpec::new(
            self.binary.clone(),
            vec![
                String::from("copy"),
                source.to_string_lossy().to_string(),
                remote.to_string(),
            ],
        );
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(UploadError::Rclone(output.stderr.trim().to_string()));
        }
        Ok(format!("Successfully uploaded {display} to {remote}"))
    }
}
