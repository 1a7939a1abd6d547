//! File-system mailbox shared with the Lua bridge running inside darktable.
//!
//! The host polls `cmd.json`, executes it and answers in `response.json`.
//! Every write lands through a `.tmp` sibling and an atomic rename, so a
//! reader sees either the previous document or the complete new one.

pub mod status;

use std::fs::{self, File};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BridgeConfig;

pub const CMD_FILE_NAME: &str = "cmd.json";
pub const RESPONSE_FILE_NAME: &str = "response.json";
pub const STATUS_FILE_NAME: &str = "gui_status.json";
pub const UPLOAD_QUEUE_PATTERN: &str = "upload_*.json";
pub const TOOL_QUEUE_PATTERN: &str = "gui_request_*.json";
pub const DEAD_LETTER_DIR_NAME: &str = "dead_letter";
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxLayout {
    dir: PathBuf,
}

impl MailboxLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    pub fn cmd_path(&self) -> PathBuf {
        self.dir.join(CMD_FILE_NAME)
    }

    pub fn response_path(&self) -> PathBuf {
        self.dir.join(RESPONSE_FILE_NAME)
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE_NAME)
    }

    pub fn dead_letter_dir(&self) -> PathBuf {
        self.dir.join(DEAD_LETTER_DIR_NAME)
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(self.dir.as_path())
    }
}

/// `{cmd, args}` as written to `cmd.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Command {
    pub fn new(cmd: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            cmd: cmd.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            data,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

impl From<ResponseFailure> for Response {
    fn from(failure: ResponseFailure) -> Self {
        Response::error(failure.to_string())
    }
}

/// Why an exchange produced no usable response. Distinct from a well-formed
/// response whose `status` is `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseFailure {
    #[error("timeout")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("mailbox io error: {0}")]
    Io(String),
    #[error("failed to encode command: {0}")]
    Encode(String),
}

impl From<io::Error> for ResponseFailure {
    fn from(err: io::Error) -> Self {
        ResponseFailure::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxTiming {
    pub poll_interval: Duration,
    pub response_timeout: Duration,
}

impl Default for MailboxTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Single-flight command channel. One instance per process; every caller
/// (tool calls and the queue monitor alike) shares it through an `Arc`.
#[derive(Debug)]
pub struct MailboxChannel {
    layout: MailboxLayout,
    timing: MailboxTiming,
    in_flight: Mutex<()>,
}

impl MailboxChannel {
    pub fn new(layout: MailboxLayout, timing: MailboxTiming) -> Self {
        Self {
            layout,
            timing,
            in_flight: Mutex::new(()),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            MailboxLayout::new(config.mcp_dir()),
            MailboxTiming {
                poll_interval: config.poll_interval,
                response_timeout: config.response_timeout,
            },
        )
    }

    pub fn layout(&self) -> &MailboxLayout {
        &self.layout
    }

    pub fn timing(&self) -> MailboxTiming {
        self.timing
    }

    /// Blocking call; failures come back as an `error` response.
    pub fn send(&self, name: &str, args: Map<String, Value>) -> Response {
        self.exchange(&Command::new(name, args))
            .unwrap_or_else(Response::from)
    }

    /// Runs one complete write-poll-read exchange while holding the channel
    /// lock. The guard is dropped on every return path, including unwinding.
    pub fn exchange(&self, command: &Command) -> Result<Response, ResponseFailure> {
        let _guard = self.acquire();
        self.layout.ensure_dir()?;

        let response_path = self.layout.response_path();
        remove_if_exists(response_path.as_path())?;

        let payload =
            serde_json::to_vec(command).map_err(|e| ResponseFailure::Encode(e.to_string()))?;
        let cmd_path = self.layout.cmd_path();
        write_atomic(cmd_path.as_path(), payload.as_slice())?;
        debug!(cmd = %command.cmd, "mailbox command written");

        let outcome = self.await_response(response_path.as_path());
        if matches!(outcome, Err(ResponseFailure::Timeout)) {
            warn!(
                cmd = %command.cmd,
                timeout_ms = self.timing.response_timeout.as_millis() as u64,
                "host did not answer mailbox command"
            );
            // The caller has given up; the host must not pick it up later.
            if let Err(err) = remove_if_exists(cmd_path.as_path()) {
                warn!(error = %err, "failed to withdraw unanswered command");
            }
        }
        outcome
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a panic in a previous holder leaves
        // nothing inconsistent behind.
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn await_response(&self, response_path: &Path) -> Result<Response, ResponseFailure> {
        let deadline = Instant::now() + self.timing.response_timeout;
        loop {
            if let Some(raw) = read_non_empty(response_path)? {
                remove_if_exists(response_path)?;
                return parse_response(raw.as_slice());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ResponseFailure::Timeout);
            }
            thread::sleep(self.timing.poll_interval.min(deadline - now));
        }
    }
}

pub fn parse_response(raw: &[u8]) -> Result<Response, ResponseFailure> {
    serde_json::from_slice::<Response>(raw).map_err(|e| ResponseFailure::Malformed(e.to_string()))
}

/// Appends `.tmp` to the file name: `cmd.json` -> `cmd.json.tmp`.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path_for(path);
    let written = File::create(tmp.as_path()).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_data()
    });
    if let Err(err) = written.and_then(|_| fs::rename(tmp.as_path(), path)) {
        let _ = fs::remove_file(tmp.as_path());
        return Err(err);
    }
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// `None` while the file is absent or still empty (the writer may be between
/// truncate and rename).
fn read_non_empty(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
