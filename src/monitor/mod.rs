//! Drop-box queues polled next to the command mailbox.
//!
//! External producers (the Lua GUI, scripts) drop `upload_*.json` and
//! `gui_request_*.json` files into the mailbox directory. Each cycle drains
//! uploads first, then tool requests. Every discovered file leaves the queue
//! in the cycle that found it: deleted, or moved to `dead_letter/` when it
//! could not be handled at all.

use std::fs;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::mailbox::status::SharedStatusSink;
use crate::mailbox::{
    remove_if_exists, write_atomic, MailboxLayout, TMP_SUFFIX, TOOL_QUEUE_PATTERN,
    UPLOAD_QUEUE_PATTERN,
};
use crate::tools::{panic_message, Dispatcher, ToolError};
use crate::upload::UploadRequest;

const STOP_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Body of a `gui_request_*.json` drop file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to list queue directory '{dir}': {source}")]
    List {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid queue pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub backoff: Duration,
    pub preview_chars: usize,
    pub dead_letter: bool,
}

impl MonitorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            interval: config.monitor_interval,
            backoff: config.monitor_backoff,
            preview_chars: config.status_preview_chars,
            dead_letter: config.dead_letter,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            backoff: Duration::from_secs(5),
            preview_chars: 200,
            dead_letter: true,
        }
    }
}

/// What one cycle did with the files it found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub uploads: usize,
    pub tool_requests: usize,
    pub dead_lettered: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.uploads == 0 && self.tool_requests == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Remove,
    DeadLetter(String),
}

pub struct QueueMonitor {
    layout: MailboxLayout,
    dispatcher: Arc<Dispatcher>,
    status: SharedStatusSink,
    settings: MonitorSettings,
}

impl QueueMonitor {
    pub fn new(
        layout: MailboxLayout,
        dispatcher: Arc<Dispatcher>,
        status: SharedStatusSink,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            layout,
            dispatcher,
            status,
            settings,
        }
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    /// Polls until `stop` is raised. Neither an error nor a panic in a cycle
    /// ends the loop; both are logged and followed by the backoff sleep.
    pub fn run(&self, stop: &AtomicBool) {
        info!(
            dir = %self.layout.dir().display(),
            interval_ms = self.settings.interval.as_millis() as u64,
            "queue monitor started"
        );
        while !stop.load(Ordering::SeqCst) {
            let pause = match catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
                Ok(Ok(report)) => {
                    if !report.is_idle() {
                        debug!(
                            uploads = report.uploads,
                            tool_requests = report.tool_requests,
                            dead_lettered = report.dead_lettered,
                            "queue cycle finished"
                        );
                    }
                    self.settings.interval
                }
                Ok(Err(err)) => {
                    error!(error = %err, "queue cycle failed");
                    self.settings.backoff
                }
                Err(payload) => {
                    error!(panic = %panic_message(payload.as_ref()), "queue cycle panicked");
                    self.settings.backoff
                }
            };
            sleep_unless_stopped(pause, stop);
        }
        info!("queue monitor stopped");
    }

    pub fn run_cycle(&self) -> Result<CycleReport, MonitorError> {
        let mut report = CycleReport::default();

        for path in self.discover(UPLOAD_QUEUE_PATTERN)? {
            let disposition = self.guarded(path.as_path(), |p| self.process_upload(p));
            report.uploads += 1;
            if self.finish(path.as_path(), disposition) {
                report.dead_lettered += 1;
            }
        }

        for path in self.discover(TOOL_QUEUE_PATTERN)? {
            let disposition = self.guarded(path.as_path(), |p| self.process_tool_request(p));
            report.tool_requests += 1;
            if self.finish(path.as_path(), disposition) {
                report.dead_lettered += 1;
            }
        }

        Ok(report)
    }

    /// Queue files in the mailbox directory, oldest first. Ties on
    /// modification time fall back to the file name.
    fn discover(&self, pattern: &str) -> Result<Vec<PathBuf>, MonitorError> {
        let pattern = Pattern::new(pattern)?;
        let dir = self.layout.dir();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(MonitorError::List {
                    dir: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut found = Vec::<(SystemTime, String, PathBuf)>::new();
        for entry in entries {
            let entry = entry.map_err(|source| MonitorError::List {
                dir: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) || !pattern.matches(name.as_str()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, name, entry.path()));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(found.into_iter().map(|(_, _, path)| path).collect())
    }

    fn guarded<F>(&self, path: &Path, work: F) -> Disposition
    where
        F: FnOnce(&Path) -> Disposition,
    {
        match catch_unwind(AssertUnwindSafe(|| work(path))) {
            Ok(disposition) => disposition,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(file = %path.display(), panic = %message, "queue file handling panicked");
                self.status.publish(
                    format!("Internal error while processing {}: {message}", file_label(path))
                        .as_str(),
                    true,
                );
                Disposition::DeadLetter(format!("panicked: {message}"))
            }
        }
    }

    fn process_upload(&self, path: &Path) -> Disposition {
        let request = match read_request::<UploadRequest>(path) {
            Ok(request) => request,
            Err(reason) => {
                warn!(file = %path.display(), reason = %reason, "rejecting upload request");
                self.status
                    .publish(format!("Invalid upload request: {reason}").as_str(), true);
                return Disposition::DeadLetter(reason);
            }
        };

        let source = request.source_file.as_path();
        if !source.exists() {
            self.status.publish(
                format!("File not found: {}", source.display()).as_str(),
                true,
            );
            return Disposition::Remove;
        }

        let context = self.dispatcher.context();
        let remote = request
            .target_remote
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(context.default_remote.as_str());
        self.status
            .publish(format!("Uploading {}...", file_label(source)).as_str(), false);
        match context.uploader.upload(source, remote) {
            Ok(message) => {
                info!(source = %source.display(), remote, "upload finished");
                self.status.publish(message.as_str(), false);
            }
            Err(err) => {
                warn!(source = %source.display(), remote, error = %err, "upload failed");
                self.status.publish(err.to_string().as_str(), true);
            }
        }
        Disposition::Remove
    }

    fn process_tool_request(&self, path: &Path) -> Disposition {
        let request = match read_request::<ToolRequest>(path) {
            Ok(request) => request,
            Err(reason) => {
                warn!(file = %path.display(), reason = %reason, "rejecting tool request");
                self.status
                    .publish(format!("Invalid tool request: {reason}").as_str(), true);
                return Disposition::DeadLetter(reason);
            }
        };

        let tool = request.tool.as_str();
        if !self.dispatcher.registry().contains(tool) {
            self.status
                .publish(format!("Unknown tool: {tool}").as_str(), true);
            return Disposition::Remove;
        }

        self.status.publish(format!("Running {tool}...").as_str(), false);
        match self.dispatcher.invoke(tool, &request.args) {
            Ok(output) => {
                self.status
                    .publish(self.preview(output.as_str()).as_str(), false);
                Disposition::Remove
            }
            Err(ToolError::Panicked { message, .. }) => {
                self.status.publish(
                    self.preview(format!("{tool} failed: {message}").as_str()).as_str(),
                    true,
                );
                Disposition::DeadLetter(format!("panicked: {message}"))
            }
            Err(err) => {
                self.status
                    .publish(self.preview(err.to_string().as_str()).as_str(), true);
                Disposition::Remove
            }
        }
    }

    fn preview(&self, text: &str) -> String {
        truncate_preview(text, self.settings.preview_chars)
    }

    /// Takes the file out of the queue. Returns true when it went to the
    /// dead-letter directory.
    fn finish(&self, path: &Path, disposition: Disposition) -> bool {
        if let Disposition::DeadLetter(reason) = &disposition {
            if self.settings.dead_letter {
                match self.move_to_dead_letter(path) {
                    Ok(target) => {
                        warn!(
                            file = %path.display(),
                            target = %target.display(),
                            reason = %reason,
                            "queue file moved to dead letter"
                        );
                        return true;
                    }
                    Err(err) => {
                        error!(file = %path.display(), error = %err, "dead letter move failed, deleting");
                    }
                }
            }
        }
        if let Err(err) = remove_if_exists(path) {
            error!(file = %path.display(), error = %err, "failed to remove queue file");
        }
        false
    }

    fn move_to_dead_letter(&self, path: &Path) -> io::Result<PathBuf> {
        let dir = self.layout.dead_letter_dir();
        fs::create_dir_all(dir.as_path())?;
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "queue file has no name"))?;
        let target = dir.join(name);
        fs::rename(path, target.as_path())?;
        Ok(target)
    }
}

fn read_request<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, String> {
    let raw = fs::read(path).map_err(|e| format!("{}: {e}", file_label(path)))?;
    serde_json::from_slice(raw.as_slice()).map_err(|e| format!("{}: {e}", file_label(path)))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Cuts `text` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut = text.chars().take(max_chars).collect::<String>();
    cut.push_str("...");
    cut
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
        let slice = remaining.min(STOP_CHECK_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

/// Drops an upload request into the queue.
pub fn enqueue_upload(layout: &MailboxLayout, request: &UploadRequest) -> io::Result<PathBuf> {
    enqueue(layout, "upload", request)
}

/// Drops a tool request into the queue.
pub fn enqueue_tool(layout: &MailboxLayout, request: &ToolRequest) -> io::Result<PathBuf> {
    enqueue(layout, "gui_request", request)
}

fn enqueue<T: Serialize>(layout: &MailboxLayout, prefix: &str, body: &T) -> io::Result<PathBuf> {
    layout.ensure_dir()?;
    let path = layout
        .dir()
        .join(format!("{prefix}_{}.json", Uuid::new_v4().simple()));
    let payload = serde_json::to_vec_pretty(body)?;
    write_atomic(path.as_path(), payload.as_slice())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::FakeAnalyzer;
    use crate::host::testing::ScriptedTransport;
    use crate::mailbox::status::StatusSink;
    use crate::tools::testing::{harness, Harness};
    use crate::tools::{ToolContext, ToolRegistry, ToolSpec};
    use std::sync::Mutex;
    use std::time::{Instant, UNIX_EPOCH};

    #[derive(Default)]
    struct RecordingStatus {
        published: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingStatus {
        fn published(&self) -> Vec<(String, bool)> {
            self.published
                .lock()
                .expect("recording status mutex poisoned")
                .clone()
        }
    }

    impl StatusSink for RecordingStatus {
        fn publish(&self, message: &str, is_error: bool) {
            self.published
                .lock()
                .expect("recording status mutex poisoned")
                .push((message.to_string(), is_error));
        }
    }

    struct Fixture {
        layout: MailboxLayout,
        harness: Harness,
        status: Arc<RecordingStatus>,
        monitor: QueueMonitor,
    }

    fn fixture(tag: &str, settings: MonitorSettings) -> Fixture {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let layout = MailboxLayout::new(
            std::env::temp_dir().join(format!("dt_mcp_monitor_{tag}_{stamp}")),
        );
        layout.ensure_dir().expect("mailbox dir");
        let harness = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        let status = Arc::new(RecordingStatus::default());
        let monitor = QueueMonitor::new(
            layout.clone(),
            Arc::new(harness.dispatcher.clone()),
            status.clone(),
            settings,
        );
        Fixture {
            layout,
            harness,
            status,
            monitor,
        }
    }

    fn source_file(layout: &MailboxLayout) -> PathBuf {
        let path = layout.dir().join("photo.jpg");
        fs::write(path.as_path(), b"jpeg").expect("source file");
        path
    }

    #[test]
    fn upload_request_is_processed_once_and_removed() {
        let fx = fixture("upload", MonitorSettings::default());
        let source = source_file(&fx.layout);
        let queued = enqueue_upload(
            &fx.layout,
            &UploadRequest {
                source_file: source.clone(),
                target_remote: Some(String::from("gphotos:album")),
            },
        )
        .expect("enqueue");

        let report = fx.monitor.run_cycle().expect("cycle");
        assert_eq!(report.uploads, 1);
        assert!(!queued.exists());
        let second = fx.monitor.run_cycle().expect("second cycle");
        assert!(second.is_idle());

        let seen = fx.harness.uploader.seen.lock().expect("uploader").clone();
        assert_eq!(seen, vec![(source, String::from("gphotos:album"))]);
        let published = fx.status.published();
        assert_eq!(published[0], (String::from("Uploading photo.jpg..."), false));
        assert!(!published[1].1);
    }

    #[test]
    fn upload_without_remote_uses_default() {
        let fx = fixture("upload_default", MonitorSettings::default());
        let source = source_file(&fx.layout);
        enqueue_upload(
            &fx.layout,
            &UploadRequest {
                source_file: source,
                target_remote: None,
            },
        )
        .expect("enqueue");
        fx.monitor.run_cycle().expect("cycle");
        let seen = fx.harness.uploader.seen.lock().expect("uploader").clone();
        assert_eq!(seen[0].1, "remote:photos");
    }

    #[test]
    fn missing_source_is_reported_and_removed() {
        let fx = fixture("missing", MonitorSettings::default());
        let queued = enqueue_upload(
            &fx.layout,
            &UploadRequest {
                source_file: PathBuf::from("/definitely/not/here.jpg"),
                target_remote: None,
            },
        )
        .expect("enqueue");
        let report = fx.monitor.run_cycle().expect("cycle");
        assert_eq!(report.dead_lettered, 0);
        assert!(!queued.exists());
        assert!(fx.harness.uploader.seen.lock().expect("uploader").is_empty());
        let published = fx.status.published();
        assert_eq!(
            published,
            vec![(String::from("File not found: /definitely/not/here.jpg"), true)]
        );
    }

    #[test]
    fn unknown_tool_is_published_and_removed() {
        let fx = fixture("unknown", MonitorSettings::default());
        let queued = enqueue_tool(
            &fx.layout,
            &ToolRequest {
                tool: String::from("make_coffee"),
                args: Map::new(),
            },
        )
        .expect("enqueue");
        fx.monitor.run_cycle().expect("cycle");
        assert!(!queued.exists());
        assert!(!fx.layout.dead_letter_dir().exists());
        let published = fx.status.published();
        assert_eq!(published, vec![(String::from("Unknown tool: make_coffee"), true)]);
    }

    #[test]
    fn known_tool_result_is_published() {
        let fx = fixture("known", MonitorSettings::default());
        enqueue_tool(
            &fx.layout,
            &ToolRequest {
                tool: String::from("get_selection"),
                args: Map::new(),
            },
        )
        .expect("enqueue");
        let report = fx.monitor.run_cycle().expect("cycle");
        assert_eq!(report.tool_requests, 1);
        let published = fx.status.published();
        assert_eq!(published[0].0, "Running get_selection...");
        assert_eq!(published[1], (String::from("No images selected."), false));
    }

    #[test]
    fn malformed_request_goes_to_dead_letter() {
        let fx = fixture("malformed", MonitorSettings::default());
        let bad = fx.layout.dir().join("gui_request_bad.json");
        fs::write(bad.as_path(), b"{not json").expect("bad file");

        let report = fx.monitor.run_cycle().expect("cycle");
        assert_eq!(report.dead_lettered, 1);
        assert!(!bad.exists());
        assert!(fx.layout.dead_letter_dir().join("gui_request_bad.json").is_file());
        assert!(fx.status.published()[0].1);
    }

    #[test]
    fn malformed_request_is_deleted_when_dead_letter_disabled() {
        let settings = MonitorSettings {
            dead_letter: false,
            ..MonitorSettings::default()
        };
        let fx = fixture("no_dead_letter", settings);
        let bad = fx.layout.dir().join("upload_bad.json");
        fs::write(bad.as_path(), b"[]").expect("bad file");

        let report = fx.monitor.run_cycle().expect("cycle");
        assert_eq!(report.dead_lettered, 0);
        assert!(!bad.exists());
        assert!(!fx.layout.dead_letter_dir().exists());
    }

    #[test]
    fn uploads_drain_before_tool_requests() {
        let fx = fixture("order", MonitorSettings::default());
        enqueue_tool(
            &fx.layout,
            &ToolRequest {
                tool: String::from("get_selection"),
                args: Map::new(),
            },
        )
        .expect("enqueue tool");
        let source = source_file(&fx.layout);
        enqueue_upload(
            &fx.layout,
            &UploadRequest {
                source_file: source,
                target_remote: None,
            },
        )
        .expect("enqueue upload");

        fx.monitor.run_cycle().expect("cycle");
        let published = fx.status.published();
        let upload_at = published
            .iter()
            .position(|(m, _)| m.starts_with("Uploading"))
            .expect("upload published");
        let tool_at = published
            .iter()
            .position(|(m, _)| m.starts_with("Running"))
            .expect("tool published");
        assert!(upload_at < tool_at);
    }

    #[test]
    fn staging_files_are_left_alone() {
        let fx = fixture("staging", MonitorSettings::default());
        let staging = fx.layout.dir().join("upload_pending.json.tmp");
        fs::write(staging.as_path(), b"{").expect("staging file");
        let report = fx.monitor.run_cycle().expect("cycle");
        assert!(report.is_idle());
        assert!(staging.exists());
    }

    #[test]
    fn missing_mailbox_dir_is_an_idle_cycle() {
        let harness = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        let monitor = QueueMonitor::new(
            MailboxLayout::new("/definitely/not/here/mcp"),
            Arc::new(harness.dispatcher),
            Arc::new(RecordingStatus::default()),
            MonitorSettings::default(),
        );
        assert!(monitor.run_cycle().expect("cycle").is_idle());
    }

    fn explode(_ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
        panic!("boom")
    }

    #[test]
    fn run_survives_an_unlistable_mailbox_and_drains_once_restored() {
        let fx = fixture(
            "recover",
            MonitorSettings {
                interval: Duration::from_millis(10),
                backoff: Duration::from_millis(30),
                ..MonitorSettings::default()
            },
        );
        let dir = fx.layout.dir().to_path_buf();
        fs::remove_dir_all(dir.as_path()).expect("remove mailbox dir");
        fs::write(dir.as_path(), b"not a directory").expect("file in place of dir");
        assert!(matches!(fx.monitor.run_cycle(), Err(MonitorError::List { .. })));

        let stop = AtomicBool::new(false);
        let (survived, drained) = thread::scope(|scope| {
            let running = scope.spawn(|| fx.monitor.run(&stop));
            thread::sleep(Duration::from_millis(200));
            let survived = !running.is_finished();

            fs::remove_file(dir.as_path()).expect("remove placeholder file");
            fx.layout.ensure_dir().expect("restore mailbox dir");
            let queued = enqueue_tool(
                &fx.layout,
                &ToolRequest {
                    tool: String::from("get_selection"),
                    args: Map::new(),
                },
            )
            .expect("enqueue");

            let deadline = Instant::now() + Duration::from_secs(5);
            while queued.exists() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            stop.store(true, Ordering::SeqCst);
            running.join().expect("monitor thread should not panic");
            (survived, !queued.exists())
        });
        assert!(survived, "monitor exited after failed cycles");
        assert!(drained);

        let published = fx.status.published();
        assert!(published.iter().any(|(m, _)| m == "Running get_selection..."));
    }

    #[test]
    fn panicking_tool_request_goes_to_dead_letter() {
        let fx = fixture("panic", MonitorSettings::default());
        let mut registry = ToolRegistry::standard();
        registry.register(ToolSpec {
            name: "explode",
            description: "Always panics.",
            params: &[],
            handler: explode,
        });
        let dispatcher = Dispatcher::new(registry, fx.harness.dispatcher.context().clone());
        let monitor = QueueMonitor::new(
            fx.layout.clone(),
            Arc::new(dispatcher),
            fx.status.clone(),
            MonitorSettings::default(),
        );
        let queued = enqueue_tool(
            &fx.layout,
            &ToolRequest {
                tool: String::from("explode"),
                args: Map::new(),
            },
        )
        .expect("enqueue");
        let name = queued
            .file_name()
            .map(|n| n.to_os_string())
            .expect("queue file name");

        let report = monitor.run_cycle().expect("cycle survives the panic");
        assert_eq!(report.tool_requests, 1);
        assert_eq!(report.dead_lettered, 1);
        assert!(!queued.exists());
        assert!(fx.layout.dead_letter_dir().join(name).is_file());

        let published = fx.status.published();
        assert_eq!(published[0], (String::from("Running explode..."), false));
        assert_eq!(published[1], (String::from("explode failed: boom"), true));
    }

    #[test]
    fn preview_is_cut_on_char_boundary() {
        assert_eq!(truncate_preview("short", 10), "short");
        assert_eq!(truncate_preview("ééééé", 3), "ééé...");
    }
}
