#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dt_mcp_bridge::config::BridgeConfig;
use dt_mcp_bridge::mailbox::{write_atomic, Command, MailboxLayout, Response};

pub fn temp_dir(tag: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("dt_mcp_it_{tag}_{stamp}"));
    fs::create_dir_all(dir.as_path()).expect("temp dir should be created");
    dir
}

/// Config rooted in a fresh temp dir with fast timings and no real rclone.
pub fn test_config(tag: &str) -> BridgeConfig {
    let mut config = BridgeConfig::with_config_dir(temp_dir(tag));
    config.poll_interval = Duration::from_millis(10);
    config.response_timeout = Duration::from_secs(3);
    config.monitor_interval = Duration::from_millis(20);
    config.monitor_backoff = Duration::from_millis(50);
    config.rclone_binary = String::from("dt-mcp-bridge-no-such-rclone");
    config.mock_upload_delay = Duration::ZERO;
    config
}

pub fn reply(response: Response) -> Option<String> {
    Some(serde_json::to_string(&response).expect("response should serialize"))
}

#[derive(Debug, Clone)]
pub struct Pickup {
    pub command: Command,
    /// Whether a response file was still lying around when the command was
    /// picked up.
    pub response_pending: bool,
}

type Answer = dyn Fn(&Command) -> Option<String> + Send + Sync;

/// Plays the darktable side of the mailbox: picks up `cmd.json`, deletes it
/// and answers through `response.json` with whatever `answer` returns.
pub struct Responder {
    stop: Arc<AtomicBool>,
    pickups: Arc<Mutex<Vec<Pickup>>>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    pub fn spawn<F>(layout: MailboxLayout, answer: F) -> Self
    where
        F: Fn(&Command) -> Option<String> + Send + Sync + 'static,
    {
        layout.ensure_dir().expect("mailbox dir should be created");
        let stop = Arc::new(AtomicBool::new(false));
        let pickups = Arc::new(Mutex::new(Vec::<Pickup>::new()));
        let answer: Box<Answer> = Box::new(answer);

        let thread_stop = stop.clone();
        let thread_pickups = pickups.clone();
        let handle = thread::spawn(move || {
            let cmd_path = layout.cmd_path();
            let response_path = layout.response_path();
            while !thread_stop.load(Ordering::SeqCst) {
                let raw = match fs::read(cmd_path.as_path()) {
                    Ok(raw) if !raw.is_empty() => raw,
                    _ => {
                        thread::sleep(Duration::from_millis(2));
                        continue;
                    }
                };
                let Ok(command) = serde_json::from_slice::<Command>(raw.as_slice()) else {
                    thread::sleep(Duration::from_millis(2));
                    continue;
                };
                let _ = fs::remove_file(cmd_path.as_path());
                thread_pickups
                    .lock()
                    .expect("pickups mutex poisoned")
                    .push(Pickup {
                        command: command.clone(),
                        response_pending: response_path.exists(),
                    });
                if let Some(body) = answer(&command) {
                    write_atomic(response_path.as_path(), body.as_bytes())
                        .expect("response should be written");
                }
            }
        });

        Self {
            stop,
            pickups,
            handle: Some(handle),
        }
    }

    pub fn pickups(&self) -> Vec<Pickup> {
        self.pickups.lock().expect("pickups mutex poisoned").clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.pickups().into_iter().map(|p| p.command).collect()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
