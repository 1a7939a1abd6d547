use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::mailbox::{Command, MailboxChannel, Response, ResponseFailure};

pub const MIN_RATING: i64 = -1;
pub const MAX_RATING: i64 = 5;

/// Anything that can carry one command to the host and bring back its
/// response. `MailboxChannel` is the production transport.
pub trait CommandTransport: Send + Sync + 'static {
    fn exchange(&self, command: &Command) -> Result<Response, ResponseFailure>;
}

pub type SharedCommandTransport = Arc<dyn CommandTransport>;

impl CommandTransport for MailboxChannel {
    fn exchange(&self, command: &Command) -> Result<Response, ResponseFailure> {
        MailboxChannel::exchange(self, command)
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    Validation(String),
    #[error("bridge transport error: {0}")]
    Transport(#[from] ResponseFailure),
    #[error("host error: {0}")]
    Host(String),
    #[error("unexpected payload for '{command}': {message}")]
    Payload { command: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorLabel {
    Red,
    Yellow,
    Green,
    Blue,
    Purple,
}

impl ColorLabel {
    pub const ALL: [Self; 5] = [Self::Red, Self::Yellow, Self::Green, Self::Blue, Self::Purple];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Blue => "blue",
            Self::Purple => "purple",
        }
    }
}

impl fmt::Display for ColorLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorLabel {
    type Err = HostError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|label| label.as_str() == normalized)
            .ok_or_else(|| {
                HostError::Validation(format!(
                    "Color label must be one of red, yellow, green, blue, purple (got '{value}')"
                ))
            })
    }
}

/// One image of the current host selection. Fields beyond the three the
/// bridge relies on are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionItem {
    pub id: i64,
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub filename: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SelectionItem {
    /// The Lua API reports the film roll folder in `path`; older bridge
    /// scripts send the full file path. Accept both.
    pub fn file_path(&self) -> PathBuf {
        if self.filename.is_empty() || self.path.ends_with(self.filename.as_str()) {
            return self.path.clone();
        }
        self.path.join(self.filename.as_str())
    }

    pub fn display_name(&self) -> String {
        if !self.filename.is_empty() {
            return self.filename.clone();
        }
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("image {}", self.id))
    }
}

/// Typed host operations. Each call is exactly one mailbox exchange; input
/// validation runs before the channel is touched.
#[derive(Clone)]
pub struct HostClient {
    transport: SharedCommandTransport,
}

impl HostClient {
    pub fn new(transport: SharedCommandTransport) -> Self {
        Self { transport }
    }

    pub fn set_rating(&self, img_id: i64, rating: i64) -> Result<Option<Value>, HostError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(HostError::Validation(String::from(
                "Rating must be between -1 and 5",
            )));
        }
        self.call("set_rating", json!({"img_id": img_id, "rating": rating}))
    }

    pub fn attach_tag(&self, img_id: i64, tag_name: &str) -> Result<Option<Value>, HostError> {
        let tag_name = require_text(tag_name, "Tag name")?;
        self.call("attach_tag", json!({"img_id": img_id, "tag_name": tag_name}))
    }

    pub fn apply_style(&self, img_id: i64, style_name: &str) -> Result<Option<Value>, HostError> {
        let style_name = require_text(style_name, "Style name")?;
        self.call(
            "apply_style",
            json!({"img_id": img_id, "style_name": style_name}),
        )
    }

    pub fn apply_style_file(
        &self,
        img_id: i64,
        style_path: &Path,
    ) -> Result<Option<Value>, HostError> {
        self.call(
            "apply_style_file",
            json!({"img_id": img_id, "style_path": style_path.to_string_lossy()}),
        )
    }

    pub fn set_color_label(
        &self,
        img_id: i64,
        label: ColorLabel,
    ) -> Result<Option<Value>, HostError> {
        self.call(
            "set_color_label",
            json!({"img_id": img_id, "label": label.as_str()}),
        )
    }

    pub fn import_image(&self, path: &Path) -> Result<Option<Value>, HostError> {
        self.call("import_image", json!({"path": path.to_string_lossy()}))
    }

    pub fn get_selection(&self) -> Result<Vec<SelectionItem>, HostError> {
        let data = self.call("get_selection", json!({}))?;
        let items = match data {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(HostError::Payload {
                    command: String::from("get_selection"),
                    message: format!("expected an array, got {}", json_kind(&other)),
                })
            }
        };
        items
            .into_iter()
            .map(serde_json::from_value::<SelectionItem>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HostError::Payload {
                command: String::from("get_selection"),
                message: e.to_string(),
            })
    }

    fn call(&self, name: &str, args: Value) -> Result<Option<Value>, HostError> {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let response = self.transport.exchange(&Command::new(name, args))?;
        if response.is_ok() {
            return Ok(response.data);
        }
        Err(HostError::Host(
            response
                .error
                .unwrap_or_else(|| String::from("host returned error without message")),
        ))
    }
}

fn require_text<'a>(value: &'a str, field: &str) -> Result<&'a str, HostError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HostError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
