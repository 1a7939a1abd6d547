//! Tool registry shared by the stdio surface and the GUI request queue.

mod catalog_tools;
mod cloud;
mod host_tools;
mod vision;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::analysis::SharedImageAnalyzer;
use crate::catalog::CatalogError;
use crate::catalog::CatalogStore;
use crate::host::{HostClient, HostError, SelectionItem};
use crate::upload::SharedUploader;

pub use vision::{rank_for_cull, CullDecision, DISCARD_LABEL, KEEP_LABEL};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Missing or invalid argument '{name}': expected {expected}")]
    InvalidArgument { name: String, expected: &'static str },
    #[error("{0}")]
    Aborted(String),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("tool '{tool}' panicked: {message}")]
    Panicked { tool: String, message: String },
}

/// Collaborators every handler may use. Built once per process.
#[derive(Clone)]
pub struct ToolContext {
    pub host: HostClient,
    pub catalog: CatalogStore,
    pub analyzer: SharedImageAnalyzer,
    pub uploader: SharedUploader,
    pub default_remote: String,
    pub style_dir: PathBuf,
}

pub type ToolHandler = fn(&ToolContext, &Map<String, Value>) -> Result<String, ToolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Integer,
    String,
}

impl ParamKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::String => "string",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolParam {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
}

#[derive(Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ToolParam],
    pub handler: ToolHandler,
}

impl ToolSpec {
    pub fn input_schema(&self) -> Value {
        let properties = self
            .params
            .iter()
            .map(|param| {
                (
                    param.name.to_string(),
                    json!({"type": param.kind.as_str(), "description": param.description}),
                )
            })
            .collect::<Map<String, Value>>();
        let required = self
            .params
            .iter()
            .filter(|param| param.required)
            .map(|param| param.name)
            .collect::<Vec<_>>();
        json!({"type": "object", "properties": properties, "required": required})
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl ToolRegistry {
    pub fn standard() -> Self {
        let mut registry = Self::default();
        for spec in catalog_tools::SPECS
            .iter()
            .chain(host_tools::SPECS)
            .chain(vision::SPECS)
            .chain(cloud::SPECS)
        {
            registry.register(*spec);
        }
        registry
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }
}

/// Registry plus context: what callers actually invoke.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ToolRegistry,
    context: ToolContext,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, context: ToolContext) -> Self {
        Self { registry, context }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Runs a tool by name. A panicking handler is reported as
    /// `ToolError::Panicked` rather than unwinding into the caller.
    pub fn invoke(&self, name: &str, args: &Map<String, Value>) -> Result<String, ToolError> {
        let Some(spec) = self.registry.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        info!(tool = name, "invoking tool");
        match catch_unwind(AssertUnwindSafe(|| (spec.handler)(&self.context, args))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(tool = name, message = %message, "tool handler panicked");
                Err(ToolError::Panicked {
                    tool: name.to_string(),
                    message,
                })
            }
        }
    }
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    String::from("unknown panic")
}

pub(crate) fn arg_i64(args: &Map<String, Value>, name: &str) -> Result<i64, ToolError> {
    let invalid = || ToolError::InvalidArgument {
        name: name.to_string(),
        expected: "an integer",
    };
    match args.get(name) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(invalid),
        // GUI requests built from Lua widgets often stringify numbers.
        Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArgument {
            name: name.to_string(),
            expected: "a string",
        })
}

pub(crate) fn opt_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Fetches the host selection and enforces a minimum size. Any failure
/// aborts the tool before per-item work starts.
pub(crate) fn require_selection(
    ctx: &ToolContext,
    min_items: usize,
) -> Result<Vec<SelectionItem>, ToolError> {
    let items = ctx
        .host
        .get_selection()
        .map_err(|e| ToolError::Aborted(format!("Failed to get selection: {e}")))?;
    if items.is_empty() {
        return Err(ToolError::Aborted(String::from("No images selected.")));
    }
    if items.len() < min_items {
        return Err(ToolError::Aborted(format!(
            "Select at least {min_items} images (got {}).",
            items.len()
        )));
    }
    Ok(items)
}

/// Runs one per-item step, folding panics into the error string so a single
/// bad file never takes the batch down.
pub(crate) fn guard_item<T, E, F>(work: F) -> Result<T, String>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

pub(crate) fn render_data(data: Option<Value>) -> String {
    let body = json!({"status": "ok", "data": data.unwrap_or(Value::Null)});
    serde_json::to_string(&body).unwrap_or_else(|_| String::from(r#"{"status":"ok"}"#))
}
