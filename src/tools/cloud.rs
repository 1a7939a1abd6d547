use serde_json::{Map, Value};

use super::{
    guard_item, opt_str, require_selection, ParamKind, ToolContext, ToolError, ToolParam, ToolSpec,
};

const UPLOADED_TAG: &str = "mcp|uploaded";

pub(super) const SPECS: &[ToolSpec] = &[ToolSpec {
    name: "upload_selection",
    description: "Upload the selected images to an rclone remote and tag the ones that made it.",
    params: &[ToolParam {
        name: "remote",
        kind: ParamKind::String,
        description: "rclone destination, e.g. gphotos:album (defaults to the configured remote)",
        required: false,
    }],
    handler: upload_selection,
}];

fn upload_selection(ctx: &ToolContext, args: &Map<String, Value>) -> Result<String, ToolError> {
    let remote = opt_str(args, "remote").unwrap_or(ctx.default_remote.as_str());
    let items = require_selection(ctx, 1)?;

    let mut uploaded = 0usize;
    let mut lines = Vec::with_capacity(items.len());
    for item in &items {
        let name = item.display_name();
        match guard_item(|| ctx.uploader.upload(item.file_path().as_path(), remote)) {
            Ok(message) => {
                uploaded += 1;
                let mut line = format!("OK {name}: {message}");
                if let Err(err) = ctx.host.attach_tag(item.id, UPLOADED_TAG) {
                    line.push_str(format!(" [tag failed: {err}]").as_str());
                }
                lines.push(line);
            }
            Err(err) => lines.push(format!("FAILED {name}: {err}")),
        }
    }
    lines.insert(
        0,
        format!("Uploaded {uploaded}/{} images to {remote}:", items.len()),
    );
    Ok(lines.join("\n"))
}
