use serde_json::{Map, Value};
use tracing::warn;

use super::{guard_item, require_selection, ToolContext, ToolError, ToolSpec};
use crate::analysis::dtstyle::generate_dtstyle;
use crate::host::{ColorLabel, HostError, SelectionItem};

pub const KEEP_LABEL: ColorLabel = ColorLabel::Green;
pub const DISCARD_LABEL: ColorLabel = ColorLabel::Red;
const MASK_TAG: &str = "darktable|mcp|masked";

pub(super) const SPECS: &[ToolSpec] = &[
    ToolSpec {
        name: "auto_cull",
        description: "Rank the selected images by sharpness; label the sharpest green and the rest red.",
        params: &[],
        handler: auto_cull,
    },
    ToolSpec {
        name: "auto_tag",
        description: "Classify the selected images (lighting, orientation) and attach the resulting tags.",
        params: &[],
        handler: auto_tag,
    },
    ToolSpec {
        name: "generate_mask",
        description: "Write a foreground mask next to each selected image and tag the image.",
        params: &[],
        handler: generate_mask,
    },
    ToolSpec {
        name: "auto_develop",
        description: "Estimate an exposure correction per selected image and apply it as a generated style.",
        params: &[],
        handler: auto_develop,
    },
    ToolSpec {
        name: "generative_edit",
        description: "Open the interactive inpainting editor on the first selected image and import the result.",
        params: &[],
        handler: generative_edit,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullDecision {
    Keep,
    Discard,
}

impl CullDecision {
    pub fn label(self) -> ColorLabel {
        match self {
            Self::Keep => KEEP_LABEL,
            Self::Discard => DISCARD_LABEL,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Keep => "KEEP",
            Self::Discard => "DISCARD",
        }
    }
}

/// Orders indices into `scores` by descending score. Equal scores keep their
/// input order, so the first of a tied maximum is the one kept. NaN ranks
/// last.
pub fn rank_for_cull(scores: &[f64]) -> Vec<(usize, CullDecision)> {
    let sortable = |v: f64| if v.is_nan() { f64::NEG_INFINITY } else { v };
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| sortable(scores[b]).total_cmp(&sortable(scores[a])));
    order
        .into_iter()
        .enumerate()
        .map(|(rank, idx)| {
            let decision = if rank == 0 {
                CullDecision::Keep
            } else {
                CullDecision::Discard
            };
            (idx, decision)
        })
        .collect()
}

fn auto_cull(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let items = require_selection(ctx, 2)?;
    let mut scored = Vec::<(&SelectionItem, f64)>::with_capacity(items.len());
    let mut skipped = Vec::<String>::new();
    for item in &items {
        match guard_item(|| ctx.analyzer.sharpness(item.file_path().as_path())) {
            Ok(score) => scored.push((item, score)),
            Err(err) => skipped.push(format!("SKIP {}: {err}", item.display_name())),
        }
    }
    if scored.is_empty() {
        return Err(ToolError::Aborted(format!(
            "Could not score any selected image.\n{}",
            skipped.join("\n")
        )));
    }

    let scores = scored.iter().map(|(_, score)| *score).collect::<Vec<_>>();
    let mut lines = vec![format!("Culled {} images by sharpness:", scored.len())];
    for (idx, decision) in rank_for_cull(scores.as_slice()) {
        let (item, score) = scored[idx];
        let label = decision.label();
        let mut line = format!(
            "{} {} (sharpness {score:.2}) -> {label}",
            decision.as_str(),
            item.display_name()
        );
        if let Err(err) = ctx.host.set_color_label(item.id, label) {
            line.push_str(format!(" [label failed: {err}]").as_str());
        }
        lines.push(line);
    }
    lines.extend(skipped);
    Ok(lines.join("\n"))
}

fn auto_tag(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let items = require_selection(ctx, 1)?;
    let mut lines = vec![format!("Auto-tagged {} images:", items.len())];
    for item in &items {
        let name = item.display_name();
        let tags = match guard_item(|| ctx.analyzer.classify(item.file_path().as_path())) {
            Ok(tags) => tags,
            Err(err) => {
                lines.push(format!("{name}: classification failed: {err}"));
                continue;
            }
        };
        let failed = tags
            .iter()
            .filter_map(|tag| ctx.host.attach_tag(item.id, tag.as_str()).err())
            .collect::<Vec<HostError>>();
        let mut line = format!("{name}: {}", tags.join(", "));
        if let Some(first) = failed.first() {
            line.push_str(format!(" [{} tag(s) failed: {first}]", failed.len()).as_str());
        }
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

fn generate_mask(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let items = require_selection(ctx, 1)?;
    let mut lines = vec![format!("Masks for {} images:", items.len())];
    for item in &items {
        let name = item.display_name();
        match guard_item(|| ctx.analyzer.generate_mask(item.file_path().as_path())) {
            Ok(produced) => {
                let mut line = format!(
                    "{name}: {} ({})",
                    produced.path.display(),
                    produced.status
                );
                if let Err(err) = ctx.host.attach_tag(item.id, MASK_TAG) {
                    line.push_str(format!(" [tag failed: {err}]").as_str());
                }
                lines.push(line);
            }
            Err(err) => lines.push(format!("{name}: mask generation failed: {err}")),
        }
    }
    Ok(lines.join("\n"))
}

fn auto_develop(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let items = require_selection(ctx, 1)?;
    let mut lines = vec![format!("Auto-developed {} images:", items.len())];
    for item in &items {
        let name = item.display_name();
        let applied = guard_item(|| {
            let bias = ctx
                .analyzer
                .analyze_exposure(item.file_path().as_path())
                .map_err(|e| e.to_string())?;
            let style_path =
                generate_dtstyle(bias, ctx.style_dir.as_path()).map_err(|e| e.to_string())?;
            ctx.host
                .apply_style_file(item.id, style_path.as_path())
                .map_err(|e| e.to_string())?;
            // A timed out apply may still be read by the host later.
            if let Err(err) = std::fs::remove_file(style_path.as_path()) {
                warn!(path = %style_path.display(), error = %err, "failed to remove style file");
            }
            Ok::<f64, String>(bias)
        });
        match applied {
            Ok(bias) => lines.push(format!("{name}: exposure {bias:+.2} EV applied")),
            Err(err) => lines.push(format!("{name}: failed: {err}")),
        }
    }
    Ok(lines.join("\n"))
}

fn generative_edit(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let items = require_selection(ctx, 1)?;
    let item = &items[0];
    let name = item.display_name();
    let produced = guard_item(|| ctx.analyzer.inpaint(item.file_path().as_path()))
        .map_err(|err| ToolError::Aborted(format!("{name}: {err}")))?;
    let mut report = format!("{name}: {} -> {}", produced.status, produced.path.display());
    match ctx.host.import_image(produced.path.as_path()) {
        Ok(_) => report.push_str(" (imported)"),
        Err(err) => report.push_str(format!(" [import failed: {err}]").as_str()),
    }
    Ok(report)
}
