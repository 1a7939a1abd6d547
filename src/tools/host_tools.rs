use serde_json::{Map, Value};

use super::{
    arg_i64, arg_str, render_data, ParamKind, ToolContext, ToolError, ToolParam, ToolSpec,
};
use crate::host::ColorLabel;

const IMG_ID: ToolParam = ToolParam {
    name: "img_id",
    kind: ParamKind::Integer,
    description: "Image id in the darktable library",
    required: true,
};

pub(super) const SPECS: &[ToolSpec] = &[
    ToolSpec {
        name: "set_rating",
        description: "Set the star rating for an image (0-5, or -1 for reject).",
        params: &[
            IMG_ID,
            ToolParam {
                name: "rating",
                kind: ParamKind::Integer,
                description: "Stars 0-5, -1 rejects",
                required: true,
            },
        ],
        handler: set_rating,
    },
    ToolSpec {
        name: "attach_tag",
        description: "Attach a tag to an image.",
        params: &[
            IMG_ID,
            ToolParam {
                name: "tag_name",
                kind: ParamKind::String,
                description: "Tag path, e.g. places|Paris",
                required: true,
            },
        ],
        handler: attach_tag,
    },
    ToolSpec {
        name: "apply_style",
        description: "Apply a named style (preset) to an image.",
        params: &[
            IMG_ID,
            ToolParam {
                name: "style_name",
                kind: ParamKind::String,
                description: "Name of an installed darktable style",
                required: true,
            },
        ],
        handler: apply_style,
    },
    ToolSpec {
        name: "set_color_label",
        description: "Set a color label (red, yellow, green, blue, purple) on an image.",
        params: &[
            IMG_ID,
            ToolParam {
                name: "label",
                kind: ParamKind::String,
                description: "red | yellow | green | blue | purple",
                required: true,
            },
        ],
        handler: set_color_label,
    },
    ToolSpec {
        name: "get_selection",
        description: "List the images currently selected in darktable.",
        params: &[],
        handler: get_selection,
    },
];

fn set_rating(ctx: &ToolContext, args: &Map<String, Value>) -> Result<String, ToolError> {
    let img_id = arg_i64(args, "img_id")?;
    let rating = arg_i64(args, "rating")?;
    Ok(render_data(ctx.host.set_rating(img_id, rating)?))
}

fn attach_tag(ctx: &ToolContext, args: &Map<String, Value>) -> Result<String, ToolError> {
    let img_id = arg_i64(args, "img_id")?;
    let tag_name = arg_str(args, "tag_name")?;
    Ok(render_data(ctx.host.attach_tag(img_id, tag_name)?))
}

fn apply_style(ctx: &ToolContext, args: &Map<String, Value>) -> Result<String, ToolError> {
    let img_id = arg_i64(args, "img_id")?;
    let style_name = arg_str(args, "style_name")?;
    Ok(render_data(ctx.host.apply_style(img_id, style_name)?))
}

fn set_color_label(ctx: &ToolContext, args: &Map<String, Value>) -> Result<String, ToolError> {
    let img_id = arg_i64(args, "img_id")?;
    let label = arg_str(args, "label")?.parse::<ColorLabel>()?;
    Ok(render_data(ctx.host.set_color_label(img_id, label)?))
}

fn get_selection(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let items = ctx.host.get_selection()?;
    if items.is_empty() {
        return Ok(String::from("No images selected."));
    }
    serde_json::to_string_pretty(&items)
        .map_err(|e| ToolError::Aborted(format!("Failed to render selection: {e}")))
}

#[cfg(test)]
mod tests {
    use crate::analysis::testing::FakeAnalyzer;
    use crate::host::testing::ScriptedTransport;
    use crate::mailbox::Response;
    use crate::tools::testing::{args, harness};
    use serde_json::json;

    #[test]
    fn set_rating_rejects_six_without_round_trip() {
        let h = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        let err = h
            .dispatcher
            .invoke("set_rating", &args(json!({"img_id": 4, "rating": 6})))
            .expect_err("rating 6 is invalid");
        assert_eq!(err.to_string(), "Rating must be between -1 and 5");
        assert!(h.transport.commands().is_empty());
    }

    #[test]
    fn set_rating_returns_host_payload() {
        let h = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        h.transport
            .push_reply(Ok(Response::ok(Some(json!({"img_id": 4, "rating": -1})))));
        let out = h
            .dispatcher
            .invoke("set_rating", &args(json!({"img_id": 4, "rating": -1})))
            .expect("reject is valid");
        let parsed: serde_json::Value = serde_json::from_str(out.as_str()).expect("json output");
        assert_eq!(parsed["status"], json!("ok"));
        assert_eq!(parsed["data"]["rating"], json!(-1));
    }

    #[test]
    fn set_color_label_validates_label_locally() {
        let h = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        let err = h
            .dispatcher
            .invoke("set_color_label", &args(json!({"img_id": 1, "label": "magenta"})))
            .expect_err("invalid label");
        assert!(err.to_string().contains("magenta"));
        assert!(h.transport.commands().is_empty());
    }

    #[test]
    fn missing_argument_is_named() {
        let h = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        let err = h
            .dispatcher
            .invoke("attach_tag", &args(json!({"img_id": 1})))
            .expect_err("tag_name missing");
        assert!(err.to_string().contains("tag_name"));
    }
}
