use serde_json::{Map, Value};

use super::{arg_i64, ParamKind, ToolContext, ToolError, ToolParam, ToolSpec};

const RECENT_IMAGES_LIMIT: u32 = 50;

pub(super) const SPECS: &[ToolSpec] = &[
    ToolSpec {
        name: "list_images",
        description: "List the 50 most recent images in the darktable library.",
        params: &[],
        handler: list_images,
    },
    ToolSpec {
        name: "get_image_details",
        description: "Get detailed metadata for a specific image id.",
        params: &[ToolParam {
            name: "img_id",
            kind: ParamKind::Integer,
            description: "Image id in the darktable library",
            required: true,
        }],
        handler: get_image_details,
    },
];

fn list_images(ctx: &ToolContext, _args: &Map<String, Value>) -> Result<String, ToolError> {
    let images = ctx.catalog.list_recent_images(RECENT_IMAGES_LIMIT)?;
    pretty(&images)
}

fn get_image_details(ctx: &ToolContext, args: &Map<String, Value>) -> Result<String, ToolError> {
    let img_id = arg_i64(args, "img_id")?;
    match ctx.catalog.image_details(img_id)? {
        Some(row) => pretty(&row),
        None => Ok(String::from("Image not found")),
    }
}

fn pretty<T: serde::Serialize>(value: &T) -> Result<String, ToolError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ToolError::Aborted(format!("Failed to render catalog rows: {e}")))
}

#[cfg(test)]
mod tests {
    use crate::analysis::testing::FakeAnalyzer;
    use crate::catalog::testing::seeded_catalog;
    use crate::host::testing::ScriptedTransport;
    use crate::tools::testing::{args, harness, harness_with_catalog};
    use serde_json::{json, Map, Value};

    #[test]
    fn list_images_reads_catalog_without_touching_host() {
        let h = harness_with_catalog(
            ScriptedTransport::always_ok(),
            FakeAnalyzer::default(),
            seeded_catalog("tool_list"),
        );
        let out = h
            .dispatcher
            .invoke("list_images", &Map::new())
            .expect("list images");
        let rows: Value = serde_json::from_str(out.as_str()).expect("json rows");
        assert_eq!(rows[0]["filename"], json!("c.jpg"));
        assert_eq!(rows.as_array().map(Vec::len), Some(3));
        assert!(h.transport.commands().is_empty());
    }

    #[test]
    fn unknown_image_is_reported_as_not_found() {
        let h = harness_with_catalog(
            ScriptedTransport::always_ok(),
            FakeAnalyzer::default(),
            seeded_catalog("tool_details"),
        );
        let out = h
            .dispatcher
            .invoke("get_image_details", &args(json!({"img_id": 404})))
            .expect("query runs");
        assert_eq!(out, "Image not found");
    }

    #[test]
    fn missing_catalog_surfaces_as_error() {
        let h = harness(ScriptedTransport::always_ok(), FakeAnalyzer::default());
        let err = h
            .dispatcher
            .invoke("list_images", &Map::new())
            .expect_err("no catalog on disk");
        assert!(err.to_string().contains("catalog database not found"));
    }
}
