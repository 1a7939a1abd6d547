mod common;

use std::path::Path;

use common::{reply, test_config, Responder};
use dt_mcp_bridge::bridge::Bridge;
use dt_mcp_bridge::mailbox::{Command, Response};
use image::{GrayImage, Luma};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

fn write_flat(path: &Path, level: u8) {
    GrayImage::from_pixel(32, 32, Luma([level]))
        .save(path)
        .expect("flat image should save");
}

fn write_checkerboard(path: &Path) {
    GrayImage::from_fn(32, 32, |x, y| {
        if (x + y) % 2 == 0 {
            Luma([0])
        } else {
            Luma([255])
        }
    })
    .save(path)
    .expect("checkerboard should save");
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn labels(commands: &[Command]) -> Vec<(i64, String)> {
    let mut labels = commands
        .iter()
        .filter(|c| c.cmd == "set_color_label")
        .map(|c| {
            (
                c.args["img_id"].as_i64().unwrap_or_default(),
                c.args["label"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect::<Vec<_>>();
    labels.sort();
    labels
}

#[test]
fn culling_keeps_first_of_tied_sharpest_images() {
    let bridge = Bridge::from_config(test_config("cull"));
    let roll = bridge.config().config_dir.join("roll");
    std::fs::create_dir_all(roll.as_path()).expect("roll dir");
    write_flat(roll.join("A.png").as_path(), 128);
    write_checkerboard(roll.join("B.png").as_path());
    write_checkerboard(roll.join("C.png").as_path());

    let selection = json!([
        {"id": 1, "path": roll, "filename": "A.png"},
        {"id": 2, "path": roll, "filename": "B.png"},
        {"id": 3, "path": roll, "filename": "C.png"}
    ]);
    let responder = Responder::spawn(bridge.mailbox().layout().clone(), move |command| {
        if command.cmd == "get_selection" {
            return reply(Response::ok(Some(selection.clone())));
        }
        reply(Response::ok(None))
    });

    let report = bridge
        .dispatcher()
        .invoke("auto_cull", &Map::new())
        .expect("cull should succeed");

    assert_eq!(
        labels(responder.commands().as_slice()),
        vec![
            (1, String::from("red")),
            (2, String::from("green")),
            (3, String::from("red"))
        ]
    );
    assert!(report.contains("KEEP B.png"));
    assert!(report.contains("DISCARD C.png"));
    assert!(report.contains("DISCARD A.png"));
}

#[test]
fn invalid_rating_never_reaches_the_mailbox() {
    let bridge = Bridge::from_config(test_config("rating"));
    let responder = Responder::spawn(bridge.mailbox().layout().clone(), |_| {
        reply(Response::ok(Some(json!({"ok": true}))))
    });

    let err = bridge
        .dispatcher()
        .invoke("set_rating", &args(json!({"img_id": 8, "rating": 6})))
        .expect_err("rating 6 should be rejected");
    assert_eq!(err.to_string(), "Rating must be between -1 and 5");
    assert!(responder.commands().is_empty());

    bridge
        .dispatcher()
        .invoke("set_rating", &args(json!({"img_id": 8, "rating": -1})))
        .expect("reject rating should be accepted");
    let commands = responder.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].args["rating"], json!(-1));
}

#[test]
fn failed_selection_query_does_no_per_item_work() {
    let bridge = Bridge::from_config(test_config("selection_error"));
    let responder = Responder::spawn(bridge.mailbox().layout().clone(), |_| {
        reply(Response::error("lighttable not active"))
    });

    let err = bridge
        .dispatcher()
        .invoke("auto_tag", &Map::new())
        .expect_err("selection failure aborts");
    assert!(err.to_string().starts_with("Failed to get selection"));
    let commands = responder
        .commands()
        .into_iter()
        .map(|c| c.cmd)
        .collect::<Vec<_>>();
    assert_eq!(commands, vec![String::from("get_selection")]);
}

#[test]
fn auto_tag_attaches_lighting_and_orientation() {
    let bridge = Bridge::from_config(test_config("auto_tag"));
    let roll = bridge.config().config_dir.join("roll");
    std::fs::create_dir_all(roll.as_path()).expect("roll dir");
    write_flat(roll.join("night.png").as_path(), 10);

    let selection = json!([{"id": 4, "path": roll, "filename": "night.png"}]);
    let responder = Responder::spawn(bridge.mailbox().layout().clone(), move |command| {
        if command.cmd == "get_selection" {
            return reply(Response::ok(Some(selection.clone())));
        }
        reply(Response::ok(None))
    });

    bridge
        .dispatcher()
        .invoke("auto_tag", &Map::new())
        .expect("auto tag should succeed");
    let tags = responder
        .commands()
        .into_iter()
        .filter(|c| c.cmd == "attach_tag")
        .map(|c| c.args["tag_name"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        tags,
        vec![
            String::from("Autotagged"),
            String::from("Low Light"),
            String::from("Square")
        ]
    );
}
