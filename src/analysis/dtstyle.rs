use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

pub const AUTO_EXPOSURE_STYLE_NAME: &str = "MCP_Auto_Exposure";

// Pass-through blend parameters as exported by darktable 4.x.
const DEFAULT_BLEND_PARAMS: &str = "gz12eJxjYGByaGAAgRNODESDBnsIHll8ANNSGQM=";

/// Writes a single-module `.dtstyle` that applies `exposure_bias` EV through
/// the exposure module (legacy v2 params: black, exposure, gain as three
/// little-endian f32). darktable upgrades the params on import.
pub fn generate_dtstyle(exposure_bias: f64, output_dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    // Concurrent callers may land in the same millisecond.
    let filename = format!(
        "mcp_auto_{}_{}.dtstyle",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    );
    let path = output_dir.join(filename);
    fs::write(path.as_path(), render_dtstyle(exposure_bias))?;
    Ok(path)
}

pub fn render_dtstyle(exposure_bias: f64) -> String {
    let params_hex = exposure_params_hex(exposure_bias as f32);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<darktable_style version="1.0">
  <info>
    <name>{AUTO_EXPOSURE_STYLE_NAME}</name>
    <description>AI Generated Exposure: {exposure_bias:.2} EV</description>
  </info>
  <style>
    <plugin>
      <num>5</num>
      <module>3</module>
      <operation>exposure</operation>
      <op_params>{params_hex}</op_params>
      <enabled>1</enabled>
      <blend_op_params>{DEFAULT_BLEND_PARAMS}</blend_op_params>
      <blend_op_version>4</blend_op_version>
      <test_blend_op_params>{DEFAULT_BLEND_PARAMS}</test_blend_op_params>
    </plugin>
  </style>
</darktable_style>
"#
    )
}

fn exposure_params_hex(exposure: f32) -> String {
    let mut out = String::with_capacity(24);
    for value in [0.0_f32, exposure, 0.0_f32] {
        for byte in value.to_le_bytes() {
            let _ = write!(out, "{byte:02x}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_to_back_styles_keep_their_own_bias() {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("dt_mcp_dtstyle_{stamp}"));
        for _ in 0..50 {
            let first = generate_dtstyle(1.5, dir.as_path()).expect("first style");
            let second = generate_dtstyle(-2.0, dir.as_path()).expect("second style");
            assert_ne!(first, second);
            let first_xml = fs::read_to_string(first.as_path()).expect("first readable");
            let second_xml = fs::read_to_string(second.as_path()).expect("second readable");
            assert!(first_xml.contains("AI Generated Exposure: 1.50 EV"));
            assert!(second_xml.contains("AI Generated Exposure: -2.00 EV"));
        }
    }

    #[test]
    fn params_pack_three_little_endian_floats() {
        // 1.0f32 == 0x3f800000
        assert_eq!(exposure_params_hex(1.0), "000000000000803f00000000");
    }

    #[test]
    fn rendered_style_carries_bias_and_name() {
        let xml = render_dtstyle(-0.5);
        assert!(xml.contains("<name>MCP_Auto_Exposure</name>"));
        assert!(xml.contains("AI Generated Exposure: -0.50 EV"));
        assert!(xml.contains("<op_params>00000000000000bf00000000</op_params>"));
    }
}
