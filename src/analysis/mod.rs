pub mod dtstyle;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use thiserror::Error;
use tracing::warn;

use crate::runner::{CommandRunner, CommandSpec, RunnerError, StdCommandRunner};

pub const AUTOTAG: &str = "Autotagged";
const LOW_LIGHT_THRESHOLD: f64 = 40.0;
const HIGH_KEY_THRESHOLD: f64 = 200.0;
const EXPOSURE_TARGET: f64 = 0.45;
const EXPOSURE_LIMIT_EV: f64 = 3.0;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to decode '{path}': {message}")]
    Decode { path: PathBuf, message: String },
    #[error("failed to write '{path}': {message}")]
    Write { path: PathBuf, message: String },
    #[error("Interactive editor not configured")]
    EditorUnavailable,
    #[error("Edit cancelled")]
    Cancelled,
    #[error("Editor failed: {0}")]
    EditorFailed(String),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    pub path: PathBuf,
    pub status: String,
}

/// Image heuristics consumed by the selection tools. Every method reports
/// failure through its `Result`; callers turn that into a per-item line.
pub trait ImageAnalyzer: Send + Sync + 'static {
    fn sharpness(&self, path: &Path) -> Result<f64, AnalysisError>;
    fn classify(&self, path: &Path) -> Result<Vec<String>, AnalysisError>;
    fn generate_mask(&self, path: &Path) -> Result<ProducedFile, AnalysisError>;
    fn analyze_exposure(&self, path: &Path) -> Result<f64, AnalysisError>;
    /// Blocks until the user finishes or abandons the edit.
    fn inpaint(&self, path: &Path) -> Result<ProducedFile, AnalysisError>;
}

pub type SharedImageAnalyzer = Arc<dyn ImageAnalyzer>;

#[derive(Debug, Clone)]
pub struct NativeImageAnalyzer<R> {
    runner: R,
    editor_command: Option<String>,
}

impl NativeImageAnalyzer<StdCommandRunner> {
    pub fn with_editor(editor_command: Option<String>) -> Self {
        Self::new(StdCommandRunner, editor_command)
    }
}

impl<R> NativeImageAnalyzer<R>
where
    R: CommandRunner,
{
    pub fn new(runner: R, editor_command: Option<String>) -> Self {
        Self {
            runner,
            editor_command,
        }
    }
}

impl<R> ImageAnalyzer for NativeImageAnalyzer<R>
where
    R: CommandRunner,
{
    fn sharpness(&self, path: &Path) -> Result<f64, AnalysisError> {
        if !path.exists() {
            return Ok(0.0);
        }
        match image::open(path) {
            Ok(img) => Ok(laplacian_variance(&img.to_luma8())),
            Err(err) => {
                // Detailed images tend to compress worse; the byte size is a
                // usable ranking signal when the codec is unsupported.
                warn!(path = %path.display(), error = %err, "sharpness falls back to file size");
                Ok(fs::metadata(path).map(|m| m.len() as f64).unwrap_or(0.0))
            }
        }
    }

    fn classify(&self, path: &Path) -> Result<Vec<String>, AnalysisError> {
        let mut tags = vec![String::from(AUTOTAG)];
        if !path.exists() {
            return Ok(tags);
        }
        let img = match image::open(path) {
            Ok(img) => img,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "classification skipped undecodable image");
                return Ok(tags);
            }
        };
        let brightness = mean_value_channel(&img);
        if brightness < LOW_LIGHT_THRESHOLD {
            tags.push(String::from("Low Light"));
        }
        if brightness > HIGH_KEY_THRESHOLD {
            tags.push(String::from("High Key"));
        }
        let (width, height) = img.dimensions();
        tags.push(String::from(orientation_tag(width, height)));
        Ok(tags)
    }

    fn generate_mask(&self, path: &Path) -> Result<ProducedFile, AnalysisError> {
        if !path.exists() {
            return Err(AnalysisError::NotFound(path.to_path_buf()));
        }
        let img = open_image(path)?;
        let (width, height) = img.dimensions();
        let mask = center_circle_mask(width, height);
        let mask_path = sibling_with_suffix(path, "_mask", "png");
        mask.save(mask_path.as_path())
            .map_err(|e| AnalysisError::Write {
                path: mask_path.clone(),
                message: e.to_string(),
            })?;
        Ok(ProducedFile {
            path: mask_path,
            status: String::from("Mask generated (Fallback: Center Circle)"),
        })
    }

    fn analyze_exposure(&self, path: &Path) -> Result<f64, AnalysisError> {
        if !path.exists() {
            return Ok(0.0);
        }
        let gray = open_image(path)?.to_luma8();
        let count = u64::from(gray.width()) * u64::from(gray.height());
        if count == 0 {
            return Ok(0.0);
        }
        let sum = gray.pixels().map(|p| f64::from(p.0[0])).sum::<f64>();
        Ok(exposure_bias(sum / count as f64 / 255.0))
    }

    fn inpaint(&self, path: &Path) -> Result<ProducedFile, AnalysisError> {
        let Some(editor) = self.editor_command.as_deref() else {
            return Err(AnalysisError::EditorUnavailable);
        };
        if !path.exists() {
            return Err(AnalysisError::NotFound(path.to_path_buf()));
        }
        let mut parts = editor.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(AnalysisError::EditorUnavailable)?;
        let out_path = sibling_with_suffix(path, "_inpainted", "jpg");
        let mut args = parts.collect::<Vec<_>>();
        args.push(path.to_string_lossy().to_string());
        args.push(out_path.to_string_lossy().to_string());

        let mut spec = CommandSpec::new(program, args);
        if let Some(parent) = path.parent() {
            spec = spec.in_dir(parent);
        }
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(AnalysisError::EditorFailed(output.stderr.trim().to_string()));
        }
        if !out_path.is_file() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(ProducedFile {
            path: out_path,
            status: String::from("Inpainting successful"),
        })
    }
}

fn open_image(path: &Path) -> Result<DynamicImage, AnalysisError> {
    image::open(path).map_err(|e| AnalysisError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Variance of the 4-neighbour Laplacian; higher means more in-focus detail.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }
    let at = |x: u32, y: u32| f64::from(gray.get_pixel(x, y).0[0]);
    let mut sum = 0.0_f64;
    let mut sum_sq = 0.0_f64;
    let mut count = 0_u64;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }
    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean).max(0.0)
}

/// Mean of the HSV value channel (max of R, G, B) on a 0-255 scale.
fn mean_value_channel(img: &DynamicImage) -> f64 {
    let rgb = img.to_rgb8();
    let mut total = 0.0_f64;
    let mut count = 0_u64;
    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        total += f64::from(r.max(g).max(b));
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

pub fn orientation_tag(width: u32, height: u32) -> &'static str {
    match width.cmp(&height) {
        std::cmp::Ordering::Greater => "Landscape",
        std::cmp::Ordering::Less => "Portrait",
        std::cmp::Ordering::Equal => "Square",
    }
}

/// EV shift that maps the mean brightness onto the target, clamped to +-3.
pub fn exposure_bias(mean_brightness: f64) -> f64 {
    let mean = mean_brightness.max(0.001);
    (EXPOSURE_TARGET / mean)
        .log2()
        .clamp(-EXPOSURE_LIMIT_EV, EXPOSURE_LIMIT_EV)
}

fn center_circle_mask(width: u32, height: u32) -> GrayImage {
    let cx = i64::from(width / 2);
    let cy = i64::from(height / 2);
    let radius = i64::from(width.min(height) / 3);
    GrayImage::from_fn(width, height, |x, y| {
        let dx = i64::from(x) - cx;
        let dy = i64::from(y) - cy;
        if dx * dx + dy * dy <= radius * radius {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// `/a/b/photo.jpg` + `_mask`, `png` -> `/a/b/photo_mask.png`.
pub fn sibling_with_suffix(path: &Path, suffix: &str, extension: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| String::from("image"));
    path.with_file_name(format!("{stem}{suffix}.{extension}"))
}
