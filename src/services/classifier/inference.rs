use crate::error::AppError;
use crate::services::classifier::{exclusive, ZeroShotModel};
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::Value;
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// CLIP pads label batches with its end-of-text token.
pub const PAD_TOKEN: &str = "<|endoftext|>";
/// Context length of the CLIP text encoder.
pub const MAX_TEXT_TOKENS: usize = 77;
pub const LOGITS_OUTPUT: &str = "logits_per_image";

// CLIP normalization constants
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];
const CLIP_SIZE: u32 = 224;

/// Image side length in a Hugging Face processor config. Appears as a bare
/// integer, as `{"shortest_edge": n}` or as `{"height": h, "width": w}`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ImageSize {
    Square(u32),
    Exact { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
}

impl ImageSize {
    fn crop_dims(&self) -> (u32, u32) {
        match *self {
            ImageSize::Square(n) | ImageSize::ShortestEdge { shortest_edge: n } => (n, n),
            ImageSize::Exact { height, width } => (width, height),
        }
    }
}

/// Subset of `preprocessor_config.json` the image pipeline honours.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default = "default_size")]
    pub size: ImageSize,
    #[serde(default = "default_size")]
    pub crop_size: ImageSize,
    #[serde(default = "default_true")]
    pub do_center_crop: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_std")]
    pub image_std: [f32; 3],
}

fn default_size() -> ImageSize {
    ImageSize::Square(CLIP_SIZE)
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_mean() -> [f32; 3] {
    CLIP_MEAN
}

fn default_std() -> [f32; 3] {
    CLIP_STD
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            size: default_size(),
            crop_size: default_size(),
            do_center_crop: true,
            rescale_factor: default_rescale_factor(),
            image_mean: CLIP_MEAN,
            image_std: CLIP_STD,
        }
    }
}

impl PreprocessConfig {
    pub fn from_json(content: &str) -> Result<Self, AppError> {
        serde_json::from_str(content)
            .map_err(|e| AppError::Internal(format!("Failed to parse preprocessor config: {}", e)))
    }

    /// Height and width of the tensor fed to the vision encoder.
    pub fn output_dims(&self) -> (u32, u32) {
        if self.do_center_crop {
            self.crop_size.crop_dims()
        } else {
            self.size.crop_dims()
        }
    }
}

/// Dimensions after the processor's resize step. The long side is truncated
/// the way the reference CLIP processor computes it.
fn resized_dims(w: u32, h: u32, size: ImageSize) -> (u64, u64) {
    let (w, h) = (w as u64, h as u64);
    let (rw, rh) = match size {
        ImageSize::Square(edge) | ImageSize::ShortestEdge { shortest_edge: edge } => {
            let edge = edge as u64;
            if w < h {
                (edge, edge * h / w)
            } else {
                (edge * w / h, edge)
            }
        }
        ImageSize::Exact { height, width } => (width as u64, height as u64),
    };
    (rw.max(1), rh.max(1))
}

/// Source-pixel window `(x, y, width, height)` that lands in the output tensor
/// after resize and center crop.
fn source_window(w: u32, h: u32, config: &PreprocessConfig) -> (u32, u32, u32, u32) {
    if !config.do_center_crop {
        return (0, 0, w, h);
    }

    let (rw, rh) = resized_dims(w, h, config.size);
    let (out_w, out_h) = config.output_dims();
    let (x, win_w) = map_back(rw, out_w as u64, w);
    let (y, win_h) = map_back(rh, out_h as u64, h);
    (x, y, win_w, win_h)
}

/// Maps a centered span of `crop` pixels on an axis resized to `resized`
/// back onto the `source` axis.
fn map_back(resized: u64, crop: u64, source: u32) -> (u32, u32) {
    let source = source as u64;
    let crop = crop.min(resized);
    let start = (resized - crop) / 2;
    let src_start = (start * source / resized).min(source - 1);
    let src_end = ((start + crop) * source).div_ceil(resized).min(source);
    let len = src_end.saturating_sub(src_start).max(1);
    (src_start as u32, len as u32)
}

pub fn preprocess_image(
    img: &DynamicImage,
    config: &PreprocessConfig,
) -> Result<Array4<f32>, AppError> {
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return Err(AppError::InvalidImage);
    }

    // Cut the crop window out of the source first so memory stays bounded
    // by the decoded image, whatever its aspect ratio.
    let (out_w, out_h) = config.output_dims();
    let (x, y, win_w, win_h) = source_window(w, h, config);
    let cropped = img.crop_imm(x, y, win_w, win_h).resize_exact(
        out_w,
        out_h,
        image::imageops::FilterType::CatmullRom,
    );
    let rgb = cropped.to_rgb8();

    // Pass 1: rescale and normalize pixels in interleaved order
    let raw = rgb.into_raw();
    let hw = (out_w * out_h) as usize;
    let mut interleaved = vec![0f32; 3 * hw];
    for (i, pixel) in raw.chunks_exact(3).enumerate() {
        let off = i * 3;
        for c in 0..3 {
            interleaved[off + c] = (pixel[c] as f32 * config.rescale_factor
                - config.image_mean[c])
                / config.image_std[c];
        }
    }

    // Pass 2: transpose HWC -> CHW in tiles
    let mut data = vec![0f32; 3 * hw];
    const TILE: usize = 1024;
    for base in (0..hw).step_by(TILE) {
        let end = (base + TILE).min(hw);
        for i in base..end {
            let src = i * 3;
            data[i] = interleaved[src];
            data[hw + i] = interleaved[src + 1];
            data[2 * hw + i] = interleaved[src + 2];
        }
    }

    Array4::from_shape_vec((1, 3, out_h as usize, out_w as usize), data)
        .map_err(|e| AppError::Internal(format!("Failed to create image tensor: {}", e)))
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, AppError> {
    let mut tokenizer = Tokenizer::from_file(path).map_err(|e| {
        AppError::Internal(format!(
            "Failed to load tokenizer {}: {}",
            path.display(),
            e
        ))
    })?;

    let pad_id = tokenizer.token_to_id(PAD_TOKEN).unwrap_or(0);
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        pad_id,
        pad_token: PAD_TOKEN.to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: MAX_TEXT_TOKENS,
            ..Default::default()
        }))
        .map_err(|e| AppError::Internal(format!("Failed to configure truncation: {}", e)))?;

    Ok(tokenizer)
}

/// Encodes labels into `(input_ids, attention_mask)`, both `[labels, seq_len]`.
pub fn tokenize_labels(
    tokenizer: &Tokenizer,
    labels: &[&str],
) -> Result<(Array2<i64>, Array2<i64>), AppError> {
    let encodings = tokenizer
        .encode_batch(labels.to_vec(), true)
        .map_err(|e| AppError::Internal(format!("Failed to tokenize labels: {}", e)))?;

    let seq_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);
    let pad_id = tokenizer
        .get_padding()
        .map(|p| p.pad_id)
        .unwrap_or(0) as i64;

    let mut input_ids = Array2::<i64>::from_elem((encodings.len(), seq_len), pad_id);
    let mut attention_mask = Array2::<i64>::zeros((encodings.len(), seq_len));
    for (row, encoding) in encodings.iter().enumerate() {
        for (col, (&id, &mask)) in encoding
            .get_ids()
            .iter()
            .zip(encoding.get_attention_mask())
            .enumerate()
        {
            input_ids[[row, col]] = id as i64;
            attention_mask[[row, col]] = mask as i64;
        }
    }

    Ok((input_ids, attention_mask))
}

/// Runs one forward pass and returns the image-to-text logits.
pub fn run_inference_with_model(
    model: &mut Session,
    input_ids: Array2<i64>,
    attention_mask: Array2<i64>,
    pixel_values: Array4<f32>,
) -> Result<Vec<f32>, AppError> {
    let input_ids = Value::from_array(input_ids)
        .map_err(|e| AppError::Internal(format!("Failed to create input_ids tensor: {}", e)))?;
    let attention_mask = Value::from_array(attention_mask).map_err(|e| {
        AppError::Internal(format!("Failed to create attention_mask tensor: {}", e))
    })?;
    let pixel_values = Value::from_array(pixel_values)
        .map_err(|e| AppError::Internal(format!("Failed to create pixel_values tensor: {}", e)))?;

    let outputs = model
        .run(ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "pixel_values" => pixel_values,
        ])
        .map_err(|e| AppError::Internal(format!("Inference failed: {}", e)))?;

    let logits = outputs
        .get(LOGITS_OUTPUT)
        .ok_or_else(|| AppError::Internal(format!("Model has no {} output", LOGITS_OUTPUT)))?;

    let (_, data) = logits
        .try_extract_tensor::<f32>()
        .map_err(|e| AppError::Internal(format!("Failed to extract output tensor: {}", e)))?;

    Ok(data.to_vec())
}

/// CLIP vision-language model served from an ONNX export.
pub struct ClipModel {
    // ort needs exclusive access for `run`
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    preprocess: PreprocessConfig,
}

impl ClipModel {
    pub fn new(session: Session, tokenizer: Tokenizer, preprocess: PreprocessConfig) -> Self {
        Self {
            session: Mutex::new(session),
            tokenizer,
            preprocess,
        }
    }
}

impl ZeroShotModel for ClipModel {
    fn score(&self, image: &DynamicImage, labels: &[&str]) -> Result<Vec<f32>, AppError> {
        let pixel_values = preprocess_image(image, &self.preprocess)?;
        let (input_ids, attention_mask) = tokenize_labels(&self.tokenizer, labels)?;

        let mut session = exclusive(&self.session);
        run_inference_with_model(&mut session, input_ids, attention_mask, pixel_values)
    }
}
