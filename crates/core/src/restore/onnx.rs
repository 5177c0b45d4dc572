//! ONNX-backed restorer: decode → tiled super-resolution → resize → encode.
//!
//! The model is a Real-ESRGAN-style network taking `[1, 3, H, W]` RGB in
//! `0..1` and producing `[1, 3, H*s, W*s]`. The scale `s` is read off the
//! first tile's output. Scale 1 requests are served by resizing the enhanced
//! image back down to the source size.
//!
//! There is no separate face-restoration pass. Both the upscale and the
//! restore action run the same super-resolution network and differ only in
//! the output size.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use half::f16;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::{s, Array4, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info, warn};

use super::backend::{build_session, InferenceBackend};
use super::{Restorer, ScaleFactor};
use crate::config::RestoreConfig;

/// Spatial dimensions fed to the model are padded to multiples of this.
const PAD_ALIGN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxRestorerConfig {
    pub model_path: PathBuf,
    pub backend: InferenceBackend,
    /// 0 disables tiling.
    pub tile_size: usize,
    pub tile_pad: usize,
}

impl OnnxRestorerConfig {
    pub fn from_restore_config(config: &RestoreConfig, model_path: PathBuf) -> Self {
        Self {
            model_path,
            backend: InferenceBackend::from_str_lossy(&config.backend),
            tile_size: config.tile_size as usize,
            tile_pad: config.tile_pad as usize,
        }
    }
}

struct LoadedModel {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

/// Super-resolution restorer. "Restore" (scale 1) is the x2 network output
/// downsized to the source dimensions, not a GFPGAN face pass.
pub struct OnnxRestorer {
    config: OnnxRestorerConfig,
    model: Mutex<Option<LoadedModel>>,
}

impl OnnxRestorer {
    /// The session is created on first use so a missing model only fails jobs.
    pub fn new(config: OnnxRestorerConfig) -> Self {
        Self {
            config,
            model: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OnnxRestorerConfig {
        &self.config
    }

    /// A panic during inference poisons the lock; drop the session so the
    /// next call loads a fresh one.
    fn lock_model(&self) -> MutexGuard<'_, Option<LoadedModel>> {
        self.model.lock().unwrap_or_else(|poisoned| {
            warn!("Restoration model lock poisoned by an earlier panic; reloading session");
            let mut guard = poisoned.into_inner();
            *guard = None;
            self.model.clear_poison();
            guard
        })
    }

    fn load_model(&self) -> Result<LoadedModel> {
        let model_path = &self.config.model_path;
        if !model_path.is_file() {
            bail!("restoration model not found: {}", model_path.display());
        }

        let session = build_session(model_path, &self.config.backend)?;

        let input = session.inputs().first().context("model declares no inputs")?;
        let output = session.outputs().first().context("model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        info!(
            model = %model_path.display(),
            %input_name,
            %output_name,
            is_fp16,
            "Restoration model loaded"
        );

        Ok(LoadedModel {
            session,
            input_name,
            output_name,
            is_fp16,
        })
    }
}

impl Restorer for OnnxRestorer {
    fn restore(&self, image: &[u8], scale: ScaleFactor) -> Result<Vec<u8>> {
        let mut guard = self.lock_model();
        if guard.is_none() {
            *guard = Some(self.load_model()?);
        }
        let model = guard.as_mut().context("restoration model not loaded")?;

        restore_image(
            image,
            scale,
            self.config.tile_size,
            self.config.tile_pad,
            |tile| infer_tile(model, tile),
        )
    }
}

fn infer_tile(model: &mut LoadedModel, tile: Array4<f32>) -> Result<Array4<f32>> {
    let output = if model.is_fp16 {
        let input_tensor = Tensor::from_array(tile.mapv(f16::from_f32))?;
        let outputs = model
            .session
            .run(ort::inputs![model.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[model.output_name.as_str()].try_extract_array::<f16>()?;
        output_view.mapv(f16::to_f32)
    } else {
        let input_tensor = Tensor::from_array(tile)?;
        let outputs = model
            .session
            .run(ort::inputs![model.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[model.output_name.as_str()].try_extract_array::<f32>()?;
        output_view.to_owned()
    };

    Ok(output.into_dimensionality::<Ix4>()?)
}

/// Full pipeline with the model call abstracted as `infer`.
pub(crate) fn restore_image<F>(
    bytes: &[u8],
    scale: ScaleFactor,
    tile_size: usize,
    tile_pad: usize,
    infer: F,
) -> Result<Vec<u8>>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>>,
{
    let format = image::guess_format(bytes).context("unrecognized image format")?;
    let source = image::load_from_memory_with_format(bytes, format)
        .with_context(|| format!("failed to decode {format:?} image"))?;
    let rgb = source.to_rgb8();
    let (width, height) = rgb.dimensions();

    debug!(
        width,
        height,
        ?format,
        scale = scale.factor(),
        "Restoring image"
    );

    let enhanced = nchw_to_rgb(&run_tiled(&rgb_to_nchw(&rgb), tile_size, tile_pad, infer)?)?;

    let target = (width * scale.factor(), height * scale.factor());
    let output = if enhanced.dimensions() == target {
        enhanced
    } else {
        imageops::resize(&enhanced, target.0, target.1, FilterType::Lanczos3)
    };

    encode(output, format)
}

fn encode(image: RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buf, format)
        .with_context(|| format!("failed to encode restored image as {format:?}"))?;
    Ok(buf.into_inner())
}

fn rgb_to_nchw(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut nchw = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            nchw[[0, c, y as usize, x as usize]] = f32::from(pixel[c]) / 255.0;
        }
    }
    nchw
}

fn nchw_to_rgb(nchw: &Array4<f32>) -> Result<RgbImage> {
    let shape = nchw.shape();
    if shape[0] != 1 || shape[1] != 3 {
        bail!("expected model output of shape [1, 3, H, W], got {shape:?}");
    }
    let (height, width) = (shape[2], shape[3]);
    let mut image = RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        for c in 0..3 {
            let value = nchw[[0, c, y as usize, x as usize]];
            pixel[c] = (value * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(image)
}

/// Replicate the last row/column until both dimensions are multiples of `align`.
fn pad_to_multiple(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    let new_h = h.div_ceil(align) * align;
    let new_w = w.div_ceil(align) * align;
    if new_h == h && new_w == w {
        return arr.clone();
    }

    let mut padded = Array4::<f32>::zeros((arr.shape()[0], arr.shape()[1], new_h, new_w));
    padded.slice_mut(s![.., .., ..h, ..w]).assign(arr);

    for y in h..new_h {
        let last_row = padded.slice(s![.., .., h - 1..h, ..w]).to_owned();
        padded.slice_mut(s![.., .., y..y + 1, ..w]).assign(&last_row);
    }
    for x in w..new_w {
        let last_col = padded.slice(s![.., .., .., w - 1..w]).to_owned();
        padded.slice_mut(s![.., .., .., x..x + 1]).assign(&last_col);
    }

    padded
}

/// Run `infer` over `tile_size` tiles, each extended by `tile_pad` context
/// pixels that are cropped away from the output.
fn run_tiled<F>(
    input: &Array4<f32>,
    tile_size: usize,
    tile_pad: usize,
    mut infer: F,
) -> Result<Array4<f32>>
where
    F: FnMut(Array4<f32>) -> Result<Array4<f32>>,
{
    let (h, w) = (input.shape()[2], input.shape()[3]);
    if h == 0 || w == 0 {
        bail!("cannot restore an empty image");
    }
    let tile = if tile_size == 0 { h.max(w) } else { tile_size };

    let mut output: Option<Array4<f32>> = None;
    let mut scale = 0usize;

    for y0 in (0..h).step_by(tile) {
        let y1 = (y0 + tile).min(h);
        for x0 in (0..w).step_by(tile) {
            let x1 = (x0 + tile).min(w);

            let in_y0 = y0.saturating_sub(tile_pad);
            let in_x0 = x0.saturating_sub(tile_pad);
            let in_y1 = (y1 + tile_pad).min(h);
            let in_x1 = (x1 + tile_pad).min(w);

            let region = input
                .slice(s![.., .., in_y0..in_y1, in_x0..in_x1])
                .to_owned();
            let padded = pad_to_multiple(&region, PAD_ALIGN);
            let (padded_h, padded_w) = (padded.shape()[2], padded.shape()[3]);

            let result = infer(padded)?;
            let out_shape = result.shape();
            let tile_scale = out_shape[2] / padded_h;
            if out_shape[1] != 3 || tile_scale == 0 || out_shape[2] != padded_h * tile_scale
                || out_shape[3] != padded_w * tile_scale
            {
                bail!(
                    "model output {:?} is not an integer upscale of input [1, 3, {padded_h}, {padded_w}]",
                    out_shape
                );
            }

            if scale == 0 {
                scale = tile_scale;
                output = Some(Array4::<f32>::zeros((1, 3, h * scale, w * scale)));
            } else if tile_scale != scale {
                bail!("model scale changed between tiles ({scale} vs {tile_scale})");
            }

            let crop_y0 = (y0 - in_y0) * scale;
            let crop_x0 = (x0 - in_x0) * scale;
            let out_h = (y1 - y0) * scale;
            let out_w = (x1 - x0) * scale;

            if let Some(output) = output.as_mut() {
                output
                    .slice_mut(s![.., .., y0 * scale..y1 * scale, x0 * scale..x1 * scale])
                    .assign(&result.slice(s![
                        ..,
                        ..,
                        crop_y0..crop_y0 + out_h,
                        crop_x0..crop_x0 + out_w
                    ]));
            }
        }
    }

    output.context("no tiles were processed")
}
