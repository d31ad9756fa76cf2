use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array2;

use crate::error::{invalid_config, shape_mismatch, Result};

/// Label of a background point.
pub const BACKGROUND_LABEL: i64 = 0;
/// Label of a foreground point.
pub const FOREGROUND_LABEL: i64 = 1;
/// Label of a padding point, encoded as "not a point".
pub const PADDING_LABEL: i64 = -1;

/// A single user prompt in input-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prompt {
    Point(f32, f32, i64),    // (x, y, label)
    Box(f32, f32, f32, f32), // (x1, y1, x2, y2)
}

/// Batch of prompt tensors fed to [`PromptEncoder::forward`].
///
/// - `points`: `(batch, num_points, 2)` f32
/// - `labels`: `(batch, num_points)`, any numeric dtype able to hold -1
/// - `boxes`: `(batch, num_boxes, 2, 2)` f32
/// - `masks`: `(batch, num_masks, H, W, 1)` f32, zero-sized when absent
///
/// [`PromptEncoder::forward`]: crate::PromptEncoder::forward
#[derive(Debug, Clone)]
pub struct Prompts {
    pub points: Tensor,
    pub labels: Tensor,
    pub boxes: Tensor,
    pub masks: Tensor,
}

impl Prompts {
    pub fn new(points: Tensor, labels: Tensor, boxes: Tensor, masks: Tensor) -> Self {
        Self {
            points,
            labels,
            boxes,
            masks,
        }
    }

    /// A batch without any point, box or mask.
    pub fn empty(batch: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            points: Tensor::zeros((batch, 0, 2), DType::F32, device)?,
            labels: Tensor::zeros((batch, 0), DType::I64, device)?,
            boxes: Tensor::zeros((batch, 0, 2, 2), DType::F32, device)?,
            masks: Tensor::zeros((batch, 0, 1, 1, 1), DType::F32, device)?,
        })
    }

    /// Builds a batch of one from a list of prompts, keeping their order
    /// within each kind. Box corners are passed through as given, even when
    /// the first corner is not the top-left one.
    pub fn from_prompts(prompts: &[Prompt], device: &Device) -> Result<Self> {
        let mut coords = Vec::<f32>::new();
        let mut labels = Vec::<i64>::new();
        let mut boxes = Vec::<f32>::new();

        for prompt in prompts {
            match *prompt {
                Prompt::Point(x, y, label) => {
                    coords.extend([x, y]);
                    labels.push(label);
                }
                Prompt::Box(x1, y1, x2, y2) => boxes.extend([x1, y1, x2, y2]),
            }
        }

        let num_points = labels.len();
        let num_boxes = boxes.len() / 4;
        Ok(Self {
            points: Tensor::from_vec(coords, (1, num_points, 2), device)?,
            labels: Tensor::from_vec(labels, (1, num_points), device)?,
            boxes: Tensor::from_vec(boxes, (1, num_boxes, 2, 2), device)?,
            masks: Tensor::zeros((1, 0, 1, 1, 1), DType::F32, device)?,
        })
    }

    pub fn with_masks(mut self, masks: Tensor) -> Self {
        self.masks = masks;
        self
    }

    /// Appends one padding point at the origin to every batch element.
    ///
    /// Checkpoints trained with a trailing padding point when no box is
    /// given expect this.
    pub fn pad_points(mut self) -> Result<Self> {
        let (b, _, _) = self.points.dims3()?;
        let device = self.points.device().clone();
        let padding_point = Tensor::zeros((b, 1, 2), self.points.dtype(), &device)?;
        let padding_label =
            Tensor::full(PADDING_LABEL, (b, 1), &device)?.to_dtype(self.labels.dtype())?;
        self.points = Tensor::cat(&[&self.points, &padding_point], 1)?;
        self.labels = Tensor::cat(&[&self.labels, &padding_label], 1)?;
        Ok(self)
    }

    pub fn num_points(&self) -> usize {
        self.points.dims().get(1).copied().unwrap_or(0)
    }

    pub fn num_boxes(&self) -> usize {
        self.boxes.dims().get(1).copied().unwrap_or(0)
    }

    pub fn has_masks(&self) -> bool {
        self.masks.elem_count() > 0
    }

    /// Turns a grayscale mask image into a `(1, 1, size.0, size.1, 1)` mask
    /// prompt with values in `[0, 1]`.
    pub fn mask_from_image(image: &DynamicImage, size: (usize, usize), device: &Device) -> Result<Tensor> {
        let (h, w) = size;
        if h == 0 || w == 0 {
            return Err(invalid_config(format!(
                "mask size must be non-zero, got {h}x{w}"
            )));
        }
        let resized = image.resize_exact(w as u32, h as u32, FilterType::Triangle);
        let luma = resized.to_luma8();
        let (width, height) = luma.dimensions();

        let mut array = Array2::<f32>::zeros((height as usize, width as usize));
        for (x, y, pixel) in luma.enumerate_pixels() {
            array[[y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        }
        if array.dim() != (h, w) {
            return Err(shape_mismatch(format!(
                "resized mask is {:?}, expected {h}x{w}",
                array.dim()
            )));
        }

        let data = array.into_iter().collect();
        Ok(Tensor::from_vec(data, (1, 1, h, w, 1), device)?)
    }
}
