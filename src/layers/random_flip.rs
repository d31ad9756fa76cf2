use std::fmt;
use std::str::FromStr;

use candle_core::{Device, IndexOp, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, shape_mismatch, Error, Result};

/// Which axes a [`RandomFlip`] may flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FlipMode {
    /// Left-right flips only.
    #[default]
    Horizontal,
    /// Top-bottom flips only.
    Vertical,
    HorizontalAndVertical,
}

impl FlipMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
            Self::HorizontalAndVertical => "horizontal_and_vertical",
        }
    }

    fn horizontal(&self) -> bool {
        matches!(self, Self::Horizontal | Self::HorizontalAndVertical)
    }

    fn vertical(&self) -> bool {
        matches!(self, Self::Vertical | Self::HorizontalAndVertical)
    }
}

impl fmt::Display for FlipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FlipMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "horizontal" => Ok(Self::Horizontal),
            "vertical" => Ok(Self::Vertical),
            "horizontal_and_vertical" => Ok(Self::HorizontalAndVertical),
            other => Err(invalid_config(format!(
                "RandomFlip received an unknown mode={other}"
            ))),
        }
    }
}

impl TryFrom<String> for FlipMode {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FlipMode> for String {
    fn from(value: FlipMode) -> Self {
        value.name().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomFlipConfig {
    pub mode: FlipMode,
    /// Seed of the flip decisions; `None` seeds from OS entropy.
    pub seed: Option<u64>,
}

/// Flip decision for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlipTransformation {
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

/// Images with their optional segmentation masks and boxes.
///
/// `images` and `segmentation_masks` are `(batch, H, W, C)`; boxes are
/// `(batch, num_boxes, 4)` in `xyxy` pixel coordinates.
#[derive(Debug, Clone)]
pub struct FlipInputs {
    pub images: Tensor,
    pub segmentation_masks: Option<Tensor>,
    pub bounding_boxes: Option<Tensor>,
}

/// Randomly flips images horizontally and/or vertically.
///
/// Each enabled axis is flipped independently per sample when a uniform draw
/// exceeds 0.5.
#[derive(Debug)]
pub struct RandomFlip {
    config: RandomFlipConfig,
    rng: StdRng,
}

impl RandomFlip {
    pub fn new(config: RandomFlipConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Builds the layer from a mode name, failing on unknown modes.
    pub fn from_mode_name(mode: &str, seed: Option<u64>) -> Result<Self> {
        let mode = mode.parse()?;
        Ok(Self::new(RandomFlipConfig { mode, seed }))
    }

    pub fn config(&self) -> &RandomFlipConfig {
        &self.config
    }

    pub fn sample_transformations(&mut self, batch: usize) -> Vec<FlipTransformation> {
        let mode = self.config.mode;
        (0..batch)
            .map(|_| {
                let flip_horizontal = mode.horizontal() && self.rng.gen::<f32>() > 0.5;
                let flip_vertical = mode.vertical() && self.rng.gen::<f32>() > 0.5;
                FlipTransformation {
                    flip_horizontal,
                    flip_vertical,
                }
            })
            .collect()
    }

    /// Flips `(batch, H, W, C)` images, one transformation per sample.
    pub fn augment_images(images: &Tensor, transformations: &[FlipTransformation]) -> Result<Tensor> {
        let (b, h, w, _) = images.dims4().map_err(|_| {
            shape_mismatch(format!(
                "expected images shaped (batch, H, W, C), got {:?}",
                images.dims()
            ))
        })?;
        check_batch(b, transformations)?;
        if b == 0 {
            return Ok(images.clone());
        }

        let device = images.device();
        let rev_w = reversed_indices(w, device)?;
        let rev_h = reversed_indices(h, device)?;
        let flipped = transformations
            .iter()
            .enumerate()
            .map(|(i, t)| -> Result<Tensor> {
                let mut image = images.i(i)?;
                if t.flip_horizontal {
                    image = image.index_select(&rev_w, 1)?;
                }
                if t.flip_vertical {
                    image = image.index_select(&rev_h, 0)?;
                }
                Ok(image)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&flipped, 0)?)
    }

    /// Segmentation masks flip exactly like images.
    pub fn augment_segmentation_masks(
        masks: &Tensor,
        transformations: &[FlipTransformation],
    ) -> Result<Tensor> {
        Self::augment_images(masks, transformations)
    }

    /// Flips `(batch, num_boxes, 4)` `xyxy` boxes inside an image of
    /// `image_size = (H, W)`, clipping the result to the image.
    pub fn augment_boxes(
        boxes: &Tensor,
        image_size: (usize, usize),
        transformations: &[FlipTransformation],
    ) -> Result<Tensor> {
        let (b, _, four) = boxes.dims3().map_err(|_| {
            shape_mismatch(format!(
                "expected boxes shaped (batch, num_boxes, 4), got {:?}",
                boxes.dims()
            ))
        })?;
        if four != 4 {
            return Err(shape_mismatch(format!(
                "boxes must have 4 coordinates, got {four}"
            )));
        }
        check_batch(b, transformations)?;
        if boxes.elem_count() == 0 {
            return Ok(boxes.clone());
        }

        let (h, w) = (image_size.0 as f32, image_size.1 as f32);
        let flipped = transformations
            .iter()
            .enumerate()
            .map(|(i, t)| -> Result<Tensor> {
                let sample = boxes.i(i)?;
                let mut x1 = sample.narrow(D::Minus1, 0, 1)?;
                let mut y1 = sample.narrow(D::Minus1, 1, 1)?;
                let mut x2 = sample.narrow(D::Minus1, 2, 1)?;
                let mut y2 = sample.narrow(D::Minus1, 3, 1)?;
                if t.flip_horizontal {
                    (x1, x2) = (x2.affine(-1., w as f64)?, x1.affine(-1., w as f64)?);
                }
                if t.flip_vertical {
                    (y1, y2) = (y2.affine(-1., h as f64)?, y1.affine(-1., h as f64)?);
                }
                let x1 = x1.clamp(0f32, w)?;
                let x2 = x2.clamp(0f32, w)?;
                let y1 = y1.clamp(0f32, h)?;
                let y2 = y2.clamp(0f32, h)?;
                Ok(Tensor::cat(&[x1, y1, x2, y2], D::Minus1)?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&flipped, 0)?)
    }

    /// Samples one transformation per batch element and applies it to the
    /// images, masks and boxes alike.
    pub fn forward(&mut self, inputs: FlipInputs) -> Result<FlipInputs> {
        let (b, h, w, _) = inputs.images.dims4().map_err(|_| {
            shape_mismatch(format!(
                "expected images shaped (batch, H, W, C), got {:?}",
                inputs.images.dims()
            ))
        })?;
        let transformations = self.sample_transformations(b);
        log::trace!("random flip ({}): {:?}", self.config.mode, transformations);

        let images = Self::augment_images(&inputs.images, &transformations)?;
        let segmentation_masks = inputs
            .segmentation_masks
            .as_ref()
            .map(|m| Self::augment_segmentation_masks(m, &transformations))
            .transpose()?;
        let bounding_boxes = inputs
            .bounding_boxes
            .as_ref()
            .map(|bx| Self::augment_boxes(bx, (h, w), &transformations))
            .transpose()?;
        Ok(FlipInputs {
            images,
            segmentation_masks,
            bounding_boxes,
        })
    }
}

fn check_batch(batch: usize, transformations: &[FlipTransformation]) -> Result<()> {
    if batch != transformations.len() {
        return Err(shape_mismatch(format!(
            "{} flip transformations for a batch of {batch}",
            transformations.len()
        )));
    }
    Ok(())
}

fn reversed_indices(len: usize, device: &Device) -> Result<Tensor> {
    let indices: Vec<u32> = (0..len as u32).rev().collect();
    Ok(Tensor::from_vec(indices, len, device)?)
}
