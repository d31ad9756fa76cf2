use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, shape_mismatch, Result};
use crate::modeling::position_encoding::PositionEmbeddingRandom;
use crate::modeling::sam::prompts::Prompts;
use crate::modeling::sam_utils::{LayerNorm2d, MaskActivation};

/// Construction-time settings of a [`PromptEncoder`].
///
/// Sizes are `(height, width)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptEncoderConfig {
    pub embed_dim: usize,
    pub image_embedding_size: (usize, usize),
    pub input_image_size: (usize, usize),
    pub mask_in_chans: usize,
    pub activation: MaskActivation,
}

impl Default for PromptEncoderConfig {
    fn default() -> Self {
        Self {
            embed_dim: 256,
            image_embedding_size: (64, 64),
            input_image_size: (1024, 1024),
            mask_in_chans: 16,
            activation: MaskActivation::Gelu,
        }
    }
}

impl PromptEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 || self.embed_dim % 2 != 0 {
            return Err(invalid_config(format!(
                "embed_dim must be a positive even number, got {}",
                self.embed_dim
            )));
        }
        let (eh, ew) = self.image_embedding_size;
        if eh == 0 || ew == 0 {
            return Err(invalid_config(format!(
                "image_embedding_size must be non-zero, got {eh}x{ew}"
            )));
        }
        let (ih, iw) = self.input_image_size;
        if ih == 0 || iw == 0 {
            return Err(invalid_config(format!(
                "input_image_size must be non-zero, got {ih}x{iw}"
            )));
        }
        if self.mask_in_chans == 0 || self.mask_in_chans % 4 != 0 {
            return Err(invalid_config(format!(
                "mask_in_chans must be a positive multiple of 4, got {}",
                self.mask_in_chans
            )));
        }
        Ok(())
    }

    /// Spatial size a mask prompt must have: four times the embedding grid.
    pub fn mask_input_size(&self) -> (usize, usize) {
        (
            4 * self.image_embedding_size.0,
            4 * self.image_embedding_size.1,
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// The three tensors produced for one batch of prompts, all channels-last.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    /// `(batch, num_points + 2 * num_boxes, embed_dim)`
    pub sparse_embeddings: Tensor,
    /// `(batch, h, w, embed_dim)`; `batch * num_masks` rows when masks are given.
    pub dense_embeddings: Tensor,
    /// `(1, h, w, embed_dim)`
    pub dense_positional_embeddings: Tensor,
}

/// Static output shapes; `None` marks a dynamic axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptEmbeddingShapes {
    pub sparse_embeddings: [Option<usize>; 3],
    pub dense_embeddings: [Option<usize>; 4],
    pub dense_positional_embeddings: [Option<usize>; 4],
}

/// Prompt encoder for the Segment Anything Model.
///
/// Points and boxes become "sparse" embeddings: the random-frequency
/// positional encoding of each location plus a learned embedding telling
/// foreground from background points and top-left from bottom-right box
/// corners. A mask prompt is downscaled by a small conv net into "dense"
/// embeddings; without one, a learned "no mask" embedding fills the grid.
#[derive(Debug)]
pub struct PromptEncoder {
    pe_layer: PositionEmbeddingRandom,
    foreground_point_embed: Embedding,
    background_point_embed: Embedding,
    top_left_corner_embed: Embedding,
    bottom_right_corner_embed: Embedding,
    not_a_point_embed: Embedding,
    no_mask_embed: Embedding,
    mask_downscaling_conv1: Conv2d,
    mask_downscaling_ln1: LayerNorm2d,
    mask_downscaling_conv2: Conv2d,
    mask_downscaling_ln2: LayerNorm2d,
    mask_downscaling_conv3: Conv2d,
    config: PromptEncoderConfig,
}

impl PromptEncoder {
    /// Reads every parameter, including the positional basis, from `vb`.
    pub fn new(config: PromptEncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let pe_layer = PositionEmbeddingRandom::new(
            config.embed_dim / 2,
            vb.pp("positional_embedding_layer"),
        )?;
        Self::with_positional_layer(config, pe_layer, vb)
    }

    /// Reads the learned tables and convolutions from `vb` and samples the
    /// frozen positional basis from `seed`.
    pub fn with_seed(config: PromptEncoderConfig, seed: u64, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let pe_layer =
            PositionEmbeddingRandom::from_seed(config.embed_dim / 2, 1.0, seed, vb.device())?
                .to_dtype(vb.dtype())?;
        Self::with_positional_layer(config, pe_layer, vb)
    }

    fn with_positional_layer(
        config: PromptEncoderConfig,
        pe_layer: PositionEmbeddingRandom,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embed_dim = config.embed_dim;
        let mask_in_chans = config.mask_in_chans;

        let foreground_point_embed =
            candle_nn::embedding(1, embed_dim, vb.pp("foreground_point_embed"))?;
        let background_point_embed =
            candle_nn::embedding(1, embed_dim, vb.pp("background_point_embed"))?;
        let top_left_corner_embed =
            candle_nn::embedding(1, embed_dim, vb.pp("top_left_corner_embed"))?;
        let bottom_right_corner_embed =
            candle_nn::embedding(1, embed_dim, vb.pp("bottom_right_corner_embed"))?;
        let not_a_point_embed = candle_nn::embedding(1, embed_dim, vb.pp("not_a_point_embed"))?;
        let no_mask_embed = candle_nn::embedding(1, embed_dim, vb.pp("no_mask_embed"))?;

        let vb_m = vb.pp("mask_downscaler");
        let cfg = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };
        let mask_downscaling_conv1 = candle_nn::conv2d(1, mask_in_chans / 4, 2, cfg, vb_m.pp("0"))?;
        let mask_downscaling_ln1 = LayerNorm2d::new(mask_in_chans / 4, 1e-6, vb_m.pp("1"))?;
        let mask_downscaling_conv2 =
            candle_nn::conv2d(mask_in_chans / 4, mask_in_chans, 2, cfg, vb_m.pp("3"))?;
        let mask_downscaling_ln2 = LayerNorm2d::new(mask_in_chans, 1e-6, vb_m.pp("4"))?;
        let mask_downscaling_conv3 = candle_nn::conv2d(
            mask_in_chans,
            embed_dim,
            1,
            Default::default(),
            vb_m.pp("6"),
        )?;

        log::debug!(
            "prompt encoder: embed_dim={} image_embedding_size={:?} input_image_size={:?} mask_in_chans={} activation={}",
            embed_dim,
            config.image_embedding_size,
            config.input_image_size,
            mask_in_chans,
            config.activation
        );

        Ok(Self {
            pe_layer,
            foreground_point_embed,
            background_point_embed,
            top_left_corner_embed,
            bottom_right_corner_embed,
            not_a_point_embed,
            no_mask_embed,
            mask_downscaling_conv1,
            mask_downscaling_ln1,
            mask_downscaling_conv2,
            mask_downscaling_ln2,
            mask_downscaling_conv3,
            config,
        })
    }

    pub fn config(&self) -> &PromptEncoderConfig {
        &self.config
    }

    pub fn positional_embedding(&self) -> &PositionEmbeddingRandom {
        &self.pe_layer
    }

    pub fn output_shapes(&self) -> PromptEmbeddingShapes {
        let (h, w) = self.config.image_embedding_size;
        let c = self.config.embed_dim;
        PromptEmbeddingShapes {
            sparse_embeddings: [None, None, Some(c)],
            dense_embeddings: [None, Some(h), Some(w), Some(c)],
            dense_positional_embeddings: [None, Some(h), Some(w), Some(c)],
        }
    }

    /// Positional encoding of the image embedding grid, `(1, h, w, embed_dim)`.
    pub fn dense_positional_embeddings(&self) -> Result<Tensor> {
        Ok(self
            .pe_layer
            .encode_image(self.config.image_embedding_size)?
            .unsqueeze(0)?)
    }

    fn embed_points(&self, points: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let points = (points.to_dtype(DType::F32)? + 0.5)?;
        let point_embedding = self
            .pe_layer
            .encode_coordinates(&points, self.config.input_image_size)?;
        if point_embedding.elem_count() == 0 {
            return Ok(point_embedding);
        }

        let labels = labels
            .to_dtype(point_embedding.dtype())?
            .unsqueeze(2)?
            .broadcast_as(point_embedding.shape())?;
        let background =
            point_embedding.broadcast_add(self.background_point_embed.embeddings())?;
        let foreground =
            point_embedding.broadcast_add(self.foreground_point_embed.embeddings())?;
        let point_embedding = labels.eq(0f32)?.where_cond(&background, &foreground)?;

        // Padding points drop their positional encoding entirely.
        let not_a_point = self
            .not_a_point_embed
            .embeddings()
            .broadcast_as(point_embedding.shape())?;
        Ok(labels.eq(-1f32)?.where_cond(&not_a_point, &point_embedding)?)
    }

    fn embed_boxes(&self, boxes: &Tensor) -> Result<Tensor> {
        let (b, n, _, _) = boxes.dims4()?;
        let embed_dim = self.config.embed_dim;
        let boxes = (boxes.to_dtype(DType::F32)? + 0.5)?;
        let corner_embedding = self
            .pe_layer
            .encode_coordinates(&boxes, self.config.input_image_size)?;
        if corner_embedding.elem_count() == 0 {
            return Ok(Tensor::zeros(
                (b, 2 * n, embed_dim),
                corner_embedding.dtype(),
                corner_embedding.device(),
            )?);
        }

        let top_left = corner_embedding
            .i((.., .., 0))?
            .broadcast_add(self.top_left_corner_embed.embeddings())?;
        let bottom_right = corner_embedding
            .i((.., .., 1))?
            .broadcast_add(self.bottom_right_corner_embed.embeddings())?;
        Ok(Tensor::stack(&[top_left, bottom_right], 2)?.reshape((b, 2 * n, embed_dim))?)
    }

    fn embed_masks(&self, masks: &Tensor) -> Result<Tensor> {
        let (b, n, h, w, c) = masks.dims5().map_err(|_| {
            shape_mismatch(format!(
                "masks must be (batch, num_masks, H, W, 1), got {:?}",
                masks.dims()
            ))
        })?;
        if c != 1 {
            return Err(shape_mismatch(format!(
                "mask prompts must have a single channel, got {c}"
            )));
        }
        let expected = self.config.mask_input_size();
        if (h, w) != expected {
            return Err(shape_mismatch(format!(
                "mask prompts must be {}x{}, got {h}x{w}",
                expected.0, expected.1
            )));
        }

        let act = self.config.activation;
        let masks = masks
            .to_dtype(self.no_mask_embed.embeddings().dtype())?
            .reshape((b * n, h, w, 1))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let dense = masks
            .apply(&self.mask_downscaling_conv1)?
            .apply(&self.mask_downscaling_ln1)?
            .apply(&act)?
            .apply(&self.mask_downscaling_conv2)?
            .apply(&self.mask_downscaling_ln2)?
            .apply(&act)?
            .apply(&self.mask_downscaling_conv3)?;
        Ok(dense.permute((0, 2, 3, 1))?)
    }

    fn no_mask_embeddings(&self, batch: usize) -> Result<Tensor> {
        let (h, w) = self.config.image_embedding_size;
        let embed_dim = self.config.embed_dim;
        Ok(self
            .no_mask_embed
            .embeddings()
            .reshape((1, 1, 1, embed_dim))?
            .broadcast_as((batch, h, w, embed_dim))?)
    }

    /// Checks that all four inputs agree on batch size and layout.
    fn batch_size(&self, prompts: &Prompts) -> Result<usize> {
        let (b, num_points, coords) = prompts.points.dims3().map_err(|_| {
            shape_mismatch(format!(
                "points must be (batch, num_points, 2), got {:?}",
                prompts.points.dims()
            ))
        })?;
        if coords != 2 {
            return Err(shape_mismatch(format!(
                "points must carry (x, y) pairs, got {coords} values per point"
            )));
        }
        let (label_b, num_labels) = prompts.labels.dims2().map_err(|_| {
            shape_mismatch(format!(
                "labels must be (batch, num_points), got {:?}",
                prompts.labels.dims()
            ))
        })?;
        if (label_b, num_labels) != (b, num_points) {
            return Err(shape_mismatch(format!(
                "labels {:?} do not match points {:?}",
                prompts.labels.dims(),
                prompts.points.dims()
            )));
        }
        match prompts.boxes.dims() {
            &[box_b, _, 2, 2] if box_b == b => {}
            dims => {
                return Err(shape_mismatch(format!(
                    "boxes must be ({b}, num_boxes, 2, 2), got {dims:?}"
                )))
            }
        }
        if prompts.masks.elem_count() > 0 {
            let mask_b = prompts.masks.dims().first().copied().unwrap_or(0);
            if mask_b != b {
                return Err(shape_mismatch(format!(
                    "masks batch {mask_b} does not match points batch {b}"
                )));
            }
        }
        Ok(b)
    }

    pub fn forward(&self, prompts: &Prompts) -> Result<PromptEmbeddings> {
        let batch = self.batch_size(prompts)?;

        let point_embeddings = self.embed_points(&prompts.points, &prompts.labels)?;
        let box_embeddings = self.embed_boxes(&prompts.boxes)?;
        let sparse_embeddings = self.concat_sparse(batch, &[point_embeddings, box_embeddings])?;

        let dense_embeddings = if prompts.masks.elem_count() == 0 {
            log::trace!("no mask prompt, using no_mask_embed");
            self.no_mask_embeddings(batch)?
        } else {
            log::trace!("embedding mask prompt {:?}", prompts.masks.dims());
            self.embed_masks(&prompts.masks)?
        };

        let dense_positional_embeddings = self.dense_positional_embeddings()?;

        Ok(PromptEmbeddings {
            sparse_embeddings,
            dense_embeddings,
            dense_positional_embeddings,
        })
    }

    fn concat_sparse(&self, batch: usize, segments: &[Tensor]) -> Result<Tensor> {
        let segments: Vec<&Tensor> = segments.iter().filter(|s| s.dim(1).unwrap_or(0) > 0).collect();
        match segments.as_slice() {
            [] => {
                let dtype = self.no_mask_embed.embeddings().dtype();
                let dev = self.no_mask_embed.embeddings().device();
                Ok(Tensor::zeros((batch, 0, self.config.embed_dim), dtype, dev)?)
            }
            [single] => Ok((*single).clone()),
            many => Ok(Tensor::cat(many, 1)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn encoder(config: PromptEncoderConfig) -> (VarMap, PromptEncoder) {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let encoder = PromptEncoder::with_seed(config, 42, vb).unwrap();
        (varmap, encoder)
    }

    fn small_config() -> PromptEncoderConfig {
        PromptEncoderConfig {
            embed_dim: 4,
            image_embedding_size: (4, 4),
            input_image_size: (100, 100),
            mask_in_chans: 8,
            activation: MaskActivation::Gelu,
        }
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        assert_eq!(a.dims(), b.dims());
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < 1e-5, "index {i}: {x} != {y}");
        }
    }

    fn prompts(points: Tensor, labels: Tensor, boxes: Tensor) -> Prompts {
        let b = points.dim(0).unwrap();
        let masks = Tensor::zeros((b, 0, 16, 16, 1), DType::F32, &Device::Cpu).unwrap();
        Prompts::new(points, labels, boxes, masks)
    }

    fn no_boxes(b: usize) -> Tensor {
        Tensor::zeros((b, 0, 2, 2), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn foreground_point_adds_foreground_embedding() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let points = Tensor::new(&[[[10f32, 20.]]], &dev).unwrap();
        let labels = Tensor::new(&[[1i64]], &dev).unwrap();
        let out = enc.forward(&prompts(points, labels, no_boxes(1))).unwrap();

        let expected_pe = enc
            .pe_layer
            .encode_coordinates(&Tensor::new(&[[[10.5f32, 20.5]]], &dev).unwrap(), (100, 100))
            .unwrap();
        let expected = expected_pe
            .broadcast_add(enc.foreground_point_embed.embeddings())
            .unwrap();
        assert_eq!(out.sparse_embeddings.dims(), &[1, 1, 4]);
        assert_close(&out.sparse_embeddings, &expected);
    }

    #[test]
    fn background_and_other_labels() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let points = Tensor::new(&[[[1f32, 2.], [30., 40.]]], &dev).unwrap();
        let labels = Tensor::new(&[[0i64, 2]], &dev).unwrap();
        let out = enc.forward(&prompts(points.clone(), labels, no_boxes(1))).unwrap();

        let pe = enc
            .pe_layer
            .encode_coordinates(&(points + 0.5).unwrap(), (100, 100))
            .unwrap();
        let bg = pe
            .i((.., 0..1))
            .unwrap()
            .broadcast_add(enc.background_point_embed.embeddings())
            .unwrap();
        let fg = pe
            .i((.., 1..2))
            .unwrap()
            .broadcast_add(enc.foreground_point_embed.embeddings())
            .unwrap();
        assert_close(&out.sparse_embeddings.i((.., 0..1)).unwrap(), &bg);
        assert_close(&out.sparse_embeddings.i((.., 1..2)).unwrap(), &fg);
    }

    #[test]
    fn padding_label_is_exactly_not_a_point() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let points = Tensor::new(&[[[13f32, 77.], [0., 0.]], [[99., 1.], [50., 50.]]], &dev).unwrap();
        let labels = Tensor::new(&[[-1i64, 1], [0, -1]], &dev).unwrap();
        let out = enc.forward(&prompts(points, labels, no_boxes(2))).unwrap();

        let nap = enc
            .not_a_point_embed
            .embeddings()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (b, p) in [(0usize, 0usize), (1, 1)] {
            let got = out.sparse_embeddings.i((b, p)).unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(got, nap);
        }
    }

    #[test]
    fn boxes_contribute_two_corner_entries() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let points = Tensor::zeros((1, 0, 2), DType::F32, &dev).unwrap();
        let labels = Tensor::zeros((1, 0), DType::I64, &dev).unwrap();
        let boxes = Tensor::from_vec(
            vec![5f32, 6., 50., 60., 0., 0., 99., 99.],
            (1, 2, 2, 2),
            &dev,
        )
        .unwrap();
        let out = enc.forward(&prompts(points, labels, boxes)).unwrap();
        assert_eq!(out.sparse_embeddings.dims(), &[1, 4, 4]);

        let tl = enc
            .pe_layer
            .encode_coordinates(&Tensor::new(&[[5.5f32, 6.5]], &dev).unwrap(), (100, 100))
            .unwrap()
            .broadcast_add(enc.top_left_corner_embed.embeddings())
            .unwrap();
        let br = enc
            .pe_layer
            .encode_coordinates(&Tensor::new(&[[50.5f32, 60.5]], &dev).unwrap(), (100, 100))
            .unwrap()
            .broadcast_add(enc.bottom_right_corner_embed.embeddings())
            .unwrap();
        assert_close(&out.sparse_embeddings.i((0, 0..1)).unwrap(), &tl);
        assert_close(&out.sparse_embeddings.i((0, 1..2)).unwrap(), &br);
    }

    #[test]
    fn points_come_before_boxes() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let points = Tensor::new(&[[[1f32, 1.], [2., 2.], [3., 3.]]], &dev).unwrap();
        let labels = Tensor::new(&[[1i64, 0, 1]], &dev).unwrap();
        let boxes = Tensor::from_vec(vec![5f32, 6., 50., 60.], (1, 1, 2, 2), &dev).unwrap();
        let with_boxes = enc
            .forward(&prompts(points.clone(), labels.clone(), boxes))
            .unwrap();
        let points_only = enc.forward(&prompts(points, labels, no_boxes(1))).unwrap();
        assert_eq!(with_boxes.sparse_embeddings.dims(), &[1, 5, 4]);
        assert_close(
            &with_boxes.sparse_embeddings.i((.., 0..3)).unwrap(),
            &points_only.sparse_embeddings,
        );
    }

    #[test]
    fn no_prompts_gives_empty_sequence() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let out = enc.forward(&Prompts::empty(3, &dev).unwrap()).unwrap();
        assert_eq!(out.sparse_embeddings.dims(), &[3, 0, 4]);
        assert_eq!(out.dense_embeddings.dims(), &[3, 4, 4, 4]);
        assert_eq!(out.dense_positional_embeddings.dims(), &[1, 4, 4, 4]);
    }

    #[test]
    fn empty_mask_broadcasts_no_mask_embedding() {
        let (_vm, enc) = encoder(small_config());
        let out = enc.forward(&Prompts::empty(2, &Device::Cpu).unwrap()).unwrap();
        let expected = enc
            .no_mask_embed
            .embeddings()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for b in 0..2 {
            for y in 0..4 {
                for x in 0..4 {
                    let cell = out
                        .dense_embeddings
                        .i((b, y, x))
                        .unwrap()
                        .to_vec1::<f32>()
                        .unwrap();
                    assert_eq!(cell, expected);
                }
            }
        }
    }

    #[test]
    fn mask_is_downscaled_to_embedding_grid() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let masks = Tensor::rand(0f32, 1., (2, 1, 16, 16, 1), &dev).unwrap();
        let out = enc
            .forward(&Prompts::empty(2, &dev).unwrap().with_masks(masks))
            .unwrap();
        assert_eq!(out.dense_embeddings.dims(), &[2, 4, 4, 4]);

        let multi = Tensor::rand(0f32, 1., (2, 3, 16, 16, 1), &dev).unwrap();
        let out = enc
            .forward(&Prompts::empty(2, &dev).unwrap().with_masks(multi))
            .unwrap();
        assert_eq!(out.dense_embeddings.dims(), &[6, 4, 4, 4]);
    }

    #[test]
    fn mask_of_wrong_size_is_rejected() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let masks = Tensor::ones((1, 1, 12, 16, 1), DType::F32, &dev).unwrap();
        let res = enc.forward(&Prompts::empty(1, &dev).unwrap().with_masks(masks));
        assert!(matches!(res, Err(crate::Error::ShapeMismatch(_))));
    }

    #[test]
    fn mask_without_mask_axis_is_rejected() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let masks = Tensor::ones((1, 16, 16, 1), DType::F32, &dev).unwrap();
        let res = enc.forward(&Prompts::empty(1, &dev).unwrap().with_masks(masks));
        assert!(matches!(res, Err(crate::Error::ShapeMismatch(_))));
    }

    #[test]
    fn mask_with_several_channels_is_rejected() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let masks = Tensor::ones((1, 1, 16, 16, 2), DType::F32, &dev).unwrap();
        let res = enc.forward(&Prompts::empty(1, &dev).unwrap().with_masks(masks));
        assert!(matches!(res, Err(crate::Error::ShapeMismatch(_))));
    }

    #[test]
    fn multi_mask_rows_follow_batch_then_mask_order() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let masks = Tensor::rand(0f32, 1., (2, 3, 16, 16, 1), &dev).unwrap();
        let out = enc
            .forward(&Prompts::empty(2, &dev).unwrap().with_masks(masks.clone()))
            .unwrap();
        for b in 0..2 {
            for n in 0..3 {
                let single = masks.i((b..b + 1, n..n + 1)).unwrap().contiguous().unwrap();
                let reference = enc
                    .forward(&Prompts::empty(1, &dev).unwrap().with_masks(single))
                    .unwrap();
                assert_close(
                    &out.dense_embeddings.i(b * 3 + n..b * 3 + n + 1).unwrap(),
                    &reference.dense_embeddings,
                );
            }
        }
    }

    #[test]
    fn batch_mismatch_is_rejected() {
        let (_vm, enc) = encoder(small_config());
        let dev = Device::Cpu;
        let points = Tensor::zeros((2, 1, 2), DType::F32, &dev).unwrap();
        let labels = Tensor::ones((2, 1), DType::I64, &dev).unwrap();
        let res = enc.forward(&prompts(points.clone(), labels.clone(), no_boxes(3)));
        assert!(matches!(res, Err(crate::Error::ShapeMismatch(_))));

        let short_labels = Tensor::ones((2, 2), DType::I64, &dev).unwrap();
        let res = enc.forward(&prompts(points.clone(), short_labels, no_boxes(2)));
        assert!(matches!(res, Err(crate::Error::ShapeMismatch(_))));

        let masks = Tensor::ones((1, 1, 16, 16, 1), DType::F32, &dev).unwrap();
        let res = enc.forward(&prompts(points, labels, no_boxes(2)).with_masks(masks));
        assert!(matches!(res, Err(crate::Error::ShapeMismatch(_))));
    }

    #[test]
    fn dense_positional_embeddings_match_image_encoding() {
        let (_vm, enc) = encoder(small_config());
        let pe = enc.dense_positional_embeddings().unwrap();
        let grid = enc.pe_layer.encode_image((4, 4)).unwrap().unsqueeze(0).unwrap();
        assert_close(&pe, &grid);
    }

    #[test]
    fn registers_checkpoint_parameter_names() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let _enc = PromptEncoder::new(small_config(), vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "foreground_point_embed.weight",
            "background_point_embed.weight",
            "top_left_corner_embed.weight",
            "bottom_right_corner_embed.weight",
            "not_a_point_embed.weight",
            "no_mask_embed.weight",
            "mask_downscaler.0.weight",
            "mask_downscaler.1.weight",
            "mask_downscaler.4.bias",
            "mask_downscaler.6.weight",
            "positional_embedding_layer.positional_encoding_gaussian_matrix",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn seeded_basis_is_not_trainable() {
        let (varmap, _enc) = encoder(small_config());
        let data = varmap.data().lock().unwrap();
        assert!(!data.keys().any(|k| k.contains("gaussian")));
        assert_eq!(data.len(), 6 + 3 * 2 + 2 * 2);
    }

    #[test]
    fn config_validation() {
        let mut cfg = small_config();
        cfg.embed_dim = 5;
        assert!(matches!(cfg.validate(), Err(crate::Error::InvalidConfig(_))));
        let mut cfg = small_config();
        cfg.input_image_size = (0, 100);
        assert!(matches!(cfg.validate(), Err(crate::Error::InvalidConfig(_))));
        let mut cfg = small_config();
        cfg.mask_in_chans = 10;
        assert!(matches!(cfg.validate(), Err(crate::Error::InvalidConfig(_))));
        assert!(PromptEncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = small_config();
        let json = cfg.to_json().unwrap();
        assert!(json.contains("\"activation\":\"gelu\""));
        assert_eq!(PromptEncoderConfig::from_json(&json).unwrap(), cfg);

        let defaults = PromptEncoderConfig::from_json("{}").unwrap();
        assert_eq!(defaults, PromptEncoderConfig::default());

        assert!(PromptEncoderConfig::from_json(r#"{"activation":"mish"}"#).is_err());
        assert!(matches!(
            PromptEncoderConfig::from_json(r#"{"embed_dim":3}"#),
            Err(crate::Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn output_shapes_are_static_except_batch_and_sequence() {
        let (_vm, enc) = encoder(small_config());
        let shapes = enc.output_shapes();
        assert_eq!(shapes.sparse_embeddings, [None, None, Some(4)]);
        assert_eq!(shapes.dense_embeddings, [None, Some(4), Some(4), Some(4)]);
    }
}
