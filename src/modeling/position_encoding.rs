use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{invalid_config, shape_mismatch, Result};

/// Positional encoding using random spatial frequencies.
///
/// Coordinates normalized to `[0, 1]` are mapped to `[-1, 1]`, projected
/// through a frozen `(2, num_pos_feats)` Gaussian matrix and scaled by `2π`.
/// The output is `cat(sin, cos)`, so every encoding has `2 * num_pos_feats`
/// features.
#[derive(Debug, Clone)]
pub struct PositionEmbeddingRandom {
    positional_encoding_gaussian_matrix: Tensor,
}

impl PositionEmbeddingRandom {
    /// Loads the projection matrix from a checkpoint.
    pub fn new(num_pos_feats: usize, vb: VarBuilder) -> Result<Self> {
        let positional_encoding_gaussian_matrix =
            vb.get((2, num_pos_feats), "positional_encoding_gaussian_matrix")?;
        Ok(Self {
            positional_encoding_gaussian_matrix,
        })
    }

    /// Samples the projection matrix from `Normal(0, scale)`.
    ///
    /// The same `seed` always yields the same basis. The matrix is a plain
    /// tensor, never registered as a trainable variable.
    pub fn from_seed(num_pos_feats: usize, scale: f64, seed: u64, device: &Device) -> Result<Self> {
        if num_pos_feats == 0 {
            return Err(invalid_config("num_pos_feats must be non-zero"));
        }
        let normal = Normal::new(0f32, scale as f32)
            .map_err(|e| invalid_config(format!("positional encoding scale {scale}: {e}")))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..2 * num_pos_feats)
            .map(|_| normal.sample(&mut rng))
            .collect();
        let positional_encoding_gaussian_matrix =
            Tensor::from_vec(data, (2, num_pos_feats), device)?;
        Ok(Self {
            positional_encoding_gaussian_matrix,
        })
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            positional_encoding_gaussian_matrix: self
                .positional_encoding_gaussian_matrix
                .to_dtype(dtype)?,
        })
    }

    /// Number of output features, `2 * num_pos_feats`.
    pub fn embed_dim(&self) -> usize {
        self.positional_encoding_gaussian_matrix.dims()[1] * 2
    }

    pub fn gaussian_matrix(&self) -> &Tensor {
        &self.positional_encoding_gaussian_matrix
    }

    fn pe_encoding(&self, coords: &Tensor) -> Result<Tensor> {
        let coords = coords.affine(2., -1.)?;
        let coords = coords.broadcast_matmul(&self.positional_encoding_gaussian_matrix)?;
        let coords = (coords * (2. * std::f64::consts::PI))?;
        Ok(Tensor::cat(&[coords.sin()?, coords.cos()?], D::Minus1)?)
    }

    /// Encodes pixel-space `(x, y)` coordinates shaped `(..., 2)`.
    ///
    /// `image_size` is `(height, width)`: x is normalized by the width and y
    /// by the height.
    pub fn encode_coordinates(&self, coords: &Tensor, image_size: (usize, usize)) -> Result<Tensor> {
        let (h, w) = image_size;
        if h == 0 || w == 0 {
            return Err(invalid_config(format!(
                "image size must be non-zero, got {h}x{w}"
            )));
        }
        let dims = coords.dims();
        if dims.len() < 2 || dims[dims.len() - 1] != 2 {
            return Err(shape_mismatch(format!(
                "expected coordinates shaped (..., 2), got {dims:?}"
            )));
        }
        if coords.elem_count() == 0 {
            let mut shape = dims.to_vec();
            let last = shape.len() - 1;
            shape[last] = self.embed_dim();
            let dtype = self.positional_encoding_gaussian_matrix.dtype();
            return Ok(Tensor::zeros(shape, dtype, coords.device())?);
        }

        let coords = coords.to_dtype(self.positional_encoding_gaussian_matrix.dtype())?;
        let coords0 = (coords.narrow(D::Minus1, 0, 1)? / w as f64)?;
        let coords1 = (coords.narrow(D::Minus1, 1, 1)? / h as f64)?;
        let coords = Tensor::cat(&[&coords0, &coords1], D::Minus1)?;
        self.pe_encoding(&coords)
    }

    /// Encodes every pixel center of an `(h, w)` grid, returning `(h, w, embed_dim)`.
    pub fn encode_image(&self, size: (usize, usize)) -> Result<Tensor> {
        let (h, w) = size;
        if h == 0 || w == 0 {
            return Err(invalid_config(format!(
                "grid size must be non-zero, got {h}x{w}"
            )));
        }
        let m = &self.positional_encoding_gaussian_matrix;
        let device = m.device();
        let x_embed = (Tensor::arange(0u32, w as u32, device)?.to_dtype(m.dtype())? + 0.5)?;
        let y_embed = (Tensor::arange(0u32, h as u32, device)?.to_dtype(m.dtype())? + 0.5)?;
        let x_embed = (x_embed / w as f64)?
            .reshape((1, ()))?
            .broadcast_as((h, w))?;
        let y_embed = (y_embed / h as f64)?
            .reshape(((), 1))?
            .broadcast_as((h, w))?;
        let coords = Tensor::stack(&[&x_embed, &y_embed], D::Minus1)?;
        self.pe_encoding(&coords)
    }
}
