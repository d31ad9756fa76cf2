use std::fmt;
use std::str::FromStr;

use candle_core::{Result, Tensor};
use candle_nn::{Activation, Init, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, Error};

/// Layer norm over the channel axis of an NCHW tensor.
///
/// Missing parameters default to the identity affine (weight 1, bias 0).
#[derive(Debug, Clone)]
pub struct LayerNorm2d {
    // Both kept as (1, C, 1, 1) so they broadcast over the batch and pixels.
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm2d {
    pub fn new(num_channels: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let affine_shape = (1, num_channels, 1, 1);
        let weight = vb
            .get_with_hints(num_channels, "weight", Init::Const(1.))?
            .reshape(affine_shape)?;
        let bias = vb
            .get_with_hints(num_channels, "bias", Init::Const(0.))?
            .reshape(affine_shape)?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let centered = xs.broadcast_sub(&xs.mean_keepdim(1)?)?;
        let std = (centered.sqr()?.mean_keepdim(1)? + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Pointwise nonlinearity used between the mask downscaler convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MaskActivation {
    /// Exact (erf) GELU.
    #[default]
    Gelu,
    /// Tanh approximation of GELU.
    GeluTanh,
    Relu,
    Silu,
    Sigmoid,
    Tanh,
}

impl MaskActivation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gelu => "gelu",
            Self::GeluTanh => "gelu_tanh",
            Self::Relu => "relu",
            Self::Silu => "silu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
        }
    }
}

impl fmt::Display for MaskActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MaskActivation {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gelu" => Ok(Self::Gelu),
            "gelu_tanh" => Ok(Self::GeluTanh),
            "relu" => Ok(Self::Relu),
            "silu" | "swish" => Ok(Self::Silu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            other => Err(invalid_config(format!("unknown activation `{other}`"))),
        }
    }
}

impl TryFrom<String> for MaskActivation {
    type Error = Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MaskActivation> for String {
    fn from(value: MaskActivation) -> Self {
        value.name().to_string()
    }
}

impl MaskActivation {
    /// The matching candle activation; `None` for tanh, which candle lacks.
    fn as_candle(&self) -> Option<Activation> {
        match self {
            Self::Gelu => Some(Activation::Gelu),
            Self::GeluTanh => Some(Activation::GeluPytorchTanh),
            Self::Relu => Some(Activation::Relu),
            Self::Silu => Some(Activation::Silu),
            Self::Sigmoid => Some(Activation::Sigmoid),
            Self::Tanh => None,
        }
    }
}

impl Module for MaskActivation {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self.as_candle() {
            Some(act) => act.forward(xs),
            None => xs.tanh(),
        }
    }
}
