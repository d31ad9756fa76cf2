//! Segment Anything prompt encoding and companion vision layers on candle.
//!
//! [`PromptEncoder`] turns point, box and mask prompts into the sparse and
//! dense embeddings consumed by a SAM mask decoder. All public tensors use a
//! channels-last layout.

pub mod error;
pub mod layers;
pub mod modeling;

pub use error::{Error, Result};
pub use layers::random_flip::{
    FlipInputs, FlipMode, FlipTransformation, RandomFlip, RandomFlipConfig,
};
pub use modeling::interpolation::resize_mask_prompt;
pub use modeling::position_encoding::PositionEmbeddingRandom;
pub use modeling::sam::prompt_encoder::{
    PromptEmbeddingShapes, PromptEmbeddings, PromptEncoder, PromptEncoderConfig,
};
pub use modeling::sam::prompts::{
    Prompt, Prompts, BACKGROUND_LABEL, FOREGROUND_LABEL, PADDING_LABEL,
};
pub use modeling::sam_utils::MaskActivation;
