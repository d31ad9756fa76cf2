//! Image augmentation layers.

pub mod random_flip;
