pub mod interpolation;
pub mod position_encoding;
pub mod sam;
pub mod sam_utils;
