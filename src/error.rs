use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub(crate) fn invalid_config<S: Into<String>>(msg: S) -> Error {
    Error::InvalidConfig(msg.into())
}

pub(crate) fn shape_mismatch<S: Into<String>>(msg: S) -> Error {
    Error::ShapeMismatch(msg.into())
}
