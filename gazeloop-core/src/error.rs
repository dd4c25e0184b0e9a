use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Input unavailable: {0}")]
    InputUnavailable(String),

    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Computation failed: {0}")]
    ComputationFailed(String),

    #[error("Empty output: {0}")]
    EmptyOutput(String),

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Timed out in {stage} after {ticks} ticks")]
    Timeout { stage: String, ticks: u32 },

    #[error("Readback error: {0}")]
    Readback(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
