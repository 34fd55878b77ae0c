//! Error types for rvq-codec.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor error (tensor interop, checkpoint loading).
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, rejected at construction time.
    #[error("config: {0}")]
    Config(String),

    /// Buffer or tensor shape does not match what the caller promised.
    #[error("shape: {0}")]
    Shape(String),

    /// A code index outside `[0, codebook_size)` reached the decoder.
    #[error("code {code} out of range for codebook of size {codebook_size}")]
    CodeOutOfRange { code: u32, codebook_size: usize },

    /// Error raised by a single quantizer stage.
    #[error("stage {stage}: {source}")]
    Stage {
        stage: usize,
        #[source]
        source: Box<Error>,
    },

    /// Checkpoint is missing tensors or has mismatched shapes.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attach the index of the quantizer stage that produced this error.
    pub fn in_stage(self, stage: usize) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }
}
