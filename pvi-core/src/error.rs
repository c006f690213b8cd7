use thiserror::Error;

pub type Result<T> = std::result::Result<T, PviError>;

#[derive(Debug, Error)]
pub enum PviError {
    /// Natural-parameter algebra on tensors of different shapes
    #[error("incompatible shapes: {left:?} vs. {right:?}")]
    IncompatibleShape { left: Vec<usize>, right: Vec<usize> },

    /// A candidate factor left the admissible exponential-family domain
    #[error("invalid factor from client {client}: {reason}")]
    InvalidFactor { client: usize, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("empty data shard")]
    EmptyShard,

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl PviError {
    pub fn is_invalid_factor(&self) -> bool {
        matches!(self, PviError::InvalidFactor { .. })
    }
}
