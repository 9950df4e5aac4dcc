use std::time::Duration;

use thiserror::Error;

use crate::origin::OriginError;

/// Failure of a cache-mediated fetch. `Clone` so one outcome reaches every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),
    #[error("origin request failed: {0}")]
    OriginError(String),
    #[error("origin did not respond within {0:?}")]
    OriginTimeout(Duration),
    #[error("origin response could not be decoded: {0}")]
    Decompression(String),
    #[error("origin fetch was abandoned before completing")]
    FetchAbandoned,
}

impl CacheError {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::OriginUnreachable(_) => "unreachable",
            CacheError::OriginError(_) => "error",
            CacheError::OriginTimeout(_) => "timeout",
            CacheError::Decompression(_) => "decompression",
            CacheError::FetchAbandoned => "abandoned",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::OriginTimeout(_))
    }
}

impl From<OriginError> for CacheError {
    fn from(err: OriginError) -> Self {
        match err {
            OriginError::Unreachable(_) => CacheError::OriginUnreachable(err.to_string()),
            OriginError::Request(_) | OriginError::BodyTooLarge { .. } => {
                CacheError::OriginError(err.to_string())
            }
        }
    }
}
