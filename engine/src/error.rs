use thiserror::Error;

/// Errors surfaced by the core. Each maps to a stable machine-readable code
/// so the HTTP layer can return it unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("insufficient collateral: need {needed} msats, have {have} msats")]
    InsufficientCollateral { needed: i64, have: i64 },

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("insufficient savings")]
    InsufficientSavings,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("oracle unavailable")]
    OracleUnavailable,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::InsufficientCollateral { .. } => "INSUFFICIENT_COLLATERAL",
            EngineError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            EngineError::InsufficientSavings => "INSUFFICIENT_SAVINGS",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::OracleUnavailable => "ORACLE_UNAVAILABLE",
            EngineError::Storage(_) | EngineError::Internal(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
