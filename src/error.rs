use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Invalid {column} total '{value}': expected a decimal amount")]
    InvalidTotal { column: String, value: String },

    #[error("Change in {liability} total from {previous} to {current} is out of range")]
    TotalOutOfRange {
        liability: String,
        previous: String,
        current: String,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error(
        "Invalid reconciliation window: current date {current} is before previous date {previous}"
    )]
    InvalidWindow { previous: String, current: String },

    #[error("Receipt lookup failed: {0}")]
    ReceiptLookup(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
