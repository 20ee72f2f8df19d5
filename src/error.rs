use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChargebackError {
    #[error("Invalid billing period key '{0}': expected YYYY-MM")]
    InvalidPeriodKey(String),

    #[error("Billing period not found: id {0}")]
    PeriodNotFound(i64),

    #[error("Billing period not found: {0}")]
    UnknownPeriodKey(String),

    #[error("Billing period {period} is {status}: merges require an open period")]
    PeriodNotOpen { period: String, status: String },

    #[error("Billing period {period} cannot move from {from} to {to}")]
    InvalidPeriodTransition {
        period: String,
        from: String,
        to: String,
    },

    #[error("Reopening period {0} requires a reason")]
    ReopenReasonRequired(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Charge not found: id {0}")]
    ChargeNotFound(i64),

    #[error("Invalid subsidy rule '{name}': {details}")]
    InvalidSubsidyRule { name: String, details: String },

    #[error("Invalid fiscal start '{0}': expected MM-DD")]
    InvalidFiscalStart(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChargebackError>;
