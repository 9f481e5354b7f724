//! Ledger error taxonomy.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Billing record {0} is locked")]
    LockedRecord(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment {payment_id} is already linked to record {record_id}")]
    DuplicatePayment { record_id: Uuid, payment_id: String },

    #[error("Payment {payment_id} is not linked to record {record_id}")]
    PaymentNotLinked { record_id: Uuid, payment_id: String },

    #[error("Billing record {record_id} was already carried forward to {successor_id}")]
    AlreadyCarried { record_id: Uuid, successor_id: Uuid },

    #[error("Billing record {0} is not the student's current record")]
    NotCurrent(Uuid),

    #[error("Concurrent update on billing record {0}")]
    ConcurrencyConflict(Uuid),

    #[error("Invariant violation on billing record {record_id}: {detail}")]
    InvariantViolation { record_id: Uuid, detail: String },

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::LockedRecord(_) => "locked_record",
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::DuplicatePayment { .. } => "duplicate_payment",
            LedgerError::PaymentNotLinked { .. } => "payment_not_linked",
            LedgerError::AlreadyCarried { .. } => "already_carried",
            LedgerError::NotCurrent(_) => "not_current",
            LedgerError::ConcurrencyConflict(_) => "concurrency_conflict",
            LedgerError::InvariantViolation { .. } => "invariant_violation",
            LedgerError::Storage(_) => "storage",
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::NotFound(_) => AppError::NotFound(anyhow::anyhow!(message)),
            LedgerError::Conflict(_)
            | LedgerError::DuplicatePayment { .. }
            | LedgerError::AlreadyCarried { .. }
            | LedgerError::NotCurrent(_)
            | LedgerError::PaymentNotLinked { .. } => {
                AppError::Conflict(anyhow::anyhow!(message))
            }
            LedgerError::LockedRecord(_) => AppError::Locked(anyhow::anyhow!(message)),
            LedgerError::InvalidAmount(_) | LedgerError::InvalidInput(_) => {
                AppError::BadRequest(anyhow::anyhow!(message))
            }
            LedgerError::ConcurrencyConflict(_) => AppError::ServiceUnavailable(message),
            LedgerError::InvariantViolation { .. } => {
                AppError::InternalError(anyhow::anyhow!(message))
            }
            LedgerError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}
