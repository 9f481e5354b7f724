//! Domain models for student-ledger-service.

mod audit;
mod charge;
mod fee_config;
mod payment;
mod period;
mod record;
mod summary;

pub use audit::{AuditAction, AuditEntry};
pub use charge::{Charge, ChargeCategory, NewCharge};
pub use fee_config::FeeConfiguration;
pub use payment::{NewPayment, PaymentRef};
pub use period::{PeriodKey, PeriodType};
pub use record::{BillingRecord, BillingStatus, FeeItem};
pub use summary::StudentSummary;
