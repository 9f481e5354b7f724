//! Read-side summary across a student's chain of records.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BillingRecord;

/// Student balance position across all of their billing records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSummary {
    pub student_id: Uuid,
    pub site_id: Option<Uuid>,
    /// Records ordered by academic period.
    pub chain: Vec<BillingRecord>,
    /// Sum of positive open balances.
    pub outstanding: Decimal,
    /// Sum of negated negative open balances.
    pub overpaid: Decimal,
    pub net_balance: Decimal,
}
