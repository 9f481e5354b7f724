//! Fee configuration snapshot consumed when a record is created.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FeeItem, PeriodKey};

/// What the fee configuration provider hands the ledger for one
/// configuration id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfiguration {
    pub fee_config_id: Uuid,
    pub school_id: Uuid,
    pub site_id: Uuid,
    pub period: PeriodKey,
    pub base_bill: Decimal,
    pub items: Vec<FeeItem>,
    pub currency: String,
    pub payment_due_date: Option<NaiveDate>,
}
