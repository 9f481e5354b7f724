//! Payment references linked to a billing record.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A confirmed payment from the payment system, as linked to a record.
/// `payment_id` is the payment system's identity and is unique per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRef {
    pub payment_id: String,
    pub sequence: i32,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub receipt_number: Option<String>,
    pub method: Option<String>,
    pub linked_by: Uuid,
    pub linked_utc: DateTime<Utc>,
}

/// Input supplied by the payment event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub payment_id: String,
    pub amount: Decimal,
    pub paid_on: NaiveDate,
    pub receipt_number: Option<String>,
    pub method: Option<String>,
}

impl NewPayment {
    pub fn new(payment_id: impl Into<String>, amount: Decimal, paid_on: NaiveDate) -> Self {
        Self {
            payment_id: payment_id.into(),
            amount,
            paid_on,
            receipt_number: None,
            method: None,
        }
    }

    pub fn with_receipt(mut self, receipt_number: impl Into<String>) -> Self {
        self.receipt_number = Some(receipt_number.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}
