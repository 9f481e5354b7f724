//! Additional charges appended to a billing record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Charge categories accepted by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeCategory {
    Transport,
    Feeding,
    Uniform,
    Books,
    Examination,
    ExtraClasses,
    Excursion,
    Penalty,
    Adjustment,
    Other,
}

impl ChargeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeCategory::Transport => "transport",
            ChargeCategory::Feeding => "feeding",
            ChargeCategory::Uniform => "uniform",
            ChargeCategory::Books => "books",
            ChargeCategory::Examination => "examination",
            ChargeCategory::ExtraClasses => "extra_classes",
            ChargeCategory::Excursion => "excursion",
            ChargeCategory::Penalty => "penalty",
            ChargeCategory::Adjustment => "adjustment",
            ChargeCategory::Other => "other",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "transport" => Some(ChargeCategory::Transport),
            "feeding" => Some(ChargeCategory::Feeding),
            "uniform" => Some(ChargeCategory::Uniform),
            "books" => Some(ChargeCategory::Books),
            "examination" => Some(ChargeCategory::Examination),
            "extra_classes" => Some(ChargeCategory::ExtraClasses),
            "excursion" => Some(ChargeCategory::Excursion),
            "penalty" => Some(ChargeCategory::Penalty),
            "adjustment" => Some(ChargeCategory::Adjustment),
            "other" => Some(ChargeCategory::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChargeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Charge as stored on the record. Never edited once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub charge_id: Uuid,
    pub sequence: i32,
    pub category: ChargeCategory,
    pub particulars: String,
    pub amount: Decimal,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub added_by: Uuid,
    pub added_utc: DateTime<Utc>,
}

/// Input for appending a charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCharge {
    pub category: ChargeCategory,
    pub particulars: String,
    pub amount: Decimal,
    pub reference: Option<String>,
    pub notes: Option<String>,
}

impl NewCharge {
    pub fn new(category: ChargeCategory, particulars: impl Into<String>, amount: Decimal) -> Self {
        Self {
            category,
            particulars: particulars.into(),
            amount,
            reference: None,
            notes: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}
