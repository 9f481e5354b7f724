//! Audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of structural mutation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    ChargeAdded,
    PaymentLinked,
    PaymentUnlinked,
    ArrearsCarriedForward,
    FlaggedForReview,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::ChargeAdded => "charge_added",
            AuditAction::PaymentLinked => "payment_linked",
            AuditAction::PaymentUnlinked => "payment_unlinked",
            AuditAction::ArrearsCarriedForward => "arrears_carried_forward",
            AuditAction::FlaggedForReview => "flagged_for_review",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "created" => Some(AuditAction::Created),
            "charge_added" => Some(AuditAction::ChargeAdded),
            "payment_linked" => Some(AuditAction::PaymentLinked),
            "payment_unlinked" => Some(AuditAction::PaymentUnlinked),
            "arrears_carried_forward" => Some(AuditAction::ArrearsCarriedForward),
            "flagged_for_review" => Some(AuditAction::FlaggedForReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a record's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub sequence: i32,
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub recorded_utc: DateTime<Utc>,
}
