//! Billing record: one student's obligation for one period at one site.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AuditAction, AuditEntry, Charge, FeeConfiguration, PaymentRef, PeriodKey};

/// Derived billing status. Callers never set this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingStatus {
    Pending,
    Clear,
    Owing,
    Overpaid,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Clear => "clear",
            BillingStatus::Owing => "owing",
            BillingStatus::Overpaid => "overpaid",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BillingStatus::Pending),
            "clear" => Some(BillingStatus::Clear),
            "owing" => Some(BillingStatus::Owing),
            "overpaid" => Some(BillingStatus::Overpaid),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Line of the fee breakdown snapshot taken at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeItem {
    pub label: String,
    pub description: Option<String>,
    pub amount: Decimal,
}

impl FeeItem {
    pub fn new(label: impl Into<String>, amount: Decimal) -> Self {
        Self {
            label: label.into(),
            description: None,
            amount,
        }
    }
}

/// Billing record with its full ledger history.
///
/// The totals and `billing_status` are derived from the brought-forward
/// balance, base bill, charges and linked payments; they are refreshed by the
/// balance calculator after every mutation and checked again on read.
/// `version` increments on every committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub record_id: Uuid,
    pub student_id: Uuid,
    pub school_id: Uuid,
    pub site_id: Uuid,
    pub period: PeriodKey,
    pub fee_config_id: Option<Uuid>,
    pub currency: String,
    pub payment_due_date: Option<NaiveDate>,

    pub balance_brought_forward: Decimal,
    pub base_bill: Decimal,
    pub fee_breakdown: Vec<FeeItem>,
    pub charges_total: Decimal,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub current_balance: Decimal,
    pub billing_status: BillingStatus,

    pub charges: Vec<Charge>,
    pub linked_payments: Vec<PaymentRef>,
    pub audit_trail: Vec<AuditEntry>,

    pub is_locked: bool,
    pub is_current: bool,
    pub carried_forward_from: Option<Uuid>,
    pub carried_forward_to: Option<Uuid>,
    pub review_reason: Option<String>,

    pub created_by: Uuid,
    pub last_modified_by: Uuid,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub locked_utc: Option<DateTime<Utc>>,
    pub version: i64,
}

impl BillingRecord {
    /// Seed a record from a fee configuration. Totals are left at zero and
    /// must be refreshed by the caller before the record is persisted.
    pub fn from_fee_configuration(
        student_id: Uuid,
        config: &FeeConfiguration,
        balance_brought_forward: Decimal,
        actor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            student_id,
            school_id: config.school_id,
            site_id: config.site_id,
            period: config.period.clone(),
            fee_config_id: Some(config.fee_config_id),
            currency: config.currency.clone(),
            payment_due_date: config.payment_due_date,
            balance_brought_forward,
            base_bill: config.base_bill,
            fee_breakdown: config.items.clone(),
            charges_total: Decimal::ZERO,
            total_billed: Decimal::ZERO,
            total_paid: Decimal::ZERO,
            current_balance: Decimal::ZERO,
            billing_status: BillingStatus::Pending,
            charges: Vec::new(),
            linked_payments: Vec::new(),
            audit_trail: Vec::new(),
            is_locked: false,
            is_current: true,
            carried_forward_from: None,
            carried_forward_to: None,
            review_reason: None,
            created_by: actor_id,
            last_modified_by: actor_id,
            created_utc: now,
            updated_utc: now,
            locked_utc: None,
            version: 1,
        }
    }

    /// Seed the successor of `source` for `period` with no fee configuration:
    /// only the carried balance is billed.
    pub fn successor_of(
        source: &BillingRecord,
        period: PeriodKey,
        balance_brought_forward: Decimal,
        actor_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            student_id: source.student_id,
            school_id: source.school_id,
            site_id: source.site_id,
            period,
            fee_config_id: None,
            currency: source.currency.clone(),
            payment_due_date: None,
            balance_brought_forward,
            base_bill: Decimal::ZERO,
            fee_breakdown: Vec::new(),
            charges_total: Decimal::ZERO,
            total_billed: Decimal::ZERO,
            total_paid: Decimal::ZERO,
            current_balance: Decimal::ZERO,
            billing_status: BillingStatus::Pending,
            charges: Vec::new(),
            linked_payments: Vec::new(),
            audit_trail: Vec::new(),
            is_locked: false,
            is_current: true,
            carried_forward_from: Some(source.record_id),
            carried_forward_to: None,
            review_reason: None,
            created_by: actor_id,
            last_modified_by: actor_id,
            created_utc: now,
            updated_utc: now,
            locked_utc: None,
            version: 1,
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.review_reason.is_some()
    }

    /// Balance still held by this record rather than by a successor.
    pub fn holds_open_balance(&self) -> bool {
        self.carried_forward_to.is_none()
    }

    pub fn find_payment(&self, payment_id: &str) -> Option<&PaymentRef> {
        self.linked_payments
            .iter()
            .find(|p| p.payment_id == payment_id)
    }

    pub fn next_charge_sequence(&self) -> i32 {
        self.charges.last().map(|c| c.sequence + 1).unwrap_or(1)
    }

    pub fn next_payment_sequence(&self) -> i32 {
        self.linked_payments
            .iter()
            .map(|p| p.sequence)
            .max()
            .map(|s| s + 1)
            .unwrap_or(1)
    }

    /// Append an audit entry and return a copy of it for persistence.
    pub fn record_audit(
        &mut self,
        action: AuditAction,
        actor_id: Uuid,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            entry_id: Uuid::new_v4(),
            sequence: self.audit_trail.last().map(|e| e.sequence + 1).unwrap_or(1),
            action,
            actor_id,
            old_value,
            new_value,
            reason,
            recorded_utc: now,
        };
        self.audit_trail.push(entry.clone());
        entry
    }

    /// Stamp modifier, timestamp and the next version.
    pub fn touch(&mut self, actor_id: Uuid, now: DateTime<Utc>) {
        self.last_modified_by = actor_id;
        self.updated_utc = now;
        self.version += 1;
    }
}
