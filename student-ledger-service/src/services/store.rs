//! Storage seams for the ledger.
//!
//! Every write takes the version the caller read. Implementations commit only
//! when the stored version still matches and otherwise return
//! [`LedgerError::ConcurrencyConflict`] without applying anything.

use crate::error::LedgerError;
use crate::models::{AuditEntry, BillingRecord, Charge, FeeConfiguration, PaymentRef, PeriodKey};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// The single ledger mutation carried by a write, alongside the refreshed
/// record header and the audit entry describing it.
#[derive(Debug, Clone)]
pub enum LedgerChange {
    ChargeAdded(Charge),
    PaymentLinked(PaymentRef),
    PaymentUnlinked(PaymentRef),
    /// Lock step of a carry-forward whose successor already exists.
    CarriedForward { successor_id: Uuid },
}

impl LedgerChange {
    pub fn operation(&self) -> &'static str {
        match self {
            LedgerChange::ChargeAdded(_) => "add_charge",
            LedgerChange::PaymentLinked(_) => "link_payment",
            LedgerChange::PaymentUnlinked(_) => "unlink_payment",
            LedgerChange::CarriedForward { .. } => "carry_forward",
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new record with its initial audit entries. Fails with
    /// `Conflict` when the period slot is taken or the student already has a
    /// current record at the site.
    async fn insert_record(&self, record: &BillingRecord) -> Result<(), LedgerError>;

    async fn get_record(&self, record_id: Uuid) -> Result<Option<BillingRecord>, LedgerError>;

    /// Record occupying the (student, site, year, period type, number) slot.
    async fn find_by_slot(
        &self,
        student_id: Uuid,
        site_id: Uuid,
        period: &PeriodKey,
    ) -> Result<Option<BillingRecord>, LedgerError>;

    async fn find_current(
        &self,
        student_id: Uuid,
        site_id: Uuid,
    ) -> Result<Option<BillingRecord>, LedgerError>;

    /// All records for a student, optionally restricted to one site.
    async fn list_for_student(
        &self,
        student_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<BillingRecord>, LedgerError>;

    async fn list_flagged(&self) -> Result<Vec<BillingRecord>, LedgerError>;

    /// Persist `record` (already carrying the change, refreshed totals and
    /// the next version) if the stored version equals `expected_version`.
    async fn apply_change(
        &self,
        record: &BillingRecord,
        expected_version: i64,
        change: &LedgerChange,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError>;

    /// Insert `successor` and persist the locked `source` in one unit.
    async fn commit_carry_forward(
        &self,
        source: &BillingRecord,
        expected_version: i64,
        audit: &AuditEntry,
        successor: &BillingRecord,
    ) -> Result<(), LedgerError>;

    /// Mark a record for manual review. Applies regardless of version and
    /// appends a `flagged_for_review` audit entry.
    async fn flag_for_review(
        &self,
        record_id: Uuid,
        reason: &str,
        actor_id: Uuid,
    ) -> Result<(), LedgerError>;
}

/// Source of fee configuration snapshots.
#[async_trait]
pub trait FeeConfigProvider: Send + Sync {
    async fn fee_configuration(
        &self,
        fee_config_id: Uuid,
    ) -> Result<Option<FeeConfiguration>, LedgerError>;
}

/// Fee configurations held in memory, for embedding and tests.
#[derive(Default)]
pub struct StaticFeeConfigs {
    configs: RwLock<HashMap<Uuid, FeeConfiguration>>,
}

impl StaticFeeConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, config: FeeConfiguration) {
        self.configs
            .write()
            .await
            .insert(config.fee_config_id, config);
    }
}

#[async_trait]
impl FeeConfigProvider for StaticFeeConfigs {
    async fn fee_configuration(
        &self,
        fee_config_id: Uuid,
    ) -> Result<Option<FeeConfiguration>, LedgerError> {
        Ok(self.configs.read().await.get(&fee_config_id).cloned())
    }
}
