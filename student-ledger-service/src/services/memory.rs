//! In-process ledger store.
//!
//! Keeps whole records behind one `RwLock`, which makes the version check and
//! the two-record carry-forward commit atomic. Writes are also checked to be
//! append-only against the stored copy.

use crate::error::LedgerError;
use crate::models::{AuditAction, AuditEntry, BillingRecord, PeriodKey};
use crate::services::store::{LedgerChange, LedgerStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryLedgerStore {
    records: RwLock<HashMap<Uuid, BillingRecord>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored record without any checks. Only for setting up
    /// damaged state in tests.
    #[doc(hidden)]
    pub async fn force_put(&self, record: BillingRecord) {
        self.records.write().await.insert(record.record_id, record);
    }
}

fn check_insertable(
    records: &HashMap<Uuid, BillingRecord>,
    record: &BillingRecord,
) -> Result<(), LedgerError> {
    if records.contains_key(&record.record_id) {
        return Err(LedgerError::Conflict(format!(
            "billing record {} already exists",
            record.record_id
        )));
    }

    for existing in records.values() {
        if existing.student_id != record.student_id || existing.site_id != record.site_id {
            continue;
        }
        if existing.period.same_slot(&record.period) {
            return Err(LedgerError::Conflict(format!(
                "student {} already has a billing record for {}",
                record.student_id, record.period
            )));
        }
        if existing.is_current && record.is_current {
            return Err(LedgerError::Conflict(format!(
                "student {} already has a current billing record {} at site {}",
                record.student_id, existing.record_id, record.site_id
            )));
        }
    }

    Ok(())
}

fn check_append_only(stored: &BillingRecord, updated: &BillingRecord) -> Result<(), LedgerError> {
    let violation = |detail: &str| LedgerError::InvariantViolation {
        record_id: stored.record_id,
        detail: detail.to_string(),
    };

    if !updated.charges.starts_with(&stored.charges) {
        return Err(violation("existing charges were modified"));
    }
    if !updated.audit_trail.starts_with(&stored.audit_trail) {
        return Err(violation("existing audit entries were modified"));
    }
    if updated.audit_trail.len() != stored.audit_trail.len() + 1 {
        return Err(violation("a write must append exactly one audit entry"));
    }
    if updated.fee_breakdown != stored.fee_breakdown
        || updated.balance_brought_forward != stored.balance_brought_forward
        || updated.base_bill != stored.base_bill
    {
        return Err(violation("billing basis is immutable"));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    #[instrument(skip(self, record), fields(record_id = %record.record_id))]
    async fn insert_record(&self, record: &BillingRecord) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        check_insertable(&records, record)?;
        records.insert(record.record_id, record.clone());
        debug!("Record inserted");
        Ok(())
    }

    async fn get_record(&self, record_id: Uuid) -> Result<Option<BillingRecord>, LedgerError> {
        Ok(self.records.read().await.get(&record_id).cloned())
    }

    async fn find_by_slot(
        &self,
        student_id: Uuid,
        site_id: Uuid,
        period: &PeriodKey,
    ) -> Result<Option<BillingRecord>, LedgerError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.student_id == student_id && r.site_id == site_id && r.period.same_slot(period))
            .cloned())
    }

    async fn find_current(
        &self,
        student_id: Uuid,
        site_id: Uuid,
    ) -> Result<Option<BillingRecord>, LedgerError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.student_id == student_id && r.site_id == site_id && r.is_current)
            .cloned())
    }

    async fn list_for_student(
        &self,
        student_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<BillingRecord>, LedgerError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.student_id == student_id && site_id.map_or(true, |s| r.site_id == s))
            .cloned()
            .collect())
    }

    async fn list_flagged(&self) -> Result<Vec<BillingRecord>, LedgerError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_flagged())
            .cloned()
            .collect())
    }

    #[instrument(skip(self, record, change, audit), fields(record_id = %record.record_id, operation = change.operation()))]
    async fn apply_change(
        &self,
        record: &BillingRecord,
        expected_version: i64,
        change: &LedgerChange,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        let stored = records
            .get(&record.record_id)
            .ok_or_else(|| LedgerError::NotFound(format!("billing record {}", record.record_id)))?;

        if stored.version != expected_version {
            debug!(
                stored_version = stored.version,
                expected_version, "Stale write rejected"
            );
            return Err(LedgerError::ConcurrencyConflict(record.record_id));
        }
        check_append_only(stored, record)?;
        if record.audit_trail.last() != Some(audit) {
            return Err(LedgerError::InvariantViolation {
                record_id: record.record_id,
                detail: "audit entry does not match the record's trail".to_string(),
            });
        }

        records.insert(record.record_id, record.clone());
        Ok(())
    }

    #[instrument(skip(self, source, audit, successor), fields(record_id = %source.record_id, successor_id = %successor.record_id))]
    async fn commit_carry_forward(
        &self,
        source: &BillingRecord,
        expected_version: i64,
        audit: &AuditEntry,
        successor: &BillingRecord,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        let stored = records
            .get(&source.record_id)
            .ok_or_else(|| LedgerError::NotFound(format!("billing record {}", source.record_id)))?;

        if stored.version != expected_version {
            return Err(LedgerError::ConcurrencyConflict(source.record_id));
        }
        check_append_only(stored, source)?;
        if source.audit_trail.last() != Some(audit) {
            return Err(LedgerError::InvariantViolation {
                record_id: source.record_id,
                detail: "audit entry does not match the record's trail".to_string(),
            });
        }

        // Uniqueness is checked against the post-commit view, where the
        // source is no longer current.
        let mut view = records.clone();
        view.insert(source.record_id, source.clone());
        check_insertable(&view, successor)?;

        records.insert(source.record_id, source.clone());
        records.insert(successor.record_id, successor.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn flag_for_review(
        &self,
        record_id: Uuid,
        reason: &str,
        actor_id: Uuid,
    ) -> Result<(), LedgerError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&record_id)
            .ok_or_else(|| LedgerError::NotFound(format!("billing record {}", record_id)))?;

        let now = Utc::now();
        record.review_reason = Some(reason.to_string());
        record.record_audit(
            AuditAction::FlaggedForReview,
            actor_id,
            None,
            Some(serde_json::json!({ "reason": reason })),
            Some(reason.to_string()),
            now,
        );
        record.touch(actor_id, now);
        Ok(())
    }
}
