//! Ledger service: the mutation protocol for billing records.
//!
//! Every mutation is one read-validate-append-recompute-persist unit. The
//! record is read, changed on a local copy, refreshed by the balance
//! calculator and written back only if the stored version is unchanged. A
//! stale write is retried against freshly read state a bounded number of
//! times before `ConcurrencyConflict` is surfaced.

use crate::error::LedgerError;
use crate::models::{
    AuditAction, AuditEntry, BillingRecord, Charge, FeeConfiguration, NewCharge, NewPayment,
    PaymentRef, PeriodKey, StudentSummary,
};
use crate::services::balance;
use crate::services::metrics::{
    record_error, record_invariant_violation, record_operation, record_retry, OPERATION_DURATION,
};
use crate::services::store::{FeeConfigProvider, LedgerChange, LedgerStore};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Amounts are held in currency minor units: at most two fractional digits.
pub const MINOR_UNIT_SCALE: u32 = 2;

/// Actor recorded when the ledger itself flags a record.
pub const SYSTEM_ACTOR: Uuid = Uuid::nil();

/// Tuning for retries and storage deadlines.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Retries after the first attempt when a write loses a version race.
    pub max_retries: u32,
    /// Base delay before a retry, doubled per attempt.
    pub retry_backoff: Duration,
    /// Upper bound on each storage round trip.
    pub operation_timeout: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(25),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl LedgerSettings {
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt.min(6)));
        // Up to 25% jitter so racing writers spread out.
        base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..=0.25))
    }
}

/// Identity of the period a carry-forward opens.
#[derive(Debug, Clone)]
pub struct NextPeriod {
    pub period: PeriodKey,
    /// Fee configuration for the new period. When absent the successor bills
    /// only the carried balance.
    pub fee_config_id: Option<Uuid>,
}

impl NextPeriod {
    pub fn new(period: PeriodKey) -> Self {
        Self {
            period,
            fee_config_id: None,
        }
    }

    pub fn with_fee_config(mut self, fee_config_id: Uuid) -> Self {
        self.fee_config_id = Some(fee_config_id);
        self
    }
}

/// Result of a carry-forward: the locked source and its successor.
#[derive(Debug, Clone)]
pub struct CarryForwardOutcome {
    pub source: BillingRecord,
    pub successor: BillingRecord,
}

/// Student billing ledger. Construct one per process and share it; it holds
/// no state besides its storage handles.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    fee_configs: Arc<dyn FeeConfigProvider>,
    settings: LedgerSettings,
}

impl LedgerService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        fee_configs: Arc<dyn FeeConfigProvider>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            fee_configs,
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    // -------------------------------------------------------------------------
    // Record creation
    // -------------------------------------------------------------------------

    /// Create a billing record from a fee configuration snapshot.
    #[instrument(skip(self), fields(student_id = %student_id, fee_config_id = %fee_config_id))]
    pub async fn create_record(
        &self,
        student_id: Uuid,
        fee_config_id: Uuid,
        actor_id: Uuid,
        balance_brought_forward: Decimal,
    ) -> Result<BillingRecord, LedgerError> {
        let started = Instant::now();
        let result = self
            .try_create_record(student_id, fee_config_id, actor_id, balance_brought_forward)
            .await;

        self.finish("create_record", started, result).map(|record| {
            info!(
                record_id = %record.record_id,
                period = %record.period,
                total_billed = %record.total_billed,
                "Billing record created"
            );
            record
        })
    }

    async fn try_create_record(
        &self,
        student_id: Uuid,
        fee_config_id: Uuid,
        actor_id: Uuid,
        balance_brought_forward: Decimal,
    ) -> Result<BillingRecord, LedgerError> {
        validate_scale(balance_brought_forward, "balance brought forward")?;

        let config = self.resolve_fee_configuration(fee_config_id).await?;
        let now = Utc::now();
        let mut record = BillingRecord::from_fee_configuration(
            student_id,
            &config,
            balance_brought_forward,
            actor_id,
            now,
        );
        balance::refresh(&mut record)?;
        let created = creation_snapshot(&record);
        record.record_audit(AuditAction::Created, actor_id, None, Some(created), None, now);

        self.with_deadline(self.store.insert_record(&record)).await?;
        Ok(record)
    }

    // -------------------------------------------------------------------------
    // Charge ledger
    // -------------------------------------------------------------------------

    /// Append a charge to an open record.
    #[instrument(skip(self, charge), fields(record_id = %record_id, category = %charge.category, amount = %charge.amount))]
    pub async fn add_charge(
        &self,
        record_id: Uuid,
        charge: NewCharge,
        actor_id: Uuid,
    ) -> Result<BillingRecord, LedgerError> {
        let started = Instant::now();
        let result = async {
            validate_amount(charge.amount, "charge amount")?;
            if charge.particulars.trim().is_empty() {
                return Err(LedgerError::InvalidInput(
                    "charge particulars must not be empty".to_string(),
                ));
            }

            let charge = &charge;
            self.retry_on_conflict("add_charge", record_id, move || {
                self.try_mutate(record_id, move |record, now| {
                    apply_charge(record, charge, actor_id, now)
                })
            })
            .await
        }
        .await;

        self.finish("add_charge", started, result).map(|record| {
            info!(
                charges_total = %record.charges_total,
                current_balance = %record.current_balance,
                status = %record.billing_status,
                "Charge added"
            );
            record
        })
    }

    // -------------------------------------------------------------------------
    // Payment linker
    // -------------------------------------------------------------------------

    /// Link a confirmed payment. Linking the same payment id twice fails with
    /// `DuplicatePayment` and leaves the record untouched.
    #[instrument(skip(self, payment), fields(record_id = %record_id, payment_id = %payment.payment_id, amount = %payment.amount))]
    pub async fn link_payment(
        &self,
        record_id: Uuid,
        payment: NewPayment,
        actor_id: Uuid,
    ) -> Result<BillingRecord, LedgerError> {
        let started = Instant::now();
        let result = async {
            validate_amount(payment.amount, "payment amount")?;
            if payment.payment_id.trim().is_empty() {
                return Err(LedgerError::InvalidInput(
                    "payment id must not be empty".to_string(),
                ));
            }

            let payment = &payment;
            self.retry_on_conflict("link_payment", record_id, move || {
                self.try_mutate(record_id, move |record, now| {
                    apply_payment_link(record, payment, actor_id, now)
                })
            })
            .await
        }
        .await;

        self.finish("link_payment", started, result).map(|record| {
            info!(
                total_paid = %record.total_paid,
                current_balance = %record.current_balance,
                status = %record.billing_status,
                "Payment linked"
            );
            record
        })
    }

    /// Remove a payment link after the payment system reversed the payment.
    #[instrument(skip(self), fields(record_id = %record_id, payment_id = %payment_id))]
    pub async fn unlink_payment(
        &self,
        record_id: Uuid,
        payment_id: &str,
        actor_id: Uuid,
        reason: Option<&str>,
    ) -> Result<BillingRecord, LedgerError> {
        let started = Instant::now();
        let result = self
            .retry_on_conflict("unlink_payment", record_id, move || {
                self.try_mutate(record_id, move |record, now| {
                    apply_payment_unlink(record, payment_id, reason, actor_id, now)
                })
            })
            .await;

        self.finish("unlink_payment", started, result).map(|record| {
            info!(
                total_paid = %record.total_paid,
                current_balance = %record.current_balance,
                "Payment unlinked"
            );
            record
        })
    }

    // -------------------------------------------------------------------------
    // Carry-forward
    // -------------------------------------------------------------------------

    /// Close the current record and open the next period's record with the
    /// closing balance brought forward.
    #[instrument(skip(self, next), fields(record_id = %record_id, next_period = %next.period))]
    pub async fn carry_forward(
        &self,
        record_id: Uuid,
        next: NextPeriod,
        actor_id: Uuid,
    ) -> Result<CarryForwardOutcome, LedgerError> {
        let started = Instant::now();
        let result = async {
            next.period
                .validate()
                .map_err(LedgerError::InvalidInput)?;
            let next_config = match next.fee_config_id {
                Some(id) => Some(self.resolve_fee_configuration(id).await?),
                None => None,
            };

            let period = &next.period;
            let next_config = next_config.as_ref();
            self.retry_on_conflict("carry_forward", record_id, move || {
                self.try_carry_forward(record_id, period, next_config, actor_id)
            })
            .await
        }
        .await;

        self.finish("carry_forward", started, result).map(|outcome| {
            info!(
                successor_id = %outcome.successor.record_id,
                carried_amount = %outcome.successor.balance_brought_forward,
                "Balance carried forward"
            );
            outcome
        })
    }

    async fn try_carry_forward(
        &self,
        record_id: Uuid,
        period: &PeriodKey,
        next_config: Option<&FeeConfiguration>,
        actor_id: Uuid,
    ) -> Result<CarryForwardOutcome, LedgerError> {
        let source = self.load_for_write(record_id).await?;

        if let Some(successor_id) = source.carried_forward_to {
            if source.is_locked && !source.is_current {
                return Err(LedgerError::AlreadyCarried {
                    record_id,
                    successor_id,
                });
            }
            let detail = format!(
                "carried forward to {} but still open (locked: {}, current: {})",
                successor_id, source.is_locked, source.is_current
            );
            return Err(self.invariant_violation(record_id, detail).await);
        }
        if !source.is_current {
            return Err(LedgerError::NotCurrent(record_id));
        }
        if !period.follows(&source.period) {
            return Err(LedgerError::InvalidInput(format!(
                "next period {} does not follow {}",
                period, source.period
            )));
        }
        if let Some(config) = next_config {
            check_successor_config(&source, period, config)?;
        }

        // A successor already pointing at this record means an earlier attempt
        // stopped between its two steps; finish the lock instead of creating
        // another successor.
        let existing = self
            .with_deadline(
                self.store
                    .find_by_slot(source.student_id, source.site_id, period),
            )
            .await?;
        if let Some(existing) = existing {
            if existing.carried_forward_from != Some(record_id) {
                return Err(LedgerError::Conflict(format!(
                    "student {} already has billing record {} for {}",
                    source.student_id, existing.record_id, period
                )));
            }
            return self.complete_carry_forward(source, existing, actor_id).await;
        }

        let now = Utc::now();
        let carried = source.current_balance;

        let mut successor = match next_config {
            Some(config) => {
                let mut record = BillingRecord::from_fee_configuration(
                    source.student_id,
                    config,
                    carried,
                    actor_id,
                    now,
                );
                record.period = period.clone();
                record.carried_forward_from = Some(record_id);
                record
            }
            None => BillingRecord::successor_of(&source, period.clone(), carried, actor_id, now),
        };
        balance::refresh(&mut successor)?;
        let created = creation_snapshot(&successor);
        successor.record_audit(AuditAction::Created, actor_id, None, Some(created), None, now);

        let expected_version = source.version;
        let mut source = source;
        let audit = lock_for_carry_forward(&mut source, successor.record_id, period, actor_id, now);

        self.with_deadline(self.store.commit_carry_forward(
            &source,
            expected_version,
            &audit,
            &successor,
        ))
        .await?;

        Ok(CarryForwardOutcome { source, successor })
    }

    async fn complete_carry_forward(
        &self,
        source: BillingRecord,
        successor: BillingRecord,
        actor_id: Uuid,
    ) -> Result<CarryForwardOutcome, LedgerError> {
        if successor.balance_brought_forward != source.current_balance {
            let detail = format!(
                "successor {} brought forward {} but source balance is {}",
                successor.record_id, successor.balance_brought_forward, source.current_balance
            );
            return Err(self.invariant_violation(source.record_id, detail).await);
        }

        warn!(
            record_id = %source.record_id,
            successor_id = %successor.record_id,
            "Completing interrupted carry-forward"
        );

        let now = Utc::now();
        let expected_version = source.version;
        let mut source = source;
        let audit = lock_for_carry_forward(
            &mut source,
            successor.record_id,
            &successor.period,
            actor_id,
            now,
        );
        let change = LedgerChange::CarriedForward {
            successor_id: successor.record_id,
        };

        self.with_deadline(
            self.store
                .apply_change(&source, expected_version, &change, &audit),
        )
        .await?;

        Ok(CarryForwardOutcome { source, successor })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read one record, checking its derived totals. A record whose totals
    /// disagree with its history is flagged for review.
    #[instrument(skip(self))]
    pub async fn get_record(&self, record_id: Uuid) -> Result<BillingRecord, LedgerError> {
        let record = self
            .with_deadline(self.store.get_record(record_id))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("billing record {}", record_id)))?;
        self.verified(record).await
    }

    /// The student's current record at a site, if any.
    #[instrument(skip(self))]
    pub async fn get_current_record(
        &self,
        student_id: Uuid,
        site_id: Uuid,
    ) -> Result<Option<BillingRecord>, LedgerError> {
        match self
            .with_deadline(self.store.find_current(student_id, site_id))
            .await?
        {
            Some(record) => Ok(Some(self.verified(record).await?)),
            None => Ok(None),
        }
    }

    /// Records awaiting manual review.
    pub async fn list_flagged_records(&self) -> Result<Vec<BillingRecord>, LedgerError> {
        self.with_deadline(self.store.list_flagged()).await
    }

    /// Balance position across a student's records. Read-only: never writes,
    /// and reports an inconsistent record as an error instead of flagging it.
    #[instrument(skip(self))]
    pub async fn get_student_summary(
        &self,
        student_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<StudentSummary, LedgerError> {
        let started = Instant::now();
        let result = self.try_student_summary(student_id, site_id).await;
        self.finish("get_student_summary", started, result)
    }

    async fn try_student_summary(
        &self,
        student_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<StudentSummary, LedgerError> {
        let mut chain = self
            .with_deadline(self.store.list_for_student(student_id, site_id))
            .await?;

        for record in &chain {
            if let Err(detail) = balance::verify(record) {
                record_invariant_violation();
                return Err(LedgerError::InvariantViolation {
                    record_id: record.record_id,
                    detail,
                });
            }
        }
        check_chain_conservation(&chain)?;

        chain.sort_by(|a, b| {
            a.period
                .academic_year
                .cmp(&b.period.academic_year)
                .then(a.period.period_type.cmp(&b.period.period_type))
                .then(a.period.period_number.cmp(&b.period.period_number))
                .then(a.created_utc.cmp(&b.created_utc))
        });

        let mut outstanding = Decimal::ZERO;
        let mut overpaid = Decimal::ZERO;
        for record in chain.iter().filter(|r| r.holds_open_balance()) {
            if record.current_balance > Decimal::ZERO {
                outstanding += record.current_balance;
            } else {
                overpaid -= record.current_balance;
            }
        }

        Ok(StudentSummary {
            student_id,
            site_id,
            chain,
            outstanding,
            overpaid,
            net_balance: outstanding - overpaid,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn resolve_fee_configuration(
        &self,
        fee_config_id: Uuid,
    ) -> Result<FeeConfiguration, LedgerError> {
        let config = self
            .with_deadline(self.fee_configs.fee_configuration(fee_config_id))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("fee configuration {}", fee_config_id)))?;

        config.period.validate().map_err(LedgerError::InvalidInput)?;
        if config.base_bill < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "fee configuration {} has a negative base bill {}",
                fee_config_id, config.base_bill
            )));
        }
        validate_scale(config.base_bill, "base bill")?;
        Ok(config)
    }

    /// Read a record for mutation: it must exist, be consistent and not be
    /// under review.
    async fn load_for_write(&self, record_id: Uuid) -> Result<BillingRecord, LedgerError> {
        let record = self
            .with_deadline(self.store.get_record(record_id))
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("billing record {}", record_id)))?;
        let record = self.verified(record).await?;

        if let Some(reason) = &record.review_reason {
            return Err(LedgerError::InvariantViolation {
                record_id,
                detail: format!("record is under review: {}", reason),
            });
        }
        Ok(record)
    }

    async fn verified(&self, record: BillingRecord) -> Result<BillingRecord, LedgerError> {
        match balance::verify(&record) {
            Ok(()) => Ok(record),
            // Already flagged: report without writing another audit entry.
            Err(detail) if record.is_flagged() => Err(LedgerError::InvariantViolation {
                record_id: record.record_id,
                detail,
            }),
            Err(detail) => Err(self.invariant_violation(record.record_id, detail).await),
        }
    }

    /// Flag the record and build the error to surface. Never corrects data.
    async fn invariant_violation(&self, record_id: Uuid, detail: String) -> LedgerError {
        record_invariant_violation();
        error!(record_id = %record_id, detail = %detail, "Ledger invariant violated; flagging for review");

        if let Err(e) = self
            .with_deadline(self.store.flag_for_review(record_id, &detail, SYSTEM_ACTOR))
            .await
        {
            error!(record_id = %record_id, error = %e, "Failed to flag record for review");
        }

        LedgerError::InvariantViolation { record_id, detail }
    }

    /// One optimistic read-modify-write attempt.
    async fn try_mutate<F>(&self, record_id: Uuid, mutate: F) -> Result<BillingRecord, LedgerError>
    where
        F: FnOnce(&mut BillingRecord, DateTime<Utc>) -> Result<(LedgerChange, AuditEntry), LedgerError>,
    {
        let mut record = self.load_for_write(record_id).await?;
        let expected_version = record.version;

        let (change, audit) = mutate(&mut record, Utc::now())?;

        self.with_deadline(
            self.store
                .apply_change(&record, expected_version, &change, &audit),
        )
        .await?;
        Ok(record)
    }

    async fn retry_on_conflict<T, F, Fut>(
        &self,
        operation: &'static str,
        record_id: Uuid,
        mut attempt_fn: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0;

        loop {
            match attempt_fn().await {
                Err(LedgerError::ConcurrencyConflict(_)) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    record_retry(operation);
                    warn!(
                        operation,
                        record_id = %record_id,
                        attempt,
                        "Concurrent update detected, retrying against fresh state"
                    );
                    tokio::time::sleep(self.settings.backoff_duration(attempt)).await;
                }
                Err(LedgerError::ConcurrencyConflict(id)) => {
                    warn!(
                        operation,
                        record_id = %record_id,
                        attempts = attempt + 1,
                        "Concurrent update retries exhausted"
                    );
                    return Err(LedgerError::ConcurrencyConflict(id));
                }
                other => return other,
            }
        }
    }

    async fn with_deadline<T, Fut>(&self, fut: Fut) -> Result<T, LedgerError>
    where
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        tokio::time::timeout(self.settings.operation_timeout, fut)
            .await
            .map_err(|_| {
                LedgerError::Storage(anyhow::anyhow!(
                    "storage call exceeded deadline of {:?}",
                    self.settings.operation_timeout
                ))
            })?
    }

    fn finish<T>(
        &self,
        operation: &str,
        started: Instant,
        result: Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        OPERATION_DURATION
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => record_operation(operation, "ok"),
            Err(e) => {
                record_operation(operation, "error");
                record_error(e.kind());
                warn!(operation, error = %e, "Ledger operation rejected");
            }
        }
        result
    }
}

// -----------------------------------------------------------------------------
// Record mutations
// -----------------------------------------------------------------------------

fn validate_scale(amount: Decimal, what: &str) -> Result<(), LedgerError> {
    if amount.abs() > balance::MAX_AMOUNT {
        return Err(LedgerError::InvalidAmount(format!(
            "{} {} exceeds the largest storable amount {}",
            what, amount, balance::MAX_AMOUNT
        )));
    }
    if amount.normalize().scale() > MINOR_UNIT_SCALE {
        return Err(LedgerError::InvalidAmount(format!(
            "{} {} has more than {} decimal places",
            what, amount, MINOR_UNIT_SCALE
        )));
    }
    Ok(())
}

fn validate_amount(amount: Decimal, what: &str) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "{} must be greater than zero, got {}",
            what, amount
        )));
    }
    validate_scale(amount, what)
}

fn to_json<T: serde::Serialize>(value: &T) -> Option<serde_json::Value> {
    serde_json::to_value(value).ok()
}

fn creation_snapshot(record: &BillingRecord) -> serde_json::Value {
    json!({
        "period": record.period,
        "fee_config_id": record.fee_config_id,
        "currency": record.currency,
        "balance_brought_forward": record.balance_brought_forward,
        "base_bill": record.base_bill,
        "fee_breakdown": record.fee_breakdown,
        "total_billed": record.total_billed,
        "carried_forward_from": record.carried_forward_from,
    })
}

/// Append a charge to `record` and refresh its totals.
pub fn apply_charge(
    record: &mut BillingRecord,
    input: &NewCharge,
    actor_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(LedgerChange, AuditEntry), LedgerError> {
    if record.is_locked {
        return Err(LedgerError::LockedRecord(record.record_id));
    }

    let charge = Charge {
        charge_id: Uuid::new_v4(),
        sequence: record.next_charge_sequence(),
        category: input.category,
        particulars: input.particulars.trim().to_string(),
        amount: input.amount,
        reference: input.reference.clone(),
        notes: input.notes.clone(),
        added_by: actor_id,
        added_utc: now,
    };
    record.charges.push(charge.clone());
    balance::refresh(record)?;

    let audit = record.record_audit(
        AuditAction::ChargeAdded,
        actor_id,
        None,
        to_json(&charge),
        None,
        now,
    );
    record.touch(actor_id, now);
    Ok((LedgerChange::ChargeAdded(charge), audit))
}

/// Link a payment to `record` and refresh its totals.
pub fn apply_payment_link(
    record: &mut BillingRecord,
    input: &NewPayment,
    actor_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(LedgerChange, AuditEntry), LedgerError> {
    if record.find_payment(&input.payment_id).is_some() {
        return Err(LedgerError::DuplicatePayment {
            record_id: record.record_id,
            payment_id: input.payment_id.clone(),
        });
    }
    if record.is_locked {
        return Err(LedgerError::LockedRecord(record.record_id));
    }

    let payment = PaymentRef {
        payment_id: input.payment_id.clone(),
        sequence: record.next_payment_sequence(),
        amount: input.amount,
        paid_on: input.paid_on,
        receipt_number: input.receipt_number.clone(),
        method: input.method.clone(),
        linked_by: actor_id,
        linked_utc: now,
    };
    record.linked_payments.push(payment.clone());
    balance::refresh(record)?;

    let audit = record.record_audit(
        AuditAction::PaymentLinked,
        actor_id,
        None,
        to_json(&payment),
        None,
        now,
    );
    record.touch(actor_id, now);
    Ok((LedgerChange::PaymentLinked(payment), audit))
}

/// Remove one payment link from `record` and refresh its totals.
pub fn apply_payment_unlink(
    record: &mut BillingRecord,
    payment_id: &str,
    reason: Option<&str>,
    actor_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(LedgerChange, AuditEntry), LedgerError> {
    if record.is_locked {
        return Err(LedgerError::LockedRecord(record.record_id));
    }
    let position = record
        .linked_payments
        .iter()
        .position(|p| p.payment_id == payment_id)
        .ok_or_else(|| LedgerError::PaymentNotLinked {
            record_id: record.record_id,
            payment_id: payment_id.to_string(),
        })?;

    let removed = record.linked_payments.remove(position);
    balance::refresh(record)?;

    let audit = record.record_audit(
        AuditAction::PaymentUnlinked,
        actor_id,
        to_json(&removed),
        Some(json!({
            "unlinked_payment_id": removed.payment_id,
            "amount": removed.amount,
        })),
        reason.map(str::to_string),
        now,
    );
    record.touch(actor_id, now);
    Ok((LedgerChange::PaymentUnlinked(removed), audit))
}

/// Freeze `source` and point it at its successor.
fn lock_for_carry_forward(
    source: &mut BillingRecord,
    successor_id: Uuid,
    next_period: &PeriodKey,
    actor_id: Uuid,
    now: DateTime<Utc>,
) -> AuditEntry {
    let carried = source.current_balance;
    source.carried_forward_to = Some(successor_id);
    source.is_current = false;
    source.is_locked = true;
    source.locked_utc = Some(now);

    let audit = source.record_audit(
        AuditAction::ArrearsCarriedForward,
        actor_id,
        None,
        Some(json!({
            "successor_id": successor_id,
            "carried_amount": carried,
            "next_period": next_period,
        })),
        None,
        now,
    );
    source.touch(actor_id, now);
    audit
}

fn check_successor_config(
    source: &BillingRecord,
    period: &PeriodKey,
    config: &FeeConfiguration,
) -> Result<(), LedgerError> {
    if config.school_id != source.school_id || config.site_id != source.site_id {
        return Err(LedgerError::InvalidInput(format!(
            "fee configuration {} belongs to a different school or site",
            config.fee_config_id
        )));
    }
    if !config.period.same_slot(period) {
        return Err(LedgerError::InvalidInput(format!(
            "fee configuration {} is for {}, not {}",
            config.fee_config_id, config.period, period
        )));
    }
    if config.currency != source.currency {
        return Err(LedgerError::InvalidInput(format!(
            "fee configuration {} bills in {}, record bills in {}",
            config.fee_config_id, config.currency, source.currency
        )));
    }
    Ok(())
}

/// Every carried-forward record's closing balance must reappear as its
/// successor's brought-forward balance.
fn check_chain_conservation(chain: &[BillingRecord]) -> Result<(), LedgerError> {
    for record in chain {
        let Some(successor_id) = record.carried_forward_to else {
            continue;
        };
        let Some(successor) = chain.iter().find(|r| r.record_id == successor_id) else {
            continue;
        };
        if successor.balance_brought_forward != record.current_balance {
            record_invariant_violation();
            return Err(LedgerError::InvariantViolation {
                record_id: record.record_id,
                detail: format!(
                    "closing balance {} but successor {} brought forward {}",
                    record.current_balance, successor_id, successor.balance_brought_forward
                ),
            });
        }
    }
    Ok(())
}
