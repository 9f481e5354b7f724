//! PostgreSQL store for student-ledger-service.
//!
//! Record headers live in `billing_records`; charges, payment links and audit
//! entries live in their own tables keyed by (record_id, sequence). Every
//! write runs in one transaction whose first statement is the version-checked
//! header update, so a stale writer changes nothing.

use crate::error::LedgerError;
use crate::models::{
    AuditAction, AuditEntry, BillingRecord, BillingStatus, Charge, ChargeCategory,
    FeeConfiguration, FeeItem, PaymentRef, PeriodKey, PeriodType,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{FeeConfigProvider, LedgerChange, LedgerStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const RECORD_COLUMNS: &str = r#"
    record_id, student_id, school_id, site_id, class_id, academic_year, period_type,
    period_number, fee_config_id, currency, payment_due_date, balance_brought_forward,
    base_bill, fee_breakdown, charges_total, total_billed, total_paid, current_balance,
    billing_status, is_locked, is_current, carried_forward_from, carried_forward_to,
    review_reason, created_by, last_modified_by, created_utc, updated_utc, locked_utc, version
"#;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct RecordRow {
    record_id: Uuid,
    student_id: Uuid,
    school_id: Uuid,
    site_id: Uuid,
    class_id: Uuid,
    academic_year: String,
    period_type: String,
    period_number: i16,
    fee_config_id: Option<Uuid>,
    currency: String,
    payment_due_date: Option<NaiveDate>,
    balance_brought_forward: Decimal,
    base_bill: Decimal,
    fee_breakdown: Json<Vec<FeeItem>>,
    charges_total: Decimal,
    total_billed: Decimal,
    total_paid: Decimal,
    current_balance: Decimal,
    billing_status: String,
    is_locked: bool,
    is_current: bool,
    carried_forward_from: Option<Uuid>,
    carried_forward_to: Option<Uuid>,
    review_reason: Option<String>,
    created_by: Uuid,
    last_modified_by: Uuid,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    locked_utc: Option<DateTime<Utc>>,
    version: i64,
}

#[derive(Debug, FromRow)]
struct ChargeRow {
    record_id: Uuid,
    sequence: i32,
    charge_id: Uuid,
    category: String,
    particulars: String,
    amount: Decimal,
    reference: Option<String>,
    notes: Option<String>,
    added_by: Uuid,
    added_utc: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    record_id: Uuid,
    payment_id: String,
    sequence: i32,
    amount: Decimal,
    paid_on: NaiveDate,
    receipt_number: Option<String>,
    method: Option<String>,
    linked_by: Uuid,
    linked_utc: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct AuditRow {
    record_id: Uuid,
    sequence: i32,
    entry_id: Uuid,
    action: String,
    actor_id: Uuid,
    old_value: Option<serde_json::Value>,
    new_value: Option<serde_json::Value>,
    reason: Option<String>,
    recorded_utc: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct FeeConfigRow {
    fee_config_id: Uuid,
    school_id: Uuid,
    site_id: Uuid,
    class_id: Uuid,
    academic_year: String,
    period_type: String,
    period_number: i16,
    base_bill: Decimal,
    fee_items: Json<Vec<FeeItem>>,
    currency: String,
    payment_due_date: Option<NaiveDate>,
}

fn db_error(context: &str, e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(anyhow::anyhow!("{}: {}", context, e))
}

fn corrupt(what: &str, value: &str) -> LedgerError {
    LedgerError::Storage(anyhow::anyhow!("unknown {} '{}' in storage", what, value))
}

fn parse_period_type(value: &str) -> Result<PeriodType, LedgerError> {
    PeriodType::from_string(value).ok_or_else(|| corrupt("period type", value))
}

/// Map uniqueness violations on record insert to `Conflict`.
fn insert_error(record: &BillingRecord, e: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            let detail = match db_err.constraint() {
                Some("billing_records_period_key") => format!(
                    "student {} already has a billing record for {}",
                    record.student_id, record.period
                ),
                Some("billing_records_one_current") => format!(
                    "student {} already has a current billing record at site {}",
                    record.student_id, record.site_id
                ),
                Some("billing_records_single_successor") => format!(
                    "billing record {:?} already has a successor",
                    record.carried_forward_from
                ),
                _ => format!("billing record {} already exists", record.record_id),
            };
            return LedgerError::Conflict(detail);
        }
    }
    db_error("Failed to insert billing record", e)
}

impl RecordRow {
    fn into_record(
        self,
        charges: Vec<Charge>,
        linked_payments: Vec<PaymentRef>,
        audit_trail: Vec<AuditEntry>,
    ) -> Result<BillingRecord, LedgerError> {
        let period_type = parse_period_type(&self.period_type)?;
        let billing_status = BillingStatus::from_string(&self.billing_status)
            .ok_or_else(|| corrupt("billing status", &self.billing_status))?;

        Ok(BillingRecord {
            record_id: self.record_id,
            student_id: self.student_id,
            school_id: self.school_id,
            site_id: self.site_id,
            period: PeriodKey::new(
                self.academic_year,
                period_type,
                self.period_number,
                self.class_id,
            ),
            fee_config_id: self.fee_config_id,
            currency: self.currency,
            payment_due_date: self.payment_due_date,
            balance_brought_forward: self.balance_brought_forward,
            base_bill: self.base_bill,
            fee_breakdown: self.fee_breakdown.0,
            charges_total: self.charges_total,
            total_billed: self.total_billed,
            total_paid: self.total_paid,
            current_balance: self.current_balance,
            billing_status,
            charges,
            linked_payments,
            audit_trail,
            is_locked: self.is_locked,
            is_current: self.is_current,
            carried_forward_from: self.carried_forward_from,
            carried_forward_to: self.carried_forward_to,
            review_reason: self.review_reason,
            created_by: self.created_by,
            last_modified_by: self.last_modified_by,
            created_utc: self.created_utc,
            updated_utc: self.updated_utc,
            locked_utc: self.locked_utc,
            version: self.version,
        })
    }
}

impl ChargeRow {
    fn into_charge(self) -> Result<Charge, LedgerError> {
        let category = ChargeCategory::from_string(&self.category)
            .ok_or_else(|| corrupt("charge category", &self.category))?;
        Ok(Charge {
            charge_id: self.charge_id,
            sequence: self.sequence,
            category,
            particulars: self.particulars,
            amount: self.amount,
            reference: self.reference,
            notes: self.notes,
            added_by: self.added_by,
            added_utc: self.added_utc,
        })
    }
}

impl PaymentRow {
    fn into_payment(self) -> PaymentRef {
        PaymentRef {
            payment_id: self.payment_id,
            sequence: self.sequence,
            amount: self.amount,
            paid_on: self.paid_on,
            receipt_number: self.receipt_number,
            method: self.method,
            linked_by: self.linked_by,
            linked_utc: self.linked_utc,
        }
    }
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, LedgerError> {
        let action = AuditAction::from_string(&self.action)
            .ok_or_else(|| corrupt("audit action", &self.action))?;
        Ok(AuditEntry {
            entry_id: self.entry_id,
            sequence: self.sequence,
            action,
            actor_id: self.actor_id,
            old_value: self.old_value,
            new_value: self.new_value,
            reason: self.reason,
            recorded_utc: self.recorded_utc,
        })
    }
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "student-ledger-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a fee configuration. The ledger never calls this; it exists for
    /// seeding and tests.
    #[instrument(skip(self, config), fields(fee_config_id = %config.fee_config_id))]
    pub async fn upsert_fee_configuration(&self, config: &FeeConfiguration) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO fee_configurations (fee_config_id, school_id, site_id, class_id, academic_year,
                period_type, period_number, base_bill, fee_items, currency, payment_due_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (fee_config_id) DO UPDATE SET
                base_bill = EXCLUDED.base_bill,
                fee_items = EXCLUDED.fee_items,
                payment_due_date = EXCLUDED.payment_due_date
            "#,
        )
        .bind(config.fee_config_id)
        .bind(config.school_id)
        .bind(config.site_id)
        .bind(config.period.class_id)
        .bind(&config.period.academic_year)
        .bind(config.period.period_type.as_str())
        .bind(config.period.period_number)
        .bind(config.base_bill)
        .bind(Json(&config.items))
        .bind(&config.currency)
        .bind(config.payment_due_date)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to save fee configuration: {}", e))
        })?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Begin a read-only snapshot so a header and its history are read from
    /// the same committed state.
    async fn begin_snapshot(&self) -> Result<Transaction<'_, Postgres>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to set snapshot isolation", e))?;
        Ok(tx)
    }

    /// Load headers matching `filter` together with their history.
    async fn load_records(
        &self,
        operation: &str,
        filter: &str,
        bind: impl FnOnce(
            sqlx::query::QueryAs<'_, Postgres, RecordRow, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::QueryAs<'_, Postgres, RecordRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<BillingRecord>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let mut tx = self.begin_snapshot().await?;

        let sql = format!("SELECT {} FROM billing_records WHERE {}", RECORD_COLUMNS, filter);
        let rows = bind(sqlx::query_as::<_, RecordRow>(&sql))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to load billing records", e))?;

        if rows.is_empty() {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.record_id).collect();

        let charge_rows = sqlx::query_as::<_, ChargeRow>(
            r#"
            SELECT record_id, sequence, charge_id, category, particulars, amount, reference, notes, added_by, added_utc
            FROM billing_charges
            WHERE record_id = ANY($1)
            ORDER BY record_id, sequence
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to load charges", e))?;

        let payment_rows = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT record_id, payment_id, sequence, amount, paid_on, receipt_number, method, linked_by, linked_utc
            FROM billing_payment_links
            WHERE record_id = ANY($1)
            ORDER BY record_id, sequence
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to load payment links", e))?;

        let audit_rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT record_id, sequence, entry_id, action, actor_id, old_value, new_value, reason, recorded_utc
            FROM billing_audit_entries
            WHERE record_id = ANY($1)
            ORDER BY record_id, sequence
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to load audit trail", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to close snapshot", e))?;

        let mut charges: HashMap<Uuid, Vec<Charge>> = HashMap::new();
        for row in charge_rows {
            charges
                .entry(row.record_id)
                .or_default()
                .push(row.into_charge()?);
        }
        let mut payments: HashMap<Uuid, Vec<PaymentRef>> = HashMap::new();
        for row in payment_rows {
            payments
                .entry(row.record_id)
                .or_default()
                .push(row.into_payment());
        }
        let mut audits: HashMap<Uuid, Vec<AuditEntry>> = HashMap::new();
        for row in audit_rows {
            audits
                .entry(row.record_id)
                .or_default()
                .push(row.into_entry()?);
        }

        let records = rows
            .into_iter()
            .map(|row| {
                let id = row.record_id;
                row.into_record(
                    charges.remove(&id).unwrap_or_default(),
                    payments.remove(&id).unwrap_or_default(),
                    audits.remove(&id).unwrap_or_default(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        timer.observe_duration();
        Ok(records)
    }

    // -------------------------------------------------------------------------
    // Write helpers
    // -------------------------------------------------------------------------

    async fn insert_header(
        tx: &mut Transaction<'_, Postgres>,
        record: &BillingRecord,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO billing_records (record_id, student_id, school_id, site_id, class_id, academic_year,
                period_type, period_number, fee_config_id, currency, payment_due_date, balance_brought_forward,
                base_bill, fee_breakdown, charges_total, total_billed, total_paid, current_balance,
                billing_status, is_locked, is_current, carried_forward_from, carried_forward_to,
                review_reason, created_by, last_modified_by, created_utc, updated_utc, locked_utc, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30)
            "#,
        )
        .bind(record.record_id)
        .bind(record.student_id)
        .bind(record.school_id)
        .bind(record.site_id)
        .bind(record.period.class_id)
        .bind(&record.period.academic_year)
        .bind(record.period.period_type.as_str())
        .bind(record.period.period_number)
        .bind(record.fee_config_id)
        .bind(&record.currency)
        .bind(record.payment_due_date)
        .bind(record.balance_brought_forward)
        .bind(record.base_bill)
        .bind(Json(&record.fee_breakdown))
        .bind(record.charges_total)
        .bind(record.total_billed)
        .bind(record.total_paid)
        .bind(record.current_balance)
        .bind(record.billing_status.as_str())
        .bind(record.is_locked)
        .bind(record.is_current)
        .bind(record.carried_forward_from)
        .bind(record.carried_forward_to)
        .bind(&record.review_reason)
        .bind(record.created_by)
        .bind(record.last_modified_by)
        .bind(record.created_utc)
        .bind(record.updated_utc)
        .bind(record.locked_utc)
        .bind(record.version)
        .execute(&mut **tx)
        .await
        .map_err(|e| insert_error(record, e))?;
        Ok(())
    }

    /// Version-checked header update. Must be the first write of a unit.
    async fn update_header(
        tx: &mut Transaction<'_, Postgres>,
        record: &BillingRecord,
        expected_version: i64,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE billing_records
            SET charges_total = $3, total_billed = $4, total_paid = $5, current_balance = $6,
                billing_status = $7, is_locked = $8, is_current = $9, carried_forward_to = $10,
                last_modified_by = $11, updated_utc = $12, locked_utc = $13, version = $14
            WHERE record_id = $1 AND version = $2
            "#,
        )
        .bind(record.record_id)
        .bind(expected_version)
        .bind(record.charges_total)
        .bind(record.total_billed)
        .bind(record.total_paid)
        .bind(record.current_balance)
        .bind(record.billing_status.as_str())
        .bind(record.is_locked)
        .bind(record.is_current)
        .bind(record.carried_forward_to)
        .bind(record.last_modified_by)
        .bind(record.updated_utc)
        .bind(record.locked_utc)
        .bind(record.version)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to update billing record", e))?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT version FROM billing_records WHERE record_id = $1")
                    .bind(record.record_id)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| db_error("Failed to read record version", e))?;
            return Err(match exists {
                Some(stored) => {
                    warn!(
                        record_id = %record.record_id,
                        stored_version = stored,
                        expected_version,
                        "Stale write rejected"
                    );
                    LedgerError::ConcurrencyConflict(record.record_id)
                }
                None => LedgerError::NotFound(format!("billing record {}", record.record_id)),
            });
        }
        Ok(())
    }

    async fn insert_charge(
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
        charge: &Charge,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO billing_charges (record_id, sequence, charge_id, category, particulars, amount,
                reference, notes, added_by, added_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record_id)
        .bind(charge.sequence)
        .bind(charge.charge_id)
        .bind(charge.category.as_str())
        .bind(&charge.particulars)
        .bind(charge.amount)
        .bind(&charge.reference)
        .bind(&charge.notes)
        .bind(charge.added_by)
        .bind(charge.added_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("Failed to insert charge", e))?;
        Ok(())
    }

    async fn insert_payment(
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
        payment: &PaymentRef,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO billing_payment_links (record_id, payment_id, sequence, amount, paid_on,
                receipt_number, method, linked_by, linked_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record_id)
        .bind(&payment.payment_id)
        .bind(payment.sequence)
        .bind(payment.amount)
        .bind(payment.paid_on)
        .bind(&payment.receipt_number)
        .bind(&payment.method)
        .bind(payment.linked_by)
        .bind(payment.linked_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                LedgerError::DuplicatePayment {
                    record_id,
                    payment_id: payment.payment_id.clone(),
                }
            }
            _ => db_error("Failed to link payment", e),
        })?;
        Ok(())
    }

    async fn insert_audit(
        tx: &mut Transaction<'_, Postgres>,
        record_id: Uuid,
        entry: &AuditEntry,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_entries (record_id, sequence, entry_id, action, actor_id,
                old_value, new_value, reason, recorded_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record_id)
        .bind(entry.sequence)
        .bind(entry.entry_id)
        .bind(entry.action.as_str())
        .bind(entry.actor_id)
        .bind(&entry.old_value)
        .bind(&entry.new_value)
        .bind(&entry.reason)
        .bind(entry.recorded_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| match e {
            // Another writer appended at this sequence first.
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                LedgerError::ConcurrencyConflict(record_id)
            }
            _ => db_error("Failed to append audit entry", e),
        })?;
        Ok(())
    }

    /// Insert a header with its history rows.
    async fn insert_full(
        tx: &mut Transaction<'_, Postgres>,
        record: &BillingRecord,
    ) -> Result<(), LedgerError> {
        Self::insert_header(tx, record).await?;
        for charge in &record.charges {
            Self::insert_charge(tx, record.record_id, charge).await?;
        }
        for payment in &record.linked_payments {
            Self::insert_payment(tx, record.record_id, payment).await?;
        }
        for entry in &record.audit_trail {
            Self::insert_audit(tx, record.record_id, entry).await?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self, record), fields(record_id = %record.record_id, student_id = %record.student_id))]
    async fn insert_record(&self, record: &BillingRecord) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_record"])
            .start_timer();

        let mut tx = self.begin().await?;
        Self::insert_full(&mut tx, record).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit billing record", e))?;

        timer.observe_duration();
        Ok(())
    }

    async fn get_record(&self, record_id: Uuid) -> Result<Option<BillingRecord>, LedgerError> {
        let mut records = self
            .load_records("get_record", "record_id = $1", |q| q.bind(record_id))
            .await?;
        Ok(records.pop())
    }

    async fn find_by_slot(
        &self,
        student_id: Uuid,
        site_id: Uuid,
        period: &PeriodKey,
    ) -> Result<Option<BillingRecord>, LedgerError> {
        let mut records = self
            .load_records(
                "find_by_slot",
                "student_id = $1 AND site_id = $2 AND academic_year = $3 AND period_type = $4 AND period_number = $5",
                |q| {
                    q.bind(student_id)
                        .bind(site_id)
                        .bind(period.academic_year.clone())
                        .bind(period.period_type.as_str())
                        .bind(period.period_number)
                },
            )
            .await?;
        Ok(records.pop())
    }

    async fn find_current(
        &self,
        student_id: Uuid,
        site_id: Uuid,
    ) -> Result<Option<BillingRecord>, LedgerError> {
        let mut records = self
            .load_records(
                "find_current",
                "student_id = $1 AND site_id = $2 AND is_current",
                |q| q.bind(student_id).bind(site_id),
            )
            .await?;
        Ok(records.pop())
    }

    async fn list_for_student(
        &self,
        student_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<BillingRecord>, LedgerError> {
        self.load_records(
            "list_for_student",
            "student_id = $1 AND ($2::uuid IS NULL OR site_id = $2) ORDER BY academic_year, period_number, created_utc",
            |q| q.bind(student_id).bind(site_id),
        )
        .await
    }

    async fn list_flagged(&self) -> Result<Vec<BillingRecord>, LedgerError> {
        self.load_records(
            "list_flagged",
            "review_reason IS NOT NULL ORDER BY updated_utc",
            |q| q,
        )
        .await
    }

    #[instrument(skip(self, record, change, audit), fields(record_id = %record.record_id, operation = change.operation()))]
    async fn apply_change(
        &self,
        record: &BillingRecord,
        expected_version: i64,
        change: &LedgerChange,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[change.operation()])
            .start_timer();

        let mut tx = self.begin().await?;
        Self::update_header(&mut tx, record, expected_version).await?;

        match change {
            LedgerChange::ChargeAdded(charge) => {
                Self::insert_charge(&mut tx, record.record_id, charge).await?;
            }
            LedgerChange::PaymentLinked(payment) => {
                Self::insert_payment(&mut tx, record.record_id, payment).await?;
            }
            LedgerChange::PaymentUnlinked(payment) => {
                let result = sqlx::query(
                    "DELETE FROM billing_payment_links WHERE record_id = $1 AND payment_id = $2",
                )
                .bind(record.record_id)
                .bind(&payment.payment_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to unlink payment", e))?;

                if result.rows_affected() == 0 {
                    return Err(LedgerError::PaymentNotLinked {
                        record_id: record.record_id,
                        payment_id: payment.payment_id.clone(),
                    });
                }
            }
            LedgerChange::CarriedForward { .. } => {}
        }

        Self::insert_audit(&mut tx, record.record_id, audit).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit ledger change", e))?;

        timer.observe_duration();
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
        let timer = DB_QUERY_DURATION
            .with_label_values(&["carry_forward"])
            .start_timer();

        // The source stops being current before the successor is inserted so
        // the one-current index holds at every statement; the source's pointer
        // to the successor is checked at commit.
        let mut tx = self.begin().await?;
        Self::update_header(&mut tx, source, expected_version).await?;
        Self::insert_full(&mut tx, successor).await?;
        Self::insert_audit(&mut tx, source.record_id, audit).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit carry-forward", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn flag_for_review(
        &self,
        record_id: Uuid,
        reason: &str,
        actor_id: Uuid,
    ) -> Result<(), LedgerError> {
        let mut tx = self.begin().await?;

        let locked: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM billing_records WHERE record_id = $1 FOR UPDATE",
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to lock billing record", e))?;
        if locked.is_none() {
            return Err(LedgerError::NotFound(format!("billing record {}", record_id)));
        }

        let next_sequence: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM billing_audit_entries WHERE record_id = $1",
        )
        .bind(record_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to read audit sequence", e))?;

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE billing_records
            SET review_reason = $2, last_modified_by = $3, updated_utc = $4, version = version + 1
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .bind(reason)
        .bind(actor_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to flag billing record", e))?;

        let entry = AuditEntry {
            entry_id: Uuid::new_v4(),
            sequence: next_sequence,
            action: AuditAction::FlaggedForReview,
            actor_id,
            old_value: None,
            new_value: Some(serde_json::json!({ "reason": reason })),
            reason: Some(reason.to_string()),
            recorded_utc: now,
        };
        Self::insert_audit(&mut tx, record_id, &entry).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit review flag", e))?;

        warn!(record_id = %record_id, reason, "Billing record flagged for review");
        Ok(())
    }
}

#[async_trait]
impl FeeConfigProvider for Database {
    #[instrument(skip(self))]
    async fn fee_configuration(
        &self,
        fee_config_id: Uuid,
    ) -> Result<Option<FeeConfiguration>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fee_configuration"])
            .start_timer();

        let row = sqlx::query_as::<_, FeeConfigRow>(
            r#"
            SELECT fee_config_id, school_id, site_id, class_id, academic_year, period_type, period_number,
                   base_bill, fee_items, currency, payment_due_date
            FROM fee_configurations
            WHERE fee_config_id = $1
            "#,
        )
        .bind(fee_config_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load fee configuration", e))?;

        timer.observe_duration();

        row.map(|row| {
            Ok(FeeConfiguration {
                fee_config_id: row.fee_config_id,
                school_id: row.school_id,
                site_id: row.site_id,
                period: PeriodKey::new(
                    row.academic_year,
                    parse_period_type(&row.period_type)?,
                    row.period_number,
                    row.class_id,
                ),
                base_bill: row.base_bill,
                items: row.fee_items.0,
                currency: row.currency,
                payment_due_date: row.payment_due_date,
            })
        })
        .transpose()
    }
}
