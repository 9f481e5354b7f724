//! Common test utilities for student-ledger-service integration tests.
#![allow(dead_code)]

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::{Arc, Once};
use std::time::Duration;
use student_ledger_service::models::{
    BillingRecord, FeeConfiguration, FeeItem, PeriodKey, PeriodType,
};
use student_ledger_service::services::{
    LedgerService, LedgerSettings, LedgerStore, MemoryLedgerStore, StaticFeeConfigs,
};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Bursar who performs most test operations.
pub const BURSAR: Uuid = Uuid::from_u128(0x0b05_a700_0000_0000_0000_0000_0000_0001);

pub const ACADEMIC_YEAR: &str = "2024/2025";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,student_ledger_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Settings with short backoff so retry tests stay fast.
pub fn fast_settings() -> LedgerSettings {
    LedgerSettings {
        max_retries: 3,
        retry_backoff: Duration::from_millis(1),
        operation_timeout: Duration::from_secs(5),
    }
}

pub fn paid_on() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, 1).expect("valid date")
}

/// A ledger over in-memory storage, scoped to one school site and class.
pub struct TestLedger {
    pub service: LedgerService,
    pub store: Arc<MemoryLedgerStore>,
    pub fee_configs: Arc<StaticFeeConfigs>,
    pub school_id: Uuid,
    pub site_id: Uuid,
    pub class_id: Uuid,
}

/// Spawn a ledger with fast retry settings.
pub fn spawn_ledger() -> TestLedger {
    spawn_ledger_with(fast_settings())
}

pub fn spawn_ledger_with(settings: LedgerSettings) -> TestLedger {
    init_tracing();

    let store = Arc::new(MemoryLedgerStore::new());
    let fee_configs = Arc::new(StaticFeeConfigs::new());
    let service = LedgerService::new(store.clone(), fee_configs.clone(), settings);

    TestLedger {
        service,
        store,
        fee_configs,
        school_id: Uuid::new_v4(),
        site_id: Uuid::new_v4(),
        class_id: Uuid::new_v4(),
    }
}

/// Build a ledger over a custom store sharing this harness's fee configurations.
pub fn ledger_over(
    store: Arc<dyn LedgerStore>,
    fee_configs: Arc<StaticFeeConfigs>,
    settings: LedgerSettings,
) -> LedgerService {
    LedgerService::new(store, fee_configs, settings)
}

impl TestLedger {
    pub fn term(&self, number: i16) -> PeriodKey {
        PeriodKey::new(ACADEMIC_YEAR, PeriodType::Term, number, self.class_id)
    }

    /// Register a term fee configuration whose items sum to `base_bill`.
    pub async fn term_config(&self, number: i16, base_bill: Decimal) -> FeeConfiguration {
        let config = FeeConfiguration {
            fee_config_id: Uuid::new_v4(),
            school_id: self.school_id,
            site_id: self.site_id,
            period: self.term(number),
            base_bill,
            items: vec![FeeItem::new("Tuition", base_bill)],
            currency: "GHS".to_string(),
            payment_due_date: NaiveDate::from_ymd_opt(2024, 9, 30),
        };
        self.fee_configs.insert(config.clone()).await;
        config
    }

    /// Create a term 1 record for a new student.
    pub async fn new_record(
        &self,
        base_bill: Decimal,
        balance_brought_forward: Decimal,
    ) -> BillingRecord {
        let config = self.term_config(1, base_bill).await;
        self.service
            .create_record(
                Uuid::new_v4(),
                config.fee_config_id,
                BURSAR,
                balance_brought_forward,
            )
            .await
            .expect("Failed to create billing record")
    }
}
