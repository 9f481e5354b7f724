//! Services module for student-ledger-service.

pub mod balance;
pub mod database;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use ledger::{CarryForwardOutcome, LedgerService, LedgerSettings, NextPeriod};
pub use memory::MemoryLedgerStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::{FeeConfigProvider, LedgerChange, LedgerStore, StaticFeeConfigs};
