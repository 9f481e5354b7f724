//! Student Ledger Service - per-period student billing records with
//! append-only charges, idempotent payment links and balance carry-forward.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use error::LedgerError;
