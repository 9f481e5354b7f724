//! Balance calculator.
//!
//! Pure derivation of a record's totals and status from its inputs. It knows
//! nothing about locking or storage; mutating operations call [`refresh`]
//! after changing charges or payments and before persisting, and readers call
//! [`verify`] to detect persisted totals that no longer match their inputs.

use crate::error::LedgerError;
use crate::models::{BillingRecord, BillingStatus, Charge, PaymentRef};
use rust_decimal::Decimal;

/// Largest magnitude any amount or total may reach: 17 integer digits and
/// two fractional digits, the range of a `NUMERIC(19, 2)` column.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0x89E7_FFFF, 0x8AC7_2304, 0, false, 2);

/// Derived figures for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub charges_total: Decimal,
    pub total_billed: Decimal,
    pub total_paid: Decimal,
    pub current_balance: Decimal,
    pub billing_status: BillingStatus,
}

fn checked_total(
    label: &str,
    mut amounts: impl Iterator<Item = Decimal>,
    start: Decimal,
) -> Result<Decimal, LedgerError> {
    let total = amounts.try_fold(start, |acc, amount| acc.checked_add(amount));
    match total {
        Some(total) if total.abs() <= MAX_AMOUNT => Ok(total),
        _ => Err(LedgerError::InvalidAmount(format!(
            "{} would exceed the largest storable amount {}",
            label, MAX_AMOUNT
        ))),
    }
}

/// Compute totals and status. Fails with `InvalidAmount` when a total would
/// leave the storable range.
///
/// Status is `pending` until the record has at least one charge or linked
/// payment; after that it follows the sign of the current balance.
pub fn calculate(
    balance_brought_forward: Decimal,
    base_bill: Decimal,
    charges: &[Charge],
    payments: &[PaymentRef],
) -> Result<BalanceSnapshot, LedgerError> {
    let charges_total = checked_total(
        "charges total",
        charges.iter().map(|c| c.amount),
        Decimal::ZERO,
    )?;
    let total_paid = checked_total(
        "total paid",
        payments.iter().map(|p| p.amount),
        Decimal::ZERO,
    )?;
    let total_billed = checked_total(
        "total billed",
        [base_bill, charges_total].into_iter(),
        balance_brought_forward,
    )?;
    let current_balance =
        checked_total("current balance", std::iter::once(-total_paid), total_billed)?;

    let billing_status = if charges.is_empty() && payments.is_empty() {
        BillingStatus::Pending
    } else {
        status_for(current_balance)
    };

    Ok(BalanceSnapshot {
        charges_total,
        total_billed,
        total_paid,
        current_balance,
        billing_status,
    })
}

/// Status implied by the sign of a balance once activity exists.
pub fn status_for(current_balance: Decimal) -> BillingStatus {
    if current_balance > Decimal::ZERO {
        BillingStatus::Owing
    } else if current_balance < Decimal::ZERO {
        BillingStatus::Overpaid
    } else {
        BillingStatus::Clear
    }
}

pub fn snapshot_of(record: &BillingRecord) -> Result<BalanceSnapshot, LedgerError> {
    calculate(
        record.balance_brought_forward,
        record.base_bill,
        &record.charges,
        &record.linked_payments,
    )
}

/// Write freshly derived totals onto the record. Leaves it untouched on error.
pub fn refresh(record: &mut BillingRecord) -> Result<(), LedgerError> {
    let snapshot = snapshot_of(record)?;
    record.charges_total = snapshot.charges_total;
    record.total_billed = snapshot.total_billed;
    record.total_paid = snapshot.total_paid;
    record.current_balance = snapshot.current_balance;
    record.billing_status = snapshot.billing_status;
    Ok(())
}

/// Compare persisted totals against a recomputation. Returns a description of
/// every field that disagrees.
pub fn verify(record: &BillingRecord) -> Result<(), String> {
    let expected = snapshot_of(record).map_err(|e| e.to_string())?;
    let mut mismatches = Vec::new();

    if record.charges_total != expected.charges_total {
        mismatches.push(format!(
            "charges_total {} != {}",
            record.charges_total, expected.charges_total
        ));
    }
    if record.total_billed != expected.total_billed {
        mismatches.push(format!(
            "total_billed {} != {}",
            record.total_billed, expected.total_billed
        ));
    }
    if record.total_paid != expected.total_paid {
        mismatches.push(format!(
            "total_paid {} != {}",
            record.total_paid, expected.total_paid
        ));
    }
    if record.current_balance != expected.current_balance {
        mismatches.push(format!(
            "current_balance {} != {}",
            record.current_balance, expected.current_balance
        ));
    }
    if record.billing_status != expected.billing_status {
        mismatches.push(format!(
            "billing_status {} != {}",
            record.billing_status, expected.billing_status
        ));
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(mismatches.join("; "))
    }
}
