//! Charge ledger tests.

mod common;

use common::{spawn_ledger, BURSAR};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use student_ledger_service::models::{AuditAction, BillingStatus, ChargeCategory, NewCharge};
use student_ledger_service::services::{balance, NextPeriod};
use student_ledger_service::LedgerError;
use uuid::Uuid;

#[tokio::test]
async fn add_charge_updates_totals_and_status() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(1000), dec!(200)).await;

    let updated = ledger
        .service
        .add_charge(
            record.record_id,
            NewCharge::new(ChargeCategory::Transport, "Bus fare, first half", dec!(150))
                .with_reference("TR-001"),
            BURSAR,
        )
        .await
        .unwrap();

    assert_eq!(updated.charges_total, dec!(150));
    assert_eq!(updated.total_billed, dec!(1350));
    assert_eq!(updated.current_balance, dec!(1350));
    assert_eq!(updated.billing_status, BillingStatus::Owing);
    assert_eq!(updated.version, record.version + 1);

    let charge = &updated.charges[0];
    assert_eq!(charge.sequence, 1);
    assert_eq!(charge.category, ChargeCategory::Transport);
    assert_eq!(charge.reference.as_deref(), Some("TR-001"));
    assert_eq!(charge.added_by, BURSAR);

    let audit = updated.audit_trail.last().unwrap();
    assert_eq!(audit.action, AuditAction::ChargeAdded);
    assert_eq!(audit.sequence, 2);
}

#[tokio::test]
async fn charges_are_appended_in_order() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(100), Decimal::ZERO).await;

    for (category, amount) in [
        (ChargeCategory::Books, dec!(45.50)),
        (ChargeCategory::Feeding, dec!(120)),
        (ChargeCategory::Excursion, dec!(0.10)),
    ] {
        ledger
            .service
            .add_charge(
                record.record_id,
                NewCharge::new(category, category.to_string(), amount),
                BURSAR,
            )
            .await
            .unwrap();
    }

    let stored = ledger.service.get_record(record.record_id).await.unwrap();
    let sequences: Vec<i32> = stored.charges.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(stored.charges_total, dec!(165.60));
    assert_eq!(stored.total_billed, dec!(265.60));
    assert_eq!(stored.audit_trail.len(), 4);
}

#[tokio::test]
async fn add_charge_rejects_non_positive_amounts() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(100), Decimal::ZERO).await;

    for amount in [Decimal::ZERO, dec!(-5), dec!(1.001)] {
        let result = ledger
            .service
            .add_charge(
                record.record_id,
                NewCharge::new(ChargeCategory::Penalty, "Late fee", amount),
                BURSAR,
            )
            .await;
        assert!(
            matches!(result, Err(LedgerError::InvalidAmount(_))),
            "amount {} should be rejected",
            amount
        );
    }

    let stored = ledger.service.get_record(record.record_id).await.unwrap();
    assert!(stored.charges.is_empty());
    assert_eq!(stored.version, record.version);
}

#[tokio::test]
async fn add_charge_rejects_blank_particulars() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(100), Decimal::ZERO).await;

    let result = ledger
        .service
        .add_charge(
            record.record_id,
            NewCharge::new(ChargeCategory::Other, "   ", dec!(10)),
            BURSAR,
        )
        .await;

    assert!(matches!(result, Err(LedgerError::InvalidInput(_))));
}

#[tokio::test]
async fn add_charge_unknown_record_is_not_found() {
    let ledger = spawn_ledger();

    let result = ledger
        .service
        .add_charge(
            Uuid::new_v4(),
            NewCharge::new(ChargeCategory::Uniform, "Sweater", dec!(80)),
            BURSAR,
        )
        .await;

    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}

#[tokio::test]
async fn add_charge_on_locked_record_leaves_totals_unchanged() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(400), Decimal::ZERO).await;

    let outcome = ledger
        .service
        .carry_forward(record.record_id, NextPeriod::new(ledger.term(2)), BURSAR)
        .await
        .unwrap();

    let result = ledger
        .service
        .add_charge(
            record.record_id,
            NewCharge::new(ChargeCategory::Examination, "Mock exams", dec!(60)),
            BURSAR,
        )
        .await;
    assert!(matches!(result, Err(LedgerError::LockedRecord(id)) if id == record.record_id));

    let stored = ledger.service.get_record(record.record_id).await.unwrap();
    assert_eq!(stored.total_billed, outcome.source.total_billed);
    assert_eq!(stored.version, outcome.source.version);
    assert!(stored.charges.is_empty());
}

#[tokio::test]
async fn charge_beyond_storable_range_is_invalid_amount() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(1000), Decimal::ZERO).await;

    for amount in [Decimal::MAX, balance::MAX_AMOUNT] {
        let result = ledger
            .service
            .add_charge(
                record.record_id,
                NewCharge::new(ChargeCategory::Other, "Oversized", amount),
                BURSAR,
            )
            .await;
        assert!(
            matches!(result, Err(LedgerError::InvalidAmount(_))),
            "{amount} was accepted"
        );
    }

    let stored = ledger.service.get_record(record.record_id).await.unwrap();
    assert_eq!(stored.total_billed, dec!(1000));
    assert!(stored.charges.is_empty());
    assert_eq!(stored.version, record.version);
}
