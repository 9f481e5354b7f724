//! Payment linker tests.

mod common;

use common::{paid_on, spawn_ledger, BURSAR};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use student_ledger_service::models::{AuditAction, BillingStatus, NewPayment};
use student_ledger_service::services::NextPeriod;
use student_ledger_service::LedgerError;

#[tokio::test]
async fn link_payment_clears_exact_balance() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(1000), dec!(200)).await;

    let updated = ledger
        .service
        .link_payment(
            record.record_id,
            NewPayment::new("PAY-1001", dec!(1200), paid_on())
                .with_receipt("RCT-77")
                .with_method("mobile_money"),
            BURSAR,
        )
        .await
        .unwrap();

    assert_eq!(updated.total_paid, dec!(1200));
    assert_eq!(updated.current_balance, Decimal::ZERO);
    assert_eq!(updated.billing_status, BillingStatus::Clear);

    let link = updated.find_payment("PAY-1001").unwrap();
    assert_eq!(link.sequence, 1);
    assert_eq!(link.receipt_number.as_deref(), Some("RCT-77"));
    assert_eq!(link.method.as_deref(), Some("mobile_money"));
    assert_eq!(
        updated.audit_trail.last().unwrap().action,
        AuditAction::PaymentLinked
    );
}

#[tokio::test]
async fn link_payment_overpayment_goes_negative() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(500), Decimal::ZERO).await;

    let updated = ledger
        .service
        .link_payment(
            record.record_id,
            NewPayment::new("PAY-1", dec!(650.25), paid_on()),
            BURSAR,
        )
        .await
        .unwrap();

    assert_eq!(updated.current_balance, dec!(-150.25));
    assert_eq!(updated.billing_status, BillingStatus::Overpaid);
}

#[tokio::test]
async fn link_payment_twice_is_duplicate_and_counted_once() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(500), Decimal::ZERO).await;

    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-1", dec!(200), paid_on()), BURSAR)
        .await
        .unwrap();
    let again = ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-1", dec!(200), paid_on()), BURSAR)
        .await;

    assert!(matches!(
        again,
        Err(LedgerError::DuplicatePayment { ref payment_id, .. }) if payment_id == "PAY-1"
    ));

    let stored = ledger.service.get_record(record.record_id).await.unwrap();
    assert_eq!(stored.total_paid, dec!(200));
    assert_eq!(stored.linked_payments.len(), 1);
}

#[tokio::test]
async fn concurrent_duplicate_links_are_applied_once() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(500), Decimal::ZERO).await;

    let attempts = (0..5).map(|_| {
        ledger.service.link_payment(
            record.record_id,
            NewPayment::new("PAY-RACE", dec!(100), paid_on()),
            BURSAR,
        )
    });
    let results = join_all(attempts).await;

    let linked = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::DuplicatePayment { .. })))
        .count();
    assert_eq!(linked, 1);
    assert_eq!(duplicates, 4);

    let stored = ledger.service.get_record(record.record_id).await.unwrap();
    assert_eq!(stored.total_paid, dec!(100));
}

#[tokio::test]
async fn duplicate_link_on_locked_record_reports_duplicate() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(500), Decimal::ZERO).await;

    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-9", dec!(500), paid_on()), BURSAR)
        .await
        .unwrap();
    ledger
        .service
        .carry_forward(record.record_id, NextPeriod::new(ledger.term(2)), BURSAR)
        .await
        .unwrap();

    let duplicate = ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-9", dec!(500), paid_on()), BURSAR)
        .await;
    assert!(matches!(duplicate, Err(LedgerError::DuplicatePayment { .. })));

    let fresh = ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-10", dec!(5), paid_on()), BURSAR)
        .await;
    assert!(matches!(fresh, Err(LedgerError::LockedRecord(_))));
}

#[tokio::test]
async fn link_payment_rejects_invalid_input() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(500), Decimal::ZERO).await;

    let zero = ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-0", Decimal::ZERO, paid_on()), BURSAR)
        .await;
    assert!(matches!(zero, Err(LedgerError::InvalidAmount(_))));

    let blank = ledger
        .service
        .link_payment(record.record_id, NewPayment::new(" ", dec!(10), paid_on()), BURSAR)
        .await;
    assert!(matches!(blank, Err(LedgerError::InvalidInput(_))));
}

#[tokio::test]
async fn unlink_payment_restores_balance_and_audits_reason() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(800), Decimal::ZERO).await;

    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-A", dec!(300), paid_on()), BURSAR)
        .await
        .unwrap();
    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-B", dec!(200), paid_on()), BURSAR)
        .await
        .unwrap();

    let updated = ledger
        .service
        .unlink_payment(record.record_id, "PAY-A", BURSAR, Some("cheque bounced"))
        .await
        .unwrap();

    assert_eq!(updated.total_paid, dec!(200));
    assert_eq!(updated.current_balance, dec!(600));
    assert!(updated.find_payment("PAY-A").is_none());

    let audit = updated.audit_trail.last().unwrap();
    assert_eq!(audit.action, AuditAction::PaymentUnlinked);
    assert_eq!(audit.reason.as_deref(), Some("cheque bounced"));
    assert!(audit.old_value.is_some());

    // Sequences are never reused after an unlink.
    let relinked = ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-A", dec!(300), paid_on()), BURSAR)
        .await
        .unwrap();
    assert_eq!(relinked.find_payment("PAY-A").unwrap().sequence, 3);
}

#[tokio::test]
async fn unlink_last_payment_without_charges_returns_to_pending() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(800), Decimal::ZERO).await;

    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-A", dec!(300), paid_on()), BURSAR)
        .await
        .unwrap();
    let updated = ledger
        .service
        .unlink_payment(record.record_id, "PAY-A", BURSAR, None)
        .await
        .unwrap();

    assert_eq!(updated.billing_status, BillingStatus::Pending);
    assert_eq!(updated.current_balance, dec!(800));
}

#[tokio::test]
async fn unlink_unknown_payment_is_rejected() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(800), Decimal::ZERO).await;

    let result = ledger
        .service
        .unlink_payment(record.record_id, "PAY-MISSING", BURSAR, None)
        .await;

    assert!(matches!(result, Err(LedgerError::PaymentNotLinked { .. })));
}

#[tokio::test]
async fn unlink_on_locked_record_is_rejected() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(800), Decimal::ZERO).await;

    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-A", dec!(300), paid_on()), BURSAR)
        .await
        .unwrap();
    ledger
        .service
        .carry_forward(record.record_id, NextPeriod::new(ledger.term(2)), BURSAR)
        .await
        .unwrap();

    let result = ledger
        .service
        .unlink_payment(record.record_id, "PAY-A", BURSAR, None)
        .await;
    assert!(matches!(result, Err(LedgerError::LockedRecord(_))));
}
