//! Operation metrics tests.

mod common;

use common::{paid_on, spawn_ledger, BURSAR};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use student_ledger_service::models::{ChargeCategory, NewCharge, NewPayment};
use student_ledger_service::services::{get_metrics, NextPeriod};

fn duration_count_line(text: &str, operation: &str) -> Option<String> {
    let needle = format!(
        "student_ledger_operation_duration_seconds_count{{operation=\"{}\"}}",
        operation
    );
    text.lines()
        .find(|line| line.starts_with(&needle))
        .map(str::to_string)
}

#[tokio::test]
async fn every_ledger_operation_is_timed() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(1000), Decimal::ZERO).await;

    ledger
        .service
        .add_charge(
            record.record_id,
            NewCharge::new(ChargeCategory::Transport, "Bus fare", dec!(100)),
            BURSAR,
        )
        .await
        .unwrap();
    ledger
        .service
        .link_payment(record.record_id, NewPayment::new("PAY-M1", dec!(300), paid_on()), BURSAR)
        .await
        .unwrap();
    ledger
        .service
        .unlink_payment(record.record_id, "PAY-M1", BURSAR, None)
        .await
        .unwrap();
    ledger
        .service
        .get_student_summary(record.student_id, None)
        .await
        .unwrap();
    ledger
        .service
        .carry_forward(record.record_id, NextPeriod::new(ledger.term(2)), BURSAR)
        .await
        .unwrap();

    let text = get_metrics();
    for operation in [
        "create_record",
        "add_charge",
        "link_payment",
        "unlink_payment",
        "carry_forward",
        "get_student_summary",
    ] {
        assert!(
            duration_count_line(&text, operation).is_some(),
            "no duration recorded for {operation}"
        );
    }
}

#[tokio::test]
async fn rejected_operations_are_timed() {
    let ledger = spawn_ledger();
    let record = ledger.new_record(dec!(1000), Decimal::ZERO).await;

    let result = ledger
        .service
        .unlink_payment(record.record_id, "PAY-NEVER-LINKED", BURSAR, None)
        .await;
    assert!(result.is_err());

    let text = get_metrics();
    assert!(duration_count_line(&text, "unlink_payment").is_some());
}
