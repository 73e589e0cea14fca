//! Refund and post-payment adjustment scenarios.

mod common;

use common::*;
use rust_decimal_macros::dec;
use tutora_billing::{
    apply::PaymentRequest,
    refund::{AdjustmentPayload, RefundRequest, RemoveMode},
    traits::BillingStore,
};
use tutora_core::{
    amount::Amount,
    audit::{AuditAction, AuditSeverity},
    hours::Hours,
    invoice::{InvoiceStatus, PaymentMethod},
};

fn payment(amount: u64, mins: u32) -> PaymentRequest {
    PaymentRequest {
        amount: Some(Amount::from_major(amount)),
        payment_method: Some(PaymentMethod::Manual),
        paid_hours: Some(Hours::from_minutes(mins)),
        ..Default::default()
    }
}

/// Refund half of a two-lesson invoice (no transfer fee): money, hours,
/// coverage, and the paid flag all shrink together.
#[tokio::test]
async fn refund_half_of_invoice() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let class1 = seed_class(&h, 1, guardian, 15).await;
    let class2 = seed_class(&h, 2, guardian, 16).await;

    let invoice = create_selected_invoice(&h, guardian, None).await;
    assert_eq!(invoice.total, Amount::from_major(20));

    h.manager
        .apply_payment(invoice.id, payment(20, 120), None)
        .await
        .unwrap();
    assert!(class_paid_flag(&h, class1).await);
    assert!(class_paid_flag(&h, class2).await);
    assert_eq!(guardian_hours(&h, guardian).await, dec!(2));

    let refunded = h
        .manager
        .record_refund(
            invoice.id,
            RefundRequest {
                amount: Amount::from_major(10),
                refund_hours: Hours::from_minutes(60),
                reason: "second lesson disputed".to_owned(),
                refund_reference: None,
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(refunded.paid_amount, Amount::from_major(10));
    assert_eq!(
        refunded.coverage.max_hours(),
        Some(Hours::from_minutes(60))
    );
    // Partial refund leaves the settled status in place.
    assert_eq!(refunded.status, InvoiceStatus::Paid);

    // The chronologically-first lesson stays covered; the second loses its
    // flag.
    assert!(class_paid_flag(&h, class1).await);
    assert!(!class_paid_flag(&h, class2).await);
    assert_eq!(guardian_hours(&h, guardian).await, dec!(1));

    let audits = h.store.audits_for_invoice(invoice.id).await.unwrap();
    assert!(audits.iter().any(|a| a.action == AuditAction::Refund));
}

/// The proportional transfer-fee refund: coverage 5 hours, fixed fee 5,
/// refunding 2 hours returns 2×rate + fee×(2/5).
#[tokio::test]
async fn transfer_fee_refunds_proportionally() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, Some(5)).await;
    for n in 1..=5u64 {
        seed_class(&h, n, guardian, 12 + n as u32).await;
    }
    let invoice = create_selected_invoice(&h, guardian, None).await;
    assert_eq!(invoice.subtotal, Amount::from_major(50));
    assert_eq!(invoice.total, Amount::from_major(55));

    // Effective price folds the fee in: 5h × (10 + 5/5) = 55.
    h.manager
        .apply_payment(invoice.id, payment(55, 300), None)
        .await
        .unwrap();

    // A wrong amount is rejected with the expected decomposition.
    let err = h
        .manager
        .record_refund(
            invoice.id,
            RefundRequest {
                amount: Amount::from_major(25),
                refund_hours: Hours::from_minutes(120),
                reason: "two lessons refunded".to_owned(),
                refund_reference: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind_str(), "validation_error");
    assert!(err.to_string().contains("22"), "got: {err}");

    // Expected: base 2×10 = 20 plus fee 5 × (2/5) = 2.
    let refunded = h
        .manager
        .record_refund(
            invoice.id,
            RefundRequest {
                amount: Amount::from_major(22),
                refund_hours: Hours::from_minutes(120),
                reason: "two lessons refunded".to_owned(),
                refund_reference: Some("gw-ref-1".to_owned()),
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(refunded.paid_amount, Amount::from_major(33));
    assert_eq!(
        refunded.coverage.max_hours(),
        Some(Hours::from_minutes(180))
    );
    assert_eq!(guardian_hours(&h, guardian).await, dec!(3));
}

/// Refunding the full paid amount transitions to refunded.
#[tokio::test]
async fn full_refund_reaches_refunded() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    seed_class(&h, 1, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;

    h.manager
        .apply_payment(invoice.id, payment(10, 60), None)
        .await
        .unwrap();

    let refunded = h
        .manager
        .record_refund(
            invoice.id,
            RefundRequest {
                amount: Amount::from_major(10),
                refund_hours: Hours::from_minutes(60),
                reason: "full reversal".to_owned(),
                refund_reference: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(refunded.status, InvoiceStatus::Refunded);
    assert_eq!(refunded.paid_amount, Amount::ZERO);
    assert!(refunded.paid_at.is_none());

    // Hours beyond the remaining coverage are rejected.
    let err = h
        .manager
        .record_refund(
            invoice.id,
            RefundRequest {
                amount: Amount::from_major(10),
                refund_hours: Hours::from_minutes(60),
                reason: "again".to_owned(),
                refund_reference: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind_str(), "validation_error");
}

/// Post-payment removal with each money mode.
#[tokio::test]
async fn remove_lessons_modes() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let _c1 = seed_class(&h, 1, guardian, 13).await;
    let c2 = seed_class(&h, 2, guardian, 14).await;
    let c3 = seed_class(&h, 3, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;
    assert_eq!(invoice.total, Amount::from_major(30));

    h.manager
        .apply_payment(invoice.id, payment(30, 180), None)
        .await
        .unwrap();

    // Refund mode: money and hours come back.
    let after = h
        .manager
        .apply_adjustment(
            invoice.id,
            AdjustmentPayload::RemoveLessons {
                classes: vec![c2],
                mode: RemoveMode::Refund,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(after.items.len(), 2);
    assert_eq!(after.paid_amount, Amount::from_major(20));
    assert_eq!(guardian_hours(&h, guardian).await, dec!(2));

    // Compensate mode: the lesson goes, money and consumed hours stay.
    let after = h
        .manager
        .apply_adjustment(
            invoice.id,
            AdjustmentPayload::RemoveLessons {
                classes: vec![c3],
                mode: RemoveMode::Compensate,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(after.items.len(), 1);
    assert_eq!(after.paid_amount, Amount::from_major(20));
    assert_eq!(guardian_hours(&h, guardian).await, dec!(2));
}

/// A post-payment increase appends items and can settle with a follow-up
/// payment.
#[tokio::test]
async fn increase_appends_and_pays() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    seed_class(&h, 1, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;

    h.manager
        .apply_payment(invoice.id, payment(10, 60), None)
        .await
        .unwrap();

    h.clock.advance_ms(60_000);
    let after = h
        .manager
        .apply_adjustment(
            invoice.id,
            AdjustmentPayload::Increase {
                items: vec![tutora_billing::refund::NewItemSpec {
                    class: None,
                    description: "Extra materials session".to_owned(),
                    date: tutora_core::test_utils::fixtures::date(
                        2025, 1, 20,
                    ),
                    duration_mins: 30,
                    rate: None,
                    student: student1(),
                    teacher: teacher1(),
                }],
                payment: Some(payment(5, 30)),
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(after.items.len(), 2);
    assert_eq!(after.total, Amount::from_major(15));
    assert_eq!(after.status, InvoiceStatus::Paid);
    assert_eq!(after.remaining_balance(), Amount::ZERO);
}

/// The dispatcher substitutes an eligible lesson when a paid one is
/// cancelled; with no candidate it records a high-severity audit entry.
#[tokio::test]
async fn manual_review_when_no_replacement() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let class = seed_class(&h, 1, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;
    h.manager
        .apply_payment(invoice.id, payment(10, 60), None)
        .await
        .unwrap();

    // Cancel the only lesson; nothing can replace it.
    let mut updated = h
        .store
        .get_class(class)
        .await
        .unwrap()
        .unwrap();
    let previous = tutora_billing::dispatcher::ClassPrevious {
        status: updated.status,
        duration_mins: updated.duration_mins,
        skip_hour_adjustment: false,
    };
    updated.status =
        Some(tutora_core::class::ClassStatus::CancelledByGuardian);
    h.store.update_class(&updated).await.unwrap();

    h.manager
        .on_class_event(
            &updated,
            tutora_billing::dispatcher::ClassEvent::Updated { previous },
        )
        .await
        .unwrap();

    let audits = h.store.audits_for_invoice(invoice.id).await.unwrap();
    let review = audits
        .iter()
        .find(|a| a.action == AuditAction::ManualReview)
        .expect("manual review entry");
    assert_eq!(review.severity, AuditSeverity::High);

    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert!(stored.items.is_empty());
}
