//! Class-event reaction scenarios: ledgers, in-place edits, paid-invoice
//! substitution, and the zero-hour generator.

mod common;

use common::*;
use rust_decimal_macros::dec;
use tutora_billing::{
    apply::PaymentRequest,
    dispatcher::{ClassEvent, ClassPrevious},
    traits::BillingStore,
    zero_hours::{self, SweepCancel, SweepOptions},
};
use tutora_core::{
    amount::Amount,
    class::ClassStatus,
    hours::Hours,
    invoice::{Coverage, InvoiceStatus, PaymentMethod},
};

fn payment(amount: u64, mins: u32) -> PaymentRequest {
    PaymentRequest {
        amount: Some(Amount::from_major(amount)),
        payment_method: Some(PaymentMethod::Manual),
        paid_hours: Some(Hours::from_minutes(mins)),
        ..Default::default()
    }
}

/// Marking a class attended debits the guardian and student and credits the
/// teacher's month; reverting restores all three.
#[tokio::test]
async fn countable_flip_moves_all_three_ledgers() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let class_id = seed_class(&h, 1, guardian, 15).await;

    let mut class =
        h.store.get_class(class_id).await.unwrap().unwrap();
    let previous = ClassPrevious {
        status: class.status,
        duration_mins: class.duration_mins,
        skip_hour_adjustment: false,
    };
    class.status = Some(ClassStatus::Attended);
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(&class, ClassEvent::Updated { previous })
        .await
        .unwrap();

    assert_eq!(guardian_hours(&h, guardian).await, dec!(-1));
    let guardian_doc =
        h.store.get_guardian(guardian).await.unwrap().unwrap();
    assert_eq!(guardian_doc.consumed_hours, dec!(1));
    let teacher =
        h.store.get_teacher(teacher1()).await.unwrap().unwrap();
    assert_eq!(teacher.months[0].hours, dec!(1));

    // Flip back.
    let previous = ClassPrevious {
        status: Some(ClassStatus::Attended),
        duration_mins: 60,
        skip_hour_adjustment: false,
    };
    let mut reverted = class.clone();
    reverted.status = Some(ClassStatus::Scheduled);
    h.store.update_class(&reverted).await.unwrap();
    h.manager
        .on_class_event(&reverted, ClassEvent::Updated { previous })
        .await
        .unwrap();

    assert_eq!(guardian_hours(&h, guardian).await, dec!(0));
    let teacher =
        h.store.get_teacher(teacher1()).await.unwrap().unwrap();
    assert_eq!(teacher.months[0].hours, dec!(0));
}

/// A duration change while countable applies the signed delta.
#[tokio::test]
async fn duration_delta_while_countable() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let class_id = seed_class(&h, 1, guardian, 15).await;

    let mut class =
        h.store.get_class(class_id).await.unwrap().unwrap();
    class.status = Some(ClassStatus::Attended);
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(
            &class,
            ClassEvent::Updated {
                previous: ClassPrevious {
                    status: Some(ClassStatus::Scheduled),
                    duration_mins: 60,
                    skip_hour_adjustment: false,
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(guardian_hours(&h, guardian).await, dec!(-1));

    // 60 → 90 minutes while attended: half an hour more consumed.
    class.duration_mins = 90;
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(
            &class,
            ClassEvent::Updated {
                previous: ClassPrevious {
                    status: Some(ClassStatus::Attended),
                    duration_mins: 60,
                    skip_hour_adjustment: false,
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(guardian_hours(&h, guardian).await, dec!(-1.5));
}

/// Edits to a lesson on an unpaid invoice are mirrored in place.
#[tokio::test]
async fn unpaid_invoice_edited_in_place() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let class_id = seed_class(&h, 1, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;
    assert_eq!(invoice.total, Amount::from_major(10));

    let mut class =
        h.store.get_class(class_id).await.unwrap().unwrap();
    let previous = ClassPrevious {
        status: class.status,
        duration_mins: 60,
        skip_hour_adjustment: true,
    };
    class.duration_mins = 90;
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(&class, ClassEvent::Updated { previous })
        .await
        .unwrap();

    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.items[0].duration_mins, 90);
    assert_eq!(stored.total, Amount::from_major(15));
}

/// A newly created class lands on the guardian's open invoice when the
/// billing window covers it.
#[tokio::test]
async fn created_class_joins_open_invoice() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    seed_class(&h, 1, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;
    assert_eq!(invoice.items.len(), 1);

    let class = class_on_day(2, guardian, 20);
    h.store.put_class(class.clone()).await;
    h.manager
        .on_class_event(&class, ClassEvent::Created)
        .await
        .unwrap();

    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.items.len(), 2);
    assert_eq!(stored.total, Amount::from_major(20));

    // Replaying the event does not duplicate the row.
    h.manager
        .on_class_event(&class, ClassEvent::Created)
        .await
        .unwrap();
    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.items.len(), 2);
}

/// Scenario: lesson cancelled after payment is replaced by the next
/// eligible unpaid lesson.
#[tokio::test]
async fn cancelled_paid_lesson_is_substituted() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let paid_class = seed_class(&h, 1, guardian, 15).await;
    // A later unbilled lesson sits in the same window.
    let substitute = seed_class(&h, 2, guardian, 20).await;

    // Cap the invoice at one hour so only the first lesson is billed.
    let invoice = create_selected_invoice(
        &h,
        guardian,
        Some(Coverage::capped(Hours::from_minutes(60))),
    )
    .await;
    assert_eq!(invoice.items.len(), 1);
    h.manager
        .apply_payment(invoice.id, payment(10, 60), None)
        .await
        .unwrap();
    assert!(class_paid_flag(&h, paid_class).await);

    // Attend, then cancel the paid lesson.
    let mut class =
        h.store.get_class(paid_class).await.unwrap().unwrap();
    class.status = Some(ClassStatus::CancelledByGuardian);
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(
            &class,
            ClassEvent::Updated {
                previous: ClassPrevious {
                    status: Some(ClassStatus::Attended),
                    duration_mins: 60,
                    skip_hour_adjustment: true,
                },
            },
        )
        .await
        .unwrap();

    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.items.len(), 1);
    assert_eq!(
        stored.items[0].class, substitute,
        "the unbilled lesson replaced the cancelled one"
    );
    // The substitute now sits inside paid coverage.
    assert!(class_paid_flag(&h, substitute).await);
}

/// Deleting a class on a settled invoice substitutes a replacement too.
#[tokio::test]
async fn deleted_paid_lesson_is_substituted() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let doomed = seed_class(&h, 1, guardian, 15).await;
    let substitute = seed_class(&h, 2, guardian, 18).await;

    let invoice = create_selected_invoice(
        &h,
        guardian,
        Some(Coverage::capped(Hours::from_minutes(60))),
    )
    .await;
    h.manager
        .apply_payment(invoice.id, payment(10, 60), None)
        .await
        .unwrap();

    let class = h.store.get_class(doomed).await.unwrap().unwrap();
    h.manager
        .on_class_event(
            &class,
            ClassEvent::Deleted {
                previous: ClassPrevious {
                    status: class.status,
                    duration_mins: 60,
                    skip_hour_adjustment: true,
                },
            },
        )
        .await
        .unwrap();

    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.items.len(), 1);
    assert_eq!(stored.items[0].class, substitute);
}

/// A settled lesson that grows appends an adjustment row; one that shrinks
/// triggers a proportional refund.
#[tokio::test]
async fn settled_duration_changes() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    let class_id = seed_class(&h, 1, guardian, 15).await;
    let invoice = create_selected_invoice(&h, guardian, None).await;
    h.manager
        .apply_payment(invoice.id, payment(10, 60), None)
        .await
        .unwrap();

    // Grow 60 → 90.
    let mut class =
        h.store.get_class(class_id).await.unwrap().unwrap();
    class.duration_mins = 90;
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(
            &class,
            ClassEvent::Updated {
                previous: ClassPrevious {
                    status: class.status,
                    duration_mins: 60,
                    skip_hour_adjustment: true,
                },
            },
        )
        .await
        .unwrap();
    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.items.len(), 2);
    assert_eq!(stored.total, Amount::from_major(15));
    assert_eq!(stored.status, InvoiceStatus::Paid);

    // Shrink 90 → 60: half an hour refunded.
    let mut class =
        h.store.get_class(class_id).await.unwrap().unwrap();
    class.duration_mins = 60;
    h.store.update_class(&class).await.unwrap();
    h.manager
        .on_class_event(
            &class,
            ClassEvent::Updated {
                previous: ClassPrevious {
                    status: class.status,
                    duration_mins: 90,
                    skip_hour_adjustment: true,
                },
            },
        )
        .await
        .unwrap();
    let stored =
        h.store.get_invoice(invoice.id).await.unwrap().unwrap();
    assert!(
        stored.payment_log.iter().any(|e| e.is_refund()),
        "shrink produced a refund entry"
    );
    assert_eq!(stored.paid_amount, Amount::from_major(5));
}

/// The zero-hour generator issues a pending follow-up invoice, and
/// suppresses when the guardian has no future lessons.
#[tokio::test]
async fn zero_hours_generates_or_suppresses() {
    let h = harness().await;
    let guardian = seed_guardian(&h, 1, None).await;
    seed_class(&h, 1, guardian, 20).await;

    // Balance 0 ≤ threshold: generates from the future lesson.
    let generated = zero_hours::follow_up_check(
        h.manager.context(),
        guardian,
    )
    .await
    .unwrap()
    .expect("an invoice");
    assert_eq!(generated.status, InvoiceStatus::Pending);
    assert_eq!(generated.items.len(), 1);
    assert_eq!(generated.total, Amount::from_major(10));

    // With an open invoice in place the check is a no-op.
    let again =
        zero_hours::follow_up_check(h.manager.context(), guardian)
            .await
            .unwrap();
    assert!(again.is_none());

    // A guardian with no future lessons suppresses instead.
    let empty_guardian = seed_guardian(&h, 2, None).await;
    let err = zero_hours::follow_up_check(
        h.manager.context(),
        empty_guardian,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind_str(), "no_future_classes_zero_balance");

    // The sweep reports both outcomes.
    let cancel = SweepCancel::new();
    let report = zero_hours::sweep(
        h.manager.context(),
        &cancel,
        &SweepOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.suppressed, 1);

    // An already-cancelled flag aborts before any work.
    cancel.cancel();
    assert!(cancel.is_cancelled());
    let report = zero_hours::sweep(
        h.manager.context(),
        &cancel,
        &SweepOptions::default(),
    )
    .await
    .unwrap();
    assert!(report.aborted);
    assert_eq!(report.checked, 0);
}
