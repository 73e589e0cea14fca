//! Shared harness for the end-to-end billing tests.

// Each test binary compiles its own copy; not every binary uses every
// helper.
#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tutora_billing::{
    context::{BillingConfig, BillingContext, FixedClock},
    manager::{BillingManager, CreateInvoiceRequest},
    outbox::{BillingEvent, ChannelSink},
    store::memory::MemoryStore,
};
use tutora_core::{
    class::{Class, ClassStatus},
    ids::{ClassId, GuardianId, StudentId, TeacherId},
    invoice::{Coverage, Invoice, InvoiceKind, TransferFeeMode},
    party::TransferFeeConfig,
    period::BillingPeriod,
    test_utils::fixtures,
    time::TimestampMs,
};

/// 2025-01-10T12:00:00Z, the "today" of every test.
pub const NOW_MS: i64 = 1_736_510_400_000;

pub struct Harness {
    pub manager: BillingManager,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub events: UnboundedReceiver<BillingEvent>,
}

pub async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(FixedClock::at(
        TimestampMs::try_from_i64(NOW_MS).unwrap(),
    ));
    let (sink, events) = ChannelSink::new();
    let ctx = BillingContext::new(
        store.clone(),
        clock.clone(),
        Arc::new(sink),
        BillingConfig::default(),
    );
    Harness { manager: BillingManager::new(ctx), store, clock, events }
}

/// A guardian with rate 10/hour and an optional fixed transfer fee.
pub async fn seed_guardian(
    harness: &Harness,
    n: u64,
    fixed_fee: Option<u32>,
) -> GuardianId {
    let mut guardian = fixtures::guardian(n);
    guardian.transfer_fee = fixed_fee.map(|fee| TransferFeeConfig {
        mode: TransferFeeMode::Fixed,
        value: rust_decimal::Decimal::from(fee),
    });
    let id = guardian.id;
    harness.store.put_guardian(guardian).await;
    harness.store.put_student(fixtures::student(1, id)).await;
    harness.store.put_teacher(fixtures::teacher(1)).await;
    id
}

/// A scheduled 60-minute class on the given January 2025 day at noon UTC.
pub async fn seed_class(
    harness: &Harness,
    n: u64,
    guardian: GuardianId,
    day: u32,
) -> ClassId {
    let class = class_on_day(n, guardian, day);
    let id = class.id;
    harness.store.put_class(class).await;
    id
}

pub fn class_on_day(n: u64, guardian: GuardianId, day: u32) -> Class {
    let mut class = fixtures::class(n, guardian);
    // Jan 1 2025 00:00:00 UTC plus (day-1) days, at noon.
    let ms = 1_735_689_600_000i64
        + i64::from(day - 1) * 86_400_000
        + 43_200_000;
    class.scheduled_at = TimestampMs::try_from_i64(ms).unwrap();
    class.status = Some(ClassStatus::Scheduled);
    class
}

/// Create a January-2025 invoice populated from the selector.
pub async fn create_selected_invoice(
    harness: &Harness,
    guardian: GuardianId,
    coverage: Option<Coverage>,
) -> Invoice {
    harness
        .manager
        .create_invoice(
            CreateInvoiceRequest {
                kind: InvoiceKind::GuardianInvoice,
                guardian: Some(guardian),
                teacher: None,
                period: BillingPeriod::for_month(2025, 1).unwrap(),
                due_date: None,
                coverage,
                select_lessons: true,
                notes: None,
            },
            None,
        )
        .await
        .unwrap()
}

pub async fn guardian_hours(
    harness: &Harness,
    id: GuardianId,
) -> rust_decimal::Decimal {
    use tutora_billing::traits::BillingStore;
    harness
        .store
        .get_guardian(id)
        .await
        .unwrap()
        .unwrap()
        .total_hours
}

pub async fn class_paid_flag(harness: &Harness, id: ClassId) -> bool {
    use tutora_billing::traits::BillingStore;
    harness
        .store
        .get_class(id)
        .await
        .unwrap()
        .unwrap()
        .paid_by_guardian
}

pub fn student1() -> StudentId {
    StudentId::from_u64(1)
}

pub fn teacher1() -> TeacherId {
    TeacherId::from_u64(1)
}
