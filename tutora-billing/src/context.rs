//! Constructor-injected dependencies.
//!
//! Everything the engine needs (store handle, clock, id entropy,
//! configuration, notification sink) is carried by [`BillingContext`] and
//! threaded explicitly to every component. No module-level mutable state.

use std::sync::Arc;

use rand_core::OsRng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tutora_core::{
    amount::Amount,
    ids::{AuditId, InvoiceId, PaymentId},
    time::TimestampMs,
};

use crate::{outbox::NotificationSink, traits::BillingStore};

/// A source of "now". Swappable so tests can pin time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> TimestampMs;
}

/// The production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs::now()
    }
}

/// A clock pinned to a settable instant.
pub struct FixedClock(std::sync::atomic::AtomicI64);

impl FixedClock {
    pub fn at(ts: TimestampMs) -> Self {
        Self(std::sync::atomic::AtomicI64::new(ts.as_i64()))
    }

    pub fn set(&self, ts: TimestampMs) {
        self.0.store(ts.as_i64(), std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.0.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> TimestampMs {
        let ms = self.0.load(std::sync::atomic::Ordering::SeqCst);
        TimestampMs::try_from_i64(ms).expect("FixedClock went negative")
    }
}

/// Fresh id entropy from the OS RNG.
#[derive(Clone, Copy, Default)]
pub struct IdGen;

impl IdGen {
    pub fn invoice_id(&self) -> InvoiceId {
        InvoiceId::from_rng(&mut OsRng)
    }

    pub fn payment_id(&self) -> PaymentId {
        PaymentId::from_rng(&mut OsRng)
    }

    pub fn audit_id(&self) -> AuditId {
        AuditId::from_rng(&mut OsRng)
    }

    /// Six bytes of lowercase hex for slug uniqueness.
    pub fn slug_suffix(&self) -> String {
        use rand_core::RngCore;
        let mut bytes = [0u8; 6];
        OsRng.fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Engine configuration, set once at start-up.
#[derive(Clone, Debug)]
pub struct BillingConfig {
    /// Fallback hourly rate when neither the snapshot, the guardian, nor any
    /// existing item yields one.
    pub default_hourly_rate: Amount,
    /// Platform share withheld from tips before distribution.
    pub tip_platform_cut: Decimal,
    /// Hard cap on selector output, against runaway selections.
    pub selector_max_items: usize,
    /// Two log entries closer together than this with identical payment
    /// fingerprints are treated as duplicates.
    pub duplicate_window_ms: u64,
    /// Tolerance when validating a supplied amount against its expected
    /// hours-based decomposition.
    pub amount_tolerance: Decimal,
    /// Tolerance for refund decomposition validation.
    pub refund_tolerance: Decimal,
    /// Width of the zero-padded invoice number.
    pub invoice_number_width: usize,
    /// Default minimum lesson length used by the auto generator when a
    /// guardian has none configured.
    pub default_min_lesson_mins: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_hourly_rate: Amount::from_major(10),
            tip_platform_cut: dec!(0.05),
            selector_max_items: 400,
            duplicate_window_ms: 30_000,
            amount_tolerance: dec!(0.01),
            refund_tolerance: dec!(0.05),
            invoice_number_width: 6,
            default_min_lesson_mins: 30,
        }
    }
}

/// The dependency bundle threaded through every engine function.
#[derive(Clone)]
pub struct BillingContext {
    pub store: Arc<dyn BillingStore>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn NotificationSink>,
    pub ids: IdGen,
    pub config: BillingConfig,
}

impl BillingContext {
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: BillingConfig,
    ) -> Self {
        Self { store, clock, sink, ids: IdGen, config }
    }

    #[inline]
    pub fn now(&self) -> TimestampMs {
        self.clock.now()
    }
}
