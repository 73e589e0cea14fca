//! The auto-payg follow-up generator.
//!
//! When a guardian's hour balance drops to or below their minimum-lesson
//! threshold, a follow-up invoice is issued covering their forward-looking
//! eligible lessons. If there is nothing billable, the check is suppressed
//! with [`Error::NoFutureClassesZeroBalance`] so the admin can be notified
//! instead of a phantom invoice appearing.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::Datelike;
use rust_decimal::Decimal;
use tracing::{info, instrument};
use tutora_core::{
    Error, Result,
    hours::Hours,
    ids::GuardianId,
    invoice::{Invoice, InvoiceKind, InvoiceStatus},
    period::BillingPeriod,
};

use crate::{
    context::BillingContext,
    manager,
    selector::{self, SelectOptions, SelectionWindow},
};

/// Cooperative cancellation for a guardian sweep. Clone a handle, hand it to
/// the sweep, and call [`cancel`] to stop it.
///
/// The sweep only reads the flag between guardians, so a cancel takes effect
/// at the next suspension point: the guardian currently being checked
/// finishes (or its invoice write fails atomically), and no later guardian
/// is touched. There is no mid-guardian abort to leave a half-applied
/// follow-up invoice.
///
/// [`cancel`]: SweepCancel::cancel
#[derive(Clone, Debug, Default)]
pub struct SweepCancel {
    cancelled: Arc<AtomicBool>,
}

impl SweepCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sweep to stop after the guardian currently being checked.
    /// Idempotent; there is no way to un-cancel.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// If the guardian's balance is at or below their minimum-lesson threshold,
/// generate a follow-up invoice from their future eligible lessons.
///
/// Returns `Ok(None)` when the balance is still healthy or an open invoice
/// already exists, `Ok(Some(invoice))` on generation, and
/// [`Error::NoFutureClassesZeroBalance`] when there is nothing to bill.
#[instrument(skip_all, name = "(zero-hours-check)", fields(guardian = %guardian_id))]
pub async fn follow_up_check(
    ctx: &BillingContext,
    guardian_id: GuardianId,
) -> Result<Option<Invoice>> {
    let guardian = ctx
        .store
        .get_guardian(guardian_id)
        .await?
        .ok_or(Error::not_found("guardian"))?;

    let threshold_mins = guardian
        .min_lesson_mins
        .unwrap_or(ctx.config.default_min_lesson_mins);
    let threshold = Hours::from_minutes(threshold_mins).as_decimal();
    if guardian.total_hours > threshold {
        return Ok(None);
    }

    // An open (draft/pending) invoice already covers the follow-up.
    let filter = crate::query::InvoiceFilter {
        guardian: Some(guardian_id),
        ..Default::default()
    };
    let existing = ctx.store.list_invoices(&filter).await?;
    if existing.iter().any(|i| {
        matches!(i.status, InvoiceStatus::Draft | InvoiceStatus::Pending)
    }) {
        return Ok(None);
    }

    // Forward-looking lessons only.
    let today = ctx.now().date_utc();
    let window = SelectionWindow::from(today);
    let mut options = SelectOptions::new(ctx.config.selector_max_items);
    options.include_report_window = false;
    let lessons =
        selector::eligible_lessons(ctx, guardian_id, &window, &options, None)
            .await?;
    if lessons.is_empty() {
        return Err(Error::NoFutureClassesZeroBalance);
    }

    // PAYG: one forward-looking month anchored on the first lesson.
    let first = lessons[0].scheduled_date();
    let period = BillingPeriod::for_month(first.year(), first.month())
        .unwrap_or(BillingPeriod::from_bounds(first, first));

    let invoice = manager::create_generated_invoice(
        ctx,
        guardian_id,
        InvoiceKind::GuardianInvoice,
        period,
        &lessons,
    )
    .await?;

    info!(invoice = %invoice.id, "follow-up invoice generated");
    Ok(Some(invoice))
}

/// Options for the admin sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepOptions {
    pub guardian: Option<GuardianId>,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

/// The result of one sweep run.
#[derive(Clone, Debug, Default)]
pub struct SweepReport {
    pub checked: usize,
    pub generated: usize,
    pub suppressed: usize,
    pub aborted: bool,
}

/// Run the zero-hour check across guardians, polling the cancel flag
/// between guardians so an abort never leaves a partially-applied change.
pub async fn sweep(
    ctx: &BillingContext,
    cancel: &SweepCancel,
    options: &SweepOptions,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    let guardians = match options.guardian {
        Some(id) => vec![id],
        None => ctx.store.list_guardian_ids().await?,
    };
    let limit = options.limit.unwrap_or(usize::MAX);

    for guardian_id in guardians {
        if report.checked >= limit {
            break;
        }
        if cancel.is_cancelled() {
            report.aborted = true;
            break;
        }
        report.checked += 1;

        if options.dry_run {
            let would = would_generate(ctx, guardian_id).await?;
            if would {
                report.generated += 1;
            }
            continue;
        }

        match follow_up_check(ctx, guardian_id).await {
            Ok(Some(_)) => report.generated += 1,
            Ok(None) => {}
            Err(Error::NoFutureClassesZeroBalance) => {
                report.suppressed += 1;
                ctx.sink.post(
                    crate::outbox::BillingEvent::ZeroBalanceNoFutureClasses {
                        guardian: guardian_id,
                    },
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}

/// Dry-run probe: would `follow_up_check` generate an invoice?
async fn would_generate(
    ctx: &BillingContext,
    guardian_id: GuardianId,
) -> Result<bool> {
    let Some(guardian) = ctx.store.get_guardian(guardian_id).await? else {
        return Ok(false);
    };
    let threshold_mins = guardian
        .min_lesson_mins
        .unwrap_or(ctx.config.default_min_lesson_mins);
    let threshold: Decimal =
        Hours::from_minutes(threshold_mins).as_decimal();
    if guardian.total_hours > threshold {
        return Ok(false);
    }
    let today = ctx.now().date_utc();
    let window = SelectionWindow::from(today);
    let mut options = SelectOptions::new(ctx.config.selector_max_items);
    options.include_report_window = false;
    let lessons =
        selector::eligible_lessons(ctx, guardian_id, &window, &options, None)
            .await?;
    Ok(!lessons.is_empty())
}
