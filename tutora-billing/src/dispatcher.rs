//! Reacting to class lifecycle events.
//!
//! Invoked when a class is created, changes status or duration, or is
//! deleted. Decides between three outcomes: mutate an unpaid invoice in
//! place, replace the lesson on a settled invoice, or no invoice change.
//! Also owns the hour-ledger adjustments driven by countable-status flips.

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use tutora_core::{
    Error, Result,
    audit::{AuditAction, AuditEntry, AuditSeverity},
    class::{Class, ClassStatus},
    hours::Hours,
    ids::ClassId,
    invoice::{Invoice, InvoiceStatus, LineItem, PersonSnapshot},
};

use crate::{
    context::BillingContext,
    lifecycle::{InvoiceCommand, ensure_items_mutable},
    outbox::{BillingEvent, Outbox},
    refund,
    selector::{self, SelectOptions, SelectionWindow},
    totals,
};

/// The projection of the class state before the triggering edit.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassPrevious {
    pub status: Option<ClassStatus>,
    pub duration_mins: u32,
    /// Set by callers that have already settled the hour ledgers (bulk
    /// migrations, imports).
    pub skip_hour_adjustment: bool,
}

/// The class lifecycle events billing reacts to.
#[derive(Clone, Copy, Debug)]
pub enum ClassEvent {
    Created,
    Updated { previous: ClassPrevious },
    Deleted { previous: ClassPrevious },
}

#[instrument(skip_all, name = "(class-event)", fields(class = %class.id))]
pub async fn on_class_event(
    ctx: &BillingContext,
    class: &Class,
    event: ClassEvent,
) -> Result<()> {
    match event {
        ClassEvent::Created => {
            maybe_add_class_to_unpaid_invoice(ctx, class).await?;
        }
        ClassEvent::Updated { previous } => {
            if !previous.skip_hour_adjustment {
                adjust_hour_ledgers(ctx, class, &previous, false).await?;
            }
            sync_invoice_linkage(ctx, class, &previous).await?;
        }
        ClassEvent::Deleted { previous } => {
            if !previous.skip_hour_adjustment {
                adjust_hour_ledgers(ctx, class, &previous, true).await?;
            }
            handle_deleted(ctx, class).await?;
        }
    }
    Ok(())
}

// --- Hour ledgers --- //

/// Apply the countable-status / duration transition to the teacher monthly
/// hours, the guardian balance, and the student's remaining hours.
async fn adjust_hour_ledgers(
    ctx: &BillingContext,
    class: &Class,
    previous: &ClassPrevious,
    deleted: bool,
) -> Result<()> {
    let was_countable =
        previous.status.is_some_and(|s| s.is_countable());
    // A deleted class no longer counts regardless of its stored status.
    let now_countable = !deleted && class.status_is_countable();

    let prev_hours = Hours::from_minutes(previous.duration_mins);
    let new_hours = class.hours();

    // Signed delta in countable hours.
    let delta: Decimal = match (was_countable, now_countable) {
        (false, true) => new_hours.as_decimal(),
        (true, false) => -prev_hours.as_decimal(),
        (true, true) => new_hours.as_decimal() - prev_hours.as_decimal(),
        (false, false) => Decimal::ZERO,
    };
    if delta.is_zero() {
        return Ok(());
    }

    use chrono::Datelike;
    let date = class.scheduled_date();
    if let Some(mut teacher) = ctx.store.get_teacher(class.teacher).await? {
        teacher.add_month_hours(date.year(), date.month(), delta);
        ctx.store.update_teacher(&teacher).await?;
    }

    if let Some(mut guardian) =
        ctx.store.get_guardian(class.guardian).await?
    {
        // Consumed hours move with the balance, in the opposite direction.
        guardian.total_hours -= delta;
        guardian.consumed_hours += delta;
        ctx.store.update_guardian(&guardian).await?;
    }

    if let Some(mut student) = ctx.store.get_student(class.student).await? {
        if delta > Decimal::ZERO {
            student.debit_hours_clamped(
                Hours::try_from_decimal(delta).unwrap_or(Hours::ZERO),
            );
        } else {
            student.credit_hours(
                Hours::try_from_decimal(-delta).unwrap_or(Hours::ZERO),
            );
        }
        ctx.store.update_student(&student).await?;
    }

    info!(%delta, "hour ledgers adjusted");
    Ok(())
}

// --- Invoice linkage --- //

/// The single active invoice currently carrying this class, if any.
async fn linked_invoice(
    ctx: &BillingContext,
    class: ClassId,
) -> Result<Option<Invoice>> {
    let invoices = ctx.store.invoices_containing_class(class).await?;
    Ok(invoices.into_iter().find(|i| i.active()))
}

async fn sync_invoice_linkage(
    ctx: &BillingContext,
    class: &Class,
    previous: &ClassPrevious,
) -> Result<()> {
    let Some(invoice) = linked_invoice(ctx, class.id).await? else {
        // Not on any invoice. A lesson flipping back to billable may belong
        // on the guardian's open invoice.
        if !class.status_is_cancelled() && !class.hidden {
            maybe_add_class_to_unpaid_invoice(ctx, class).await?;
        }
        return Ok(());
    };

    if !invoice.is_settled() {
        return edit_unpaid_in_place(ctx, invoice, class).await;
    }

    settled_invoice_reaction(ctx, invoice, class, previous).await
}

/// Pick the guardian's single draft/pending invoice whose billing window
/// covers the class date and append a new item, unless the class is already
/// present on some other active invoice.
pub async fn maybe_add_class_to_unpaid_invoice(
    ctx: &BillingContext,
    class: &Class,
) -> Result<Option<Invoice>> {
    if class.status_is_cancelled() || class.hidden || class.paid_by_guardian
    {
        return Ok(None);
    }
    // Already billed somewhere active: nothing to do.
    let billed = ctx.store.billed_class_keys(class.guardian, None).await?;
    if billed.contains(&class.id) {
        return Ok(None);
    }

    let filter = crate::query::InvoiceFilter {
        guardian: Some(class.guardian),
        ..Default::default()
    };
    let candidates = ctx.store.list_invoices(&filter).await?;
    let date = class.scheduled_date();
    let mut open = candidates.into_iter().filter(|i| {
        matches!(i.status, InvoiceStatus::Draft | InvoiceStatus::Pending)
            && i.deleted_at.is_none()
            && i.period.contains(date)
            && !i.excluded_classes.contains(&class.id)
    });
    let Some(mut invoice) = open.next() else {
        return Ok(None);
    };

    let guardian = ctx.store.get_guardian(class.guardian).await?;
    let rate = selector::resolve_rate(
        ctx,
        Some(&invoice.snapshot),
        guardian.as_ref(),
        &invoice.items,
    );
    let item = line_item_for_class(ctx, class, rate).await?;
    invoice.items.push(item);
    totals::recompute(&mut invoice);
    invoice.push_activity(
        None,
        format!("Lesson {} added automatically", class.id),
        ctx.now(),
    );
    ctx.store.update_invoice(&mut invoice).await?;
    ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice.id });
    Ok(Some(invoice))
}

async fn line_item_for_class(
    ctx: &BillingContext,
    class: &Class,
    rate: tutora_core::amount::Amount,
) -> Result<LineItem> {
    let student_snapshot = match ctx.store.get_student(class.student).await? {
        Some(s) => PersonSnapshot {
            first_name: s.first_name,
            last_name: s.last_name,
            email: s.email,
        },
        None => PersonSnapshot {
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
        },
    };
    let teacher_snapshot = match ctx.store.get_teacher(class.teacher).await? {
        Some(t) => PersonSnapshot {
            first_name: t.first_name,
            last_name: t.last_name,
            email: t.email,
        },
        None => PersonSnapshot {
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
        },
    };
    Ok(LineItem {
        class: class.id,
        lesson_id: class.id.to_string(),
        student: class.student,
        student_snapshot,
        teacher: class.teacher,
        teacher_snapshot,
        description: class.description.clone(),
        date: class.scheduled_date(),
        duration_mins: class.duration_mins,
        rate,
        amount: LineItem::compute_amount(rate, class.duration_mins),
        attended: class.status == Some(ClassStatus::Attended),
        status: class.status,
        exclude_from_student_balance: false,
        exempt_from_guardian: false,
        exclude_from_teacher_payment: false,
    })
}

/// Mirror the class edit onto an unpaid invoice's item and recompute.
async fn edit_unpaid_in_place(
    ctx: &BillingContext,
    mut invoice: Invoice,
    class: &Class,
) -> Result<()> {
    ensure_items_mutable(&invoice, &InvoiceCommand::default())?;
    let Some(idx) = invoice.item_index_for_class(class.id) else {
        return Ok(());
    };

    if class.status_is_cancelled() {
        invoice.items.remove(idx);
        invoice.push_activity(
            None,
            format!("Lesson {} cancelled and removed", class.id),
            ctx.now(),
        );
    } else {
        let item = &mut invoice.items[idx];
        item.duration_mins = class.duration_mins;
        item.amount =
            LineItem::compute_amount(item.rate, class.duration_mins);
        item.attended = class.status == Some(ClassStatus::Attended);
        item.status = class.status;
        item.date = class.scheduled_date();
    }
    totals::recompute(&mut invoice);
    ctx.store.update_invoice(&mut invoice).await?;
    ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice.id });
    Ok(())
}

/// The settled-invoice decision tree.
async fn settled_invoice_reaction(
    ctx: &BillingContext,
    mut invoice: Invoice,
    class: &Class,
    previous: &ClassPrevious,
) -> Result<()> {
    let now_cancelled = class.status_is_cancelled();
    let now_countable = class.status_is_countable();
    let command = InvoiceCommand::paid_modification();

    if now_cancelled {
        // Remove and look for a substitute among unpaid lessons.
        ensure_items_mutable(&invoice, &command)?;
        if let Some(idx) = invoice.item_index_for_class(class.id) {
            invoice.items.remove(idx);
            totals::recompute(&mut invoice);
            invoice.push_activity(
                None,
                format!("Paid lesson {} cancelled", class.id),
                ctx.now(),
            );
            ctx.store.update_invoice(&mut invoice).await?;
            // The cancelled lesson is no longer on any invoice.
            if let Some(mut stored) =
                ctx.store.get_class(class.id).await?
            {
                if stored.paid_by_guardian {
                    stored.paid_by_guardian = false;
                    ctx.store.update_class(&stored).await?;
                }
            }
            recalculate_invoice_coverage(ctx, invoice.id, Some(class.id))
                .await?;
        }
        return Ok(());
    }

    if now_countable && previous.status.is_some_and(|s| s.is_cancelled_family())
    {
        // Re-add a lesson that was cancelled and then reinstated.
        ensure_items_mutable(&invoice, &command)?;
        if invoice.item_index_for_class(class.id).is_none() {
            let guardian = ctx.store.get_guardian(class.guardian).await?;
            let rate = selector::resolve_rate(
                ctx,
                Some(&invoice.snapshot),
                guardian.as_ref(),
                &invoice.items,
            );
            let item = line_item_for_class(ctx, class, rate).await?;
            invoice.items.push(item);
            totals::recompute(&mut invoice);
            ctx.store.update_invoice(&mut invoice).await?;
        }
        return Ok(());
    }

    if class.duration_mins != previous.duration_mins {
        return settled_duration_change(ctx, invoice, class, previous).await;
    }

    // No recalculation needed; still make sure the lesson does not linger
    // on some other unpaid invoice.
    strip_from_other_unpaid(ctx, &invoice, class.id).await
}

async fn settled_duration_change(
    ctx: &BillingContext,
    mut invoice: Invoice,
    class: &Class,
    previous: &ClassPrevious,
) -> Result<()> {
    let rate = invoice.snapshot.hourly_rate;
    if class.duration_mins > previous.duration_mins {
        // Append a positive adjustment item for the extra minutes.
        let extra = class.duration_mins - previous.duration_mins;
        let mut item = line_item_for_class(ctx, class, rate).await?;
        item.description =
            format!("Duration adjustment for lesson {}", class.id);
        item.duration_mins = extra;
        item.amount = LineItem::compute_amount(rate, extra);
        // The adjustment row is money-only; the class row already carries
        // the lesson for balance purposes.
        item.exclude_from_student_balance = true;
        item.lesson_id = String::new();
        invoice.items.push(item);
        totals::recompute(&mut invoice);
        invoice.push_activity(
            None,
            format!("Lesson {} extended by {extra} minutes", class.id),
            ctx.now(),
        );
        ctx.store.update_invoice(&mut invoice).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice.id });
    } else {
        // Shrunk: refund the difference proportionally.
        let delta_mins = previous.duration_mins - class.duration_mins;
        let hours = Hours::from_minutes(delta_mins);
        let parts_amount = (rate * hours.as_decimal()).round2();
        let refund = refund::RefundRequest {
            amount: refund_breakdown_amount(&invoice, hours, parts_amount),
            refund_hours: hours,
            reason: format!(
                "lesson {} shortened by {delta_mins} minutes",
                class.id
            ),
            refund_reference: None,
        };
        refund::record_refund(ctx, invoice.id, refund, None).await?;
    }
    Ok(())
}

/// Base amount plus the proportional transfer-fee share for `hours`.
fn refund_breakdown_amount(
    invoice: &Invoice,
    hours: Hours,
    base: tutora_core::amount::Amount,
) -> tutora_core::amount::Amount {
    let coverage = totals::paid_coverage_hours(invoice);
    let fee = &invoice.snapshot.transfer_fee;
    if fee.is_waived() || coverage.is_zero() {
        return base;
    }
    let ratio =
        (hours.as_decimal() / coverage.as_decimal()).min(Decimal::ONE);
    (base + (fee.amount * ratio).round2()).round2()
}

async fn strip_from_other_unpaid(
    ctx: &BillingContext,
    keeper: &Invoice,
    class: ClassId,
) -> Result<()> {
    let others = ctx.store.invoices_containing_class(class).await?;
    for mut other in others {
        if other.id == keeper.id || !other.active() || other.is_settled() {
            continue;
        }
        if let Some(idx) = other.item_index_for_class(class) {
            other.items.remove(idx);
            totals::recompute(&mut other);
            ctx.store.update_invoice(&mut other).await?;
        }
    }
    Ok(())
}

/// A class document was deleted.
async fn handle_deleted(ctx: &BillingContext, class: &Class) -> Result<()> {
    let Some(mut invoice) = linked_invoice(ctx, class.id).await? else {
        return Ok(());
    };

    if invoice.is_settled() {
        if let Some(idx) = invoice.item_index_for_class(class.id) {
            invoice.items.remove(idx);
            totals::recompute(&mut invoice);
            invoice.push_activity(
                None,
                format!("Deleted lesson {} removed", class.id),
                ctx.now(),
            );
            ctx.store.update_invoice(&mut invoice).await?;
            recalculate_invoice_coverage(ctx, invoice.id, Some(class.id))
                .await?;
        }
        return Ok(());
    }

    // Unpaid: plain removal.
    if let Some(idx) = invoice.item_index_for_class(class.id) {
        invoice.items.remove(idx);
        totals::recompute(&mut invoice);
        ctx.store.update_invoice(&mut invoice).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice.id });
    }
    Ok(())
}

/// Substitute the next chronologically-eligible unpaid lessons into a
/// settled invoice whose coverage cap is no longer filled by its items.
/// Only acts on paid/partially-paid invoices with a positive cap. Records a
/// high-severity audit entry when a hole remains unfilled.
pub async fn recalculate_invoice_coverage(
    ctx: &BillingContext,
    invoice_id: tutora_core::ids::InvoiceId,
    removed_class: Option<ClassId>,
) -> Result<()> {
    let mut outbox = Outbox::new();
    let mut invoice = ctx
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or(Error::not_found("invoice"))?;

    if !matches!(
        invoice.status,
        InvoiceStatus::Paid | InvoiceStatus::PartiallyPaid
    ) {
        return Ok(());
    }
    let Some(cap) = invoice.coverage.max_hours() else {
        return Ok(());
    };
    if cap.is_zero() {
        return Ok(());
    }

    let Some(guardian_id) = invoice.guardian else {
        return Ok(());
    };

    let window =
        SelectionWindow::bounded(invoice.period.start, invoice.period.end);
    let mut options = SelectOptions::new(ctx.config.selector_max_items);
    options.excluded = invoice.excluded_classes.clone();
    options.filters = invoice.coverage.filters.clone();

    let pool = selector::eligible_lessons(
        ctx,
        guardian_id,
        &window,
        &options,
        Some(invoice.id),
    )
    .await?;

    let guardian = ctx.store.get_guardian(guardian_id).await?;
    let mut changed = false;
    for class in &pool {
        if !cap.exceeds(invoice.total_item_hours()) {
            break;
        }
        if invoice.contains_class(class.id) {
            continue;
        }
        let rate = selector::resolve_rate(
            ctx,
            Some(&invoice.snapshot),
            guardian.as_ref(),
            &invoice.items,
        );
        let item = line_item_for_class(ctx, class, rate).await?;
        invoice.push_activity(
            None,
            format!("Lesson {} substituted into paid coverage", class.id),
            ctx.now(),
        );
        invoice.items.push(item);
        changed = true;
    }

    if changed {
        totals::recompute(&mut invoice);
        ctx.store.update_invoice(&mut invoice).await?;
        refund::resync_paid_flags(ctx, &invoice).await?;
        outbox.push(BillingEvent::InvoiceUpdated { invoice: invoice.id });
    }

    // A hole we could not fill needs human eyes; never silently shrink a
    // paid invoice.
    if cap.exceeds(invoice.total_item_hours()) {
        warn!(invoice = %invoice.id, "no replacement lesson available");
        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice.id,
            None,
            AuditAction::ManualReview,
            ctx.now(),
        )
        .with_severity(AuditSeverity::High)
        .with_summary(format!(
            "Paid invoice {} lost a lesson and no eligible replacement was \
             found",
            invoice.number
        ));
        ctx.store.append_audit(&audit).await?;
        outbox.push(BillingEvent::ManualReviewRequired {
            invoice: invoice.id,
            class: removed_class,
        });
    }

    outbox.drain_to(ctx.sink.as_ref());
    Ok(())
}
