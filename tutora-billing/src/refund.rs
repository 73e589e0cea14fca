//! Money and hour reversal.
//!
//! A refund reverses money, guardian/student hours, and the proportional
//! transfer fee atomically from the caller's point of view: the invoice
//! write carries the log entry, coverage reduction, and status change in one
//! version-checked update; ledger debits and class-flag resyncs follow as
//! compensating writes. History is never rewritten; the refund is a new
//! negative-direction log entry and an audit record.

use rust_decimal::Decimal;
use tracing::{info, instrument};
use tutora_core::{
    Error, Result,
    amount::Amount,
    audit::{AuditAction, AuditEntry, AuditSeverity, FieldDiff},
    hours::Hours,
    ids::{ActorId, ClassId, InvoiceId},
    invoice::{
        Invoice, InvoiceStatus, LineItem, PaymentLogDetail, PaymentLogEntry,
        PaymentMethod, PersonSnapshot,
    },
};

use crate::{
    apply::{self, PaymentRequest},
    context::BillingContext,
    lifecycle::{self, InvoiceCommand, Transition},
    outbox::{BillingEvent, Outbox},
    selector, totals,
};

/// A refund request. `amount` must match the expected decomposition
/// `refund_hours × rate + proportional transfer fee` within the configured
/// tolerance.
#[derive(Clone, Debug)]
pub struct RefundRequest {
    pub amount: Amount,
    pub refund_hours: Hours,
    pub reason: String,
    /// Gateway reference for the outbound transfer, recorded opaquely.
    pub refund_reference: Option<String>,
}

/// Post-payment adjustment payloads.
#[derive(Clone, Debug)]
pub enum AdjustmentPayload {
    /// Reduce the settled invoice; same semantics as a refund.
    Reduction {
        amount: Amount,
        hours: Hours,
        reason: String,
    },
    /// Append new items to a settled invoice (the item freeze applies to
    /// modification, not appends), optionally applying a payment for them.
    Increase {
        items: Vec<NewItemSpec>,
        payment: Option<PaymentRequest>,
    },
    /// Remove specific lessons from a settled invoice.
    RemoveLessons {
        classes: Vec<ClassId>,
        mode: RemoveMode,
    },
}

/// What happens to money and hours when lessons are removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoveMode {
    /// Return both the money and the hours for the removed lessons.
    Refund,
    /// Keep the money and treat the hours as consumed.
    Compensate,
    /// Return the money but keep the hours consumed.
    Both,
}

/// Specification of an item appended by an `Increase` adjustment.
#[derive(Clone, Debug)]
pub struct NewItemSpec {
    pub class: Option<ClassId>,
    pub description: String,
    pub date: chrono::NaiveDate,
    pub duration_mins: u32,
    pub rate: Option<Amount>,
    pub student: tutora_core::ids::StudentId,
    pub teacher: tutora_core::ids::TeacherId,
}

/// The expected money decomposition of a refund over `hours`.
struct RefundBreakdown {
    base: Amount,
    fee_refund: Amount,
    expected: Amount,
}

fn breakdown(invoice: &Invoice, hours: Hours) -> RefundBreakdown {
    let rate = invoice.snapshot.hourly_rate;
    let base = (rate * hours.as_decimal()).round2();

    let coverage = totals::paid_coverage_hours(invoice);
    let fee = &invoice.snapshot.transfer_fee;
    let fee_refund = if fee.is_waived() || coverage.is_zero() {
        Amount::ZERO
    } else {
        let ratio = (hours.as_decimal() / coverage.as_decimal())
            .min(Decimal::ONE);
        (fee.amount_for(invoice.subtotal) * ratio).round2()
    };

    RefundBreakdown { base, fee_refund, expected: (base + fee_refund).round2() }
}

#[instrument(skip_all, name = "(record-refund)", fields(invoice = %invoice_id))]
pub async fn record_refund(
    ctx: &BillingContext,
    invoice_id: InvoiceId,
    req: RefundRequest,
    actor: Option<ActorId>,
) -> Result<Invoice> {
    let now = ctx.now();
    let mut outbox = Outbox::new();

    let mut invoice = ctx
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or(Error::not_found("invoice"))?;

    // 1. Validation.
    if req.amount.is_zero() {
        return Err(Error::validation("refund amount must be positive"));
    }
    if req.refund_hours.is_zero() {
        return Err(Error::validation("refund hours must be positive"));
    }
    lifecycle::check_transition(invoice.status, Transition::RefundPartial)?;
    let coverage_before = totals::paid_coverage_hours(&invoice);
    if req.refund_hours.exceeds(coverage_before) {
        return Err(Error::validation(format!(
            "refund of {} hours exceeds paid coverage of {} hours",
            req.refund_hours, coverage_before
        )));
    }

    // 2. The money must decompose as hours × rate + proportional fee.
    let parts = breakdown(&invoice, req.refund_hours);
    if (req.amount.as_decimal() - parts.expected.as_decimal()).abs()
        > ctx.config.refund_tolerance
    {
        return Err(Error::validation(format!(
            "refund amount {} does not match {} hours: expected {} \
             ({} base + {} proportional transfer fee)",
            req.amount,
            req.refund_hours,
            parts.expected,
            parts.base,
            parts.fee_refund,
        )));
    }

    let status_before = invoice.status;
    let paid_before = invoice.paid_amount;

    // 3. Append the reversal entry.
    invoice.payment_log.push(PaymentLogEntry {
        amount: req.amount,
        method: PaymentMethod::Refund,
        transaction_id: req.refund_reference.clone(),
        idempotency_key: None,
        processed_at: now,
        actor,
        note: None,
        detail: PaymentLogDetail::Refund {
            hours: req.refund_hours,
            reason: req.reason.clone(),
        },
    });

    // 5. Coverage shrinks to the net paid hours.
    let new_coverage = totals::paid_coverage_hours(&invoice);
    invoice.coverage.set_max_hours(new_coverage);

    // 6. Totals and status.
    totals::recompute(&mut invoice);
    let full = invoice.paid_amount.is_zero();
    let transition =
        if full { Transition::RefundFull } else { Transition::RefundPartial };
    invoice.status = lifecycle::check_transition(status_before, transition)?;
    if full {
        invoice.paid_at = None;
    }
    invoice.updated_by = actor;
    let summary = format!(
        "Refunded {} ({} hours): {}",
        req.amount, req.refund_hours, req.reason
    );
    invoice.push_activity(actor, summary.clone(), now);

    ctx.store.update_invoice(&mut invoice).await?;

    // 4. Debit the guardian ledger, allocating across students
    // proportionally to their item-hour shares; student ledgers clamp at
    // zero and the remainder stays on the guardian's unallocated total.
    debit_hours_for_refund(ctx, &invoice, req.refund_hours).await?;

    // 7. Classes outside the reduced coverage lose their paid flag.
    resync_paid_flags(ctx, &invoice).await?;

    // 8. Audit with the full before/after.
    let audit = AuditEntry::new(
        ctx.ids.audit_id(),
        invoice_id,
        actor,
        AuditAction::Refund,
        now,
    )
    .with_diff("status", FieldDiff::new(&status_before, &invoice.status))
    .with_diff("paid_amount", FieldDiff::new(&paid_before, &invoice.paid_amount))
    .with_diff(
        "coverage_hours",
        FieldDiff::new(&coverage_before, &new_coverage),
    )
    .with_summary(summary);
    ctx.store.append_audit(&audit).await?;

    if full {
        outbox.push(BillingEvent::InvoiceRefunded { invoice: invoice_id });
    } else {
        outbox.push(BillingEvent::InvoiceUpdated { invoice: invoice_id });
    }
    outbox.push(BillingEvent::StatsUpdated);
    outbox.drain_to(ctx.sink.as_ref());

    info!(amount = %req.amount, hours = %req.refund_hours, "refund recorded");
    Ok(invoice)
}

/// Debit `hours` from the guardian, allocating per-student shares
/// proportionally to item hours.
async fn debit_hours_for_refund(
    ctx: &BillingContext,
    invoice: &Invoice,
    hours: Hours,
) -> Result<()> {
    let Some(guardian_id) = invoice.guardian else {
        return Ok(());
    };
    if let Some(mut guardian) = ctx.store.get_guardian(guardian_id).await? {
        guardian.debit_hours(hours);
        ctx.store.update_guardian(&guardian).await?;
    }

    let shares = totals::student_hour_shares(invoice);
    let total: Hours = shares.iter().map(|(_, h)| *h).sum();
    if total.is_zero() {
        return Ok(());
    }
    for (student_id, share) in shares {
        let fraction = share.as_decimal() / total.as_decimal();
        let debit = (hours * fraction).round3();
        if debit.is_zero() {
            continue;
        }
        if let Some(mut student) = ctx.store.get_student(student_id).await? {
            student.debit_hours_clamped(debit);
            ctx.store.update_student(&student).await?;
        }
    }
    Ok(())
}

/// Resync `paid_by_guardian` across the invoice's classes from the current
/// paid coverage.
pub async fn resync_paid_flags(
    ctx: &BillingContext,
    invoice: &Invoice,
) -> Result<()> {
    let covered = totals::paid_coverage_hours(invoice);
    let covered_ids = totals::covered_class_ids(invoice, covered);
    for item in &invoice.items {
        let should = covered_ids.contains(&item.class);
        if let Some(mut class) = ctx.store.get_class(item.class).await? {
            if class.paid_by_guardian != should {
                class.paid_by_guardian = should;
                ctx.store.update_class(&class).await?;
            }
        }
    }
    Ok(())
}

/// Apply a post-payment adjustment to a settled invoice.
#[instrument(
    skip_all,
    name = "(post-payment-adjustment)",
    fields(invoice = %invoice_id)
)]
pub async fn apply_post_payment_adjustment(
    ctx: &BillingContext,
    invoice_id: InvoiceId,
    payload: AdjustmentPayload,
    actor: Option<ActorId>,
) -> Result<Invoice> {
    match payload {
        AdjustmentPayload::Reduction { amount, hours, reason } => {
            record_refund(
                ctx,
                invoice_id,
                RefundRequest {
                    amount,
                    refund_hours: hours,
                    reason,
                    refund_reference: None,
                },
                actor,
            )
            .await
        }
        AdjustmentPayload::Increase { items, payment } => {
            increase(ctx, invoice_id, items, payment, actor).await
        }
        AdjustmentPayload::RemoveLessons { classes, mode } => {
            remove_lessons(ctx, invoice_id, &classes, mode, actor).await
        }
    }
}

async fn increase(
    ctx: &BillingContext,
    invoice_id: InvoiceId,
    specs: Vec<NewItemSpec>,
    payment: Option<PaymentRequest>,
    actor: Option<ActorId>,
) -> Result<Invoice> {
    if specs.is_empty() {
        return Err(Error::validation("increase requires at least one item"));
    }
    let now = ctx.now();
    let mut invoice = ctx
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or(Error::not_found("invoice"))?;
    if !invoice.is_settled() {
        return Err(Error::validation(
            "post-payment adjustments require a settled invoice",
        ));
    }

    let guardian = match invoice.guardian {
        Some(id) => ctx.store.get_guardian(id).await?,
        None => None,
    };
    let total_before = invoice.total;

    for spec in specs {
        let rate = spec.rate.unwrap_or_else(|| {
            selector::resolve_rate(
                ctx,
                Some(&invoice.snapshot),
                guardian.as_ref(),
                &invoice.items,
            )
        });
        let item = build_item(ctx, &spec, rate).await?;
        invoice.items.push(item);
    }
    totals::recompute(&mut invoice);
    // The appended items re-open a balance; a paid invoice drops back to
    // partially paid so the follow-up payment is accepted.
    if invoice.status == InvoiceStatus::Paid
        && !invoice.remaining_balance().is_zero()
    {
        invoice.status = InvoiceStatus::PartiallyPaid;
    }
    invoice.updated_by = actor;
    invoice.push_activity(actor, "Items appended by adjustment", now);
    ctx.store.update_invoice(&mut invoice).await?;

    let audit = AuditEntry::new(
        ctx.ids.audit_id(),
        invoice_id,
        actor,
        AuditAction::Adjustment,
        now,
    )
    .with_diff("total", FieldDiff::new(&total_before, &invoice.total))
    .with_summary("Post-payment increase");
    ctx.store.append_audit(&audit).await?;

    if let Some(payment) = payment {
        let outcome = apply::apply(ctx, invoice_id, payment, actor).await?;
        return Ok(outcome.invoice);
    }
    Ok(invoice)
}

async fn build_item(
    ctx: &BillingContext,
    spec: &NewItemSpec,
    rate: Amount,
) -> Result<LineItem> {
    let student_snapshot = match ctx.store.get_student(spec.student).await? {
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
    let teacher_snapshot = match ctx.store.get_teacher(spec.teacher).await? {
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
    let class = spec.class.unwrap_or(ClassId::from_array([0; 16]));
    Ok(LineItem {
        class,
        lesson_id: spec
            .class
            .map(|c| c.to_string())
            .unwrap_or_default(),
        student: spec.student,
        student_snapshot,
        teacher: spec.teacher,
        teacher_snapshot,
        description: spec.description.clone(),
        date: spec.date,
        duration_mins: spec.duration_mins,
        rate,
        amount: LineItem::compute_amount(rate, spec.duration_mins),
        attended: false,
        status: None,
        exclude_from_student_balance: false,
        exempt_from_guardian: false,
        exclude_from_teacher_payment: false,
    })
}

async fn remove_lessons(
    ctx: &BillingContext,
    invoice_id: InvoiceId,
    classes: &[ClassId],
    mode: RemoveMode,
    actor: Option<ActorId>,
) -> Result<Invoice> {
    if classes.is_empty() {
        return Err(Error::validation(
            "removeLessons requires at least one class",
        ));
    }
    let now = ctx.now();
    let mut invoice = ctx
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or(Error::not_found("invoice"))?;
    if !invoice.is_settled() {
        return Err(Error::validation(
            "post-payment adjustments require a settled invoice",
        ));
    }
    let command = InvoiceCommand::paid_modification();
    lifecycle::ensure_items_mutable(&invoice, &command)?;

    let mut removed_hours = Hours::ZERO;
    let mut removed_amount = Amount::ZERO;
    for class in classes {
        let Some(idx) = invoice.item_index_for_class(*class) else {
            return Err(Error::validation(format!(
                "class {class} is not on this invoice"
            )));
        };
        let item = invoice.items.remove(idx);
        removed_hours = removed_hours + item.hours();
        removed_amount = removed_amount + item.amount;
    }

    // Money/hour behaviour by mode.
    let (refund_money, refund_hours) = match mode {
        RemoveMode::Refund => (true, removed_hours),
        RemoveMode::Compensate => (false, Hours::ZERO),
        RemoveMode::Both => (true, Hours::ZERO),
    };
    if refund_money {
        let fee_share = {
            let fee = &invoice.snapshot.transfer_fee;
            if fee.is_waived() || invoice.subtotal.is_zero() {
                Amount::ZERO
            } else {
                let ratio = (removed_amount.as_decimal()
                    / invoice.subtotal.as_decimal())
                .min(Decimal::ONE);
                (fee.amount * ratio).round2()
            }
        };
        invoice.payment_log.push(PaymentLogEntry {
            amount: (removed_amount + fee_share).round2(),
            method: PaymentMethod::Refund,
            transaction_id: None,
            idempotency_key: None,
            processed_at: now,
            actor,
            note: None,
            detail: PaymentLogDetail::Refund {
                hours: refund_hours,
                reason: "lessons removed from paid invoice".to_owned(),
            },
        });
    }

    let new_coverage = totals::paid_coverage_hours(&invoice);
    invoice.coverage.set_max_hours(new_coverage);
    totals::recompute(&mut invoice);
    if invoice.paid_amount.is_zero()
        && lifecycle::check_transition(invoice.status, Transition::RefundFull)
            .is_ok()
    {
        invoice.status = InvoiceStatus::Refunded;
        invoice.paid_at = None;
    }
    invoice.updated_by = actor;
    invoice.push_activity(
        actor,
        format!("{} lessons removed by adjustment", classes.len()),
        now,
    );
    ctx.store.update_invoice(&mut invoice).await?;

    if !refund_hours.is_zero() {
        debit_hours_for_refund(ctx, &invoice, refund_hours).await?;
    }
    resync_paid_flags(ctx, &invoice).await?;

    let audit = AuditEntry::new(
        ctx.ids.audit_id(),
        invoice_id,
        actor,
        AuditAction::Adjustment,
        now,
    )
    .with_summary(format!(
        "Removed {} lessons ({:?} mode)",
        classes.len(),
        mode
    ))
    .with_severity(AuditSeverity::Normal);
    ctx.store.append_audit(&audit).await?;

    ctx.sink
        .post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
    Ok(invoice)
}
