//! Payment application.
//!
//! The pipeline runs check, persist-record, mutate, mark-applied:
//!
//! 1. Load the invoice; an already-settled invoice short-circuits to a
//!    duplicate-success.
//! 2. Insert the [`PaymentRecord`] idempotency gate (unique on
//!    (invoice, idempotency_key) and (invoice, transaction_id)).
//! 3. Normalise amount and hours against the resolved rate and proportional
//!    transfer fee.
//! 4. Re-check for a concurrently-landed duplicate on fresh data.
//! 5. Advance coverage and totals, append the log entry, transition status.
//! 6. Persist the invoice (optimistic version check), then credit the
//!    guardian ledger, distribute the tip, and mark the record applied.
//! 7. On reaching paid: flag covered classes, strip this invoice's classes
//!    from other unpaid invoices, and run the follow-up generator.
//!
//! The invoice write is the sensitive one; everything after it is
//! compensating-writes territory and the pending [`PaymentRecord`] is the
//! marker a reconciler would use after a crash.

use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use tutora_core::{
    Error, Result,
    amount::Amount,
    audit::{AuditAction, AuditEntry, FieldDiff},
    hours::Hours,
    ids::{ActorId, InvoiceId},
    invoice::{
        Invoice, InvoiceStatus, PaymentLogDetail, PaymentLogEntry,
        PaymentMethod,
    },
    payment::{PaymentRecord, PaymentState},
    time::TimestampMs,
};

use crate::{
    context::BillingContext,
    lifecycle::{self, Transition},
    outbox::{BillingEvent, Outbox},
    selector, totals,
    traits::PaymentInsert,
    zero_hours,
};

/// A request to apply a payment. At least one of `amount` and `paid_hours`
/// must be present; `amount` excludes the tip.
#[derive(Clone, Debug, Default)]
pub struct PaymentRequest {
    pub amount: Option<Amount>,
    pub payment_method: Option<PaymentMethod>,
    pub transaction_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub tip: Option<Amount>,
    pub paid_hours: Option<Hours>,
    pub paid_at: Option<TimestampMs>,
    pub note: Option<String>,
}

/// The result of a (possibly idempotently-skipped) payment application.
#[derive(Clone, Debug)]
pub struct PaymentOutcome {
    pub invoice: Invoice,
    /// False when the request was recognised as a duplicate.
    pub applied: bool,
    pub duplicate: bool,
    pub remaining_before: Amount,
}

impl PaymentOutcome {
    fn duplicate(invoice: Invoice, remaining_before: Amount) -> Self {
        Self { invoice, applied: false, duplicate: true, remaining_before }
    }
}

/// Amount and hours after normalisation, plus the decomposition they were
/// validated against.
struct Normalized {
    /// Tip-exclusive amount.
    amount: Amount,
    hours: Hours,
    tip: Amount,
}

#[instrument(skip_all, name = "(apply-payment)", fields(invoice = %invoice_id))]
pub async fn apply(
    ctx: &BillingContext,
    invoice_id: InvoiceId,
    req: PaymentRequest,
    actor: Option<ActorId>,
) -> Result<PaymentOutcome> {
    let now = ctx.now();
    let paid_at = req.paid_at.unwrap_or(now);
    let method =
        req.payment_method.clone().unwrap_or(PaymentMethod::Manual);
    let mut outbox = Outbox::new();

    // 1. Load; settled invoices short-circuit.
    let invoice = ctx
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or(Error::not_found("invoice"))?;
    let remaining_before = invoice.remaining_balance();
    if invoice.status == InvoiceStatus::Paid || remaining_before.is_zero() {
        info!("payment on settled invoice, returning duplicate-success");
        return Ok(PaymentOutcome::duplicate(invoice, remaining_before));
    }

    // Validate the source state up front; full vs partial share sources.
    lifecycle::check_transition(invoice.status, Transition::PaymentPartial)?;

    // 2. The idempotency gate.
    let mut record = PaymentRecord::pending(
        ctx.ids.payment_id(),
        invoice_id,
        req.amount.unwrap_or(Amount::ZERO),
        method.clone(),
        req.transaction_id.clone(),
        req.idempotency_key.clone(),
        now,
    );
    match ctx.store.insert_payment(&record).await? {
        PaymentInsert::Inserted => {}
        PaymentInsert::Duplicate(existing) => {
            info!(
                state = %existing.state,
                "duplicate payment key, returning prior result"
            );
            return Ok(PaymentOutcome::duplicate(invoice, remaining_before));
        }
    }

    // Fingerprint scan against the supplied values.
    let supplied_tip = req.tip.unwrap_or(Amount::ZERO);
    let supplied_total = req.amount.map(|a| a + supplied_tip);
    if log_fingerprint_match(
        &invoice,
        supplied_total,
        req.paid_hours,
        &method,
        supplied_tip,
        req.transaction_id.as_deref(),
        paid_at,
        ctx.config.duplicate_window_ms,
    ) {
        fail_record(ctx, &mut record).await;
        return Ok(PaymentOutcome::duplicate(invoice, remaining_before));
    }

    // 3. Normalise amount and hours.
    let normalized = match normalize(ctx, &invoice, &req).await {
        Ok(n) => n,
        Err(err) => {
            fail_record(ctx, &mut record).await;
            return Err(err);
        }
    };
    let amount_with_tip = normalized.amount + normalized.tip;

    // 4. Re-check on fresh data; a racing request may have landed since
    // step 1.
    let mut invoice = ctx
        .store
        .get_invoice(invoice_id)
        .await?
        .ok_or(Error::not_found("invoice"))?;
    if invoice.status == InvoiceStatus::Paid
        || invoice.remaining_balance().is_zero()
    {
        fail_record(ctx, &mut record).await;
        return Ok(PaymentOutcome::duplicate(invoice, remaining_before));
    }
    if log_fingerprint_match(
        &invoice,
        Some(amount_with_tip),
        Some(normalized.hours),
        &method,
        normalized.tip,
        req.transaction_id.as_deref(),
        paid_at,
        ctx.config.duplicate_window_ms,
    ) {
        fail_record(ctx, &mut record).await;
        return Ok(PaymentOutcome::duplicate(invoice, remaining_before));
    }

    let status_before = invoice.status;
    let paid_before = invoice.paid_amount;

    // 5. Advance coverage over the class-linked items.
    let total_hours = invoice.total_item_hours();
    let has_payments =
        invoice.payment_log.iter().any(PaymentLogEntry::is_payment);
    let currently_covered = if has_payments {
        invoice
            .coverage
            .max_hours()
            .unwrap_or(total_hours)
            .min(total_hours)
    } else {
        Hours::ZERO
    };
    let new_covered =
        (currently_covered + normalized.hours).min(total_hours);
    if !invoice.items.is_empty() {
        invoice.coverage.set_max_hours(new_covered);
        totals::expand_period_to_items(&mut invoice);
    }

    // 6. Append the log entry, recompute, advance the state machine.
    let entry = PaymentLogEntry {
        amount: amount_with_tip,
        method: method.clone(),
        transaction_id: req.transaction_id.clone(),
        idempotency_key: req.idempotency_key.clone(),
        processed_at: paid_at,
        actor,
        note: req.note.clone(),
        detail: PaymentLogDetail::Payment {
            paid_hours: Some(normalized.hours),
            tip: normalized.tip,
        },
    };
    invoice.payment_log.push(entry.clone());
    invoice.tip = invoice.tip + normalized.tip;

    // Tip distribution entries are appended before the single invoice
    // write.
    let tip_credits =
        distribute_tip(ctx, &mut invoice, normalized.tip, actor, now).await?;

    totals::recompute(&mut invoice);

    let full = invoice.remaining_balance().is_zero();
    let transition = if full {
        Transition::PaymentFull
    } else {
        Transition::PaymentPartial
    };
    invoice.status = lifecycle::check_transition(invoice.status, transition)?;
    if full {
        invoice.paid_at = Some(paid_at);
    }
    invoice.updated_by = actor;
    invoice.push_activity(
        actor,
        format!(
            "Payment of {} received ({})",
            amount_with_tip, method
        ),
        now,
    );

    // The sensitive write. A version conflict releases the idempotency key
    // so the caller's retry can take it again.
    if let Err(err) = ctx.store.update_invoice(&mut invoice).await {
        fail_record(ctx, &mut record).await;
        return Err(err);
    }

    let audit = AuditEntry::new(
        ctx.ids.audit_id(),
        invoice_id,
        actor,
        AuditAction::PaymentApplied,
        now,
    )
    .with_diff("status", FieldDiff::new(&status_before, &invoice.status))
    .with_diff("paid_amount", FieldDiff::new(&paid_before, &invoice.paid_amount))
    .with_summary(format!(
        "Payment of {amount_with_tip} applied; {} remaining",
        invoice.remaining_balance()
    ));
    ctx.store.append_audit(&audit).await?;

    // 7. Credit the guardian hour balance with the eligible increment.
    let credit = if invoice.items.is_empty() {
        normalized.hours
    } else {
        totals::eligible_increment(&invoice, currently_covered, new_covered)
    };
    if let Some(guardian_id) = invoice.guardian {
        if let Some(mut guardian) =
            ctx.store.get_guardian(guardian_id).await?
        {
            guardian.credit_hours(credit);
            // A manual credit landed; a stale recomputation must not
            // clobber it.
            guardian.auto_total = false;
            ctx.store.update_guardian(&guardian).await?;
        }
    }

    // 8. Credit each tipped teacher's monthly earnings.
    let month = paid_at.date_utc();
    for (teacher_id, share) in &tip_credits {
        if let Some(mut teacher) = ctx.store.get_teacher(*teacher_id).await? {
            use chrono::Datelike;
            teacher.add_month_earnings(month.year(), month.month(), *share);
            ctx.store.update_teacher(&teacher).await?;
        }
    }

    // 9. The record becomes the durable proof of application.
    record.amount = amount_with_tip;
    record.mark_applied(now, entry);
    ctx.store.update_payment(&record).await?;

    // 10. Paid-only side effects.
    if full {
        if new_covered.approx_eq(total_hours) && !invoice.items.is_empty() {
            mark_classes_paid(ctx, &invoice).await?;
        }
        strip_classes_from_other_unpaid(ctx, &invoice).await?;
        outbox.push(BillingEvent::InvoicePaid { invoice: invoice_id });

        if let Some(guardian_id) = invoice.guardian {
            match zero_hours::follow_up_check(ctx, guardian_id).await {
                // The generator emits its own creation events.
                Ok(Some(_)) | Ok(None) => {}
                Err(Error::NoFutureClassesZeroBalance) => outbox.push(
                    BillingEvent::ZeroBalanceNoFutureClasses {
                        guardian: guardian_id,
                    },
                ),
                Err(err) =>
                    warn!("post-payment follow-up check failed: {err}"),
            }
        }
    } else {
        outbox
            .push(BillingEvent::InvoicePartiallyPaid { invoice: invoice_id });
    }
    outbox.push(BillingEvent::StatsUpdated);
    outbox.drain_to(ctx.sink.as_ref());

    info!(amount = %amount_with_tip, full, "payment applied");
    Ok(PaymentOutcome {
        invoice,
        applied: true,
        duplicate: false,
        remaining_before,
    })
}

/// Best-effort demotion of a pending record that will not be applied.
async fn fail_record(ctx: &BillingContext, record: &mut PaymentRecord) {
    record.state = PaymentState::Failed;
    if let Err(err) = ctx.store.update_payment(record).await {
        warn!("could not mark payment record failed: {err}");
    }
}

/// Normalise amount and hours. The effective hourly price folds the
/// proportional transfer fee in: `rate + fee / scheduled hours`, so an
/// amount paying N hours also pays N hours' worth of the fee.
async fn normalize(
    ctx: &BillingContext,
    invoice: &Invoice,
    req: &PaymentRequest,
) -> Result<Normalized> {
    let guardian = match invoice.guardian {
        Some(id) => ctx.store.get_guardian(id).await?,
        None => None,
    };
    let rate = selector::resolve_rate(
        ctx,
        Some(&invoice.snapshot),
        guardian.as_ref(),
        &invoice.items,
    );

    let total_hours = invoice.total_item_hours();
    let fee = invoice.snapshot.transfer_fee.amount_for(invoice.subtotal);
    let fee_per_hour = if !total_hours.is_zero() && !fee.is_zero() {
        fee.as_decimal() / total_hours.as_decimal()
    } else {
        Decimal::ZERO
    };
    let effective = rate.as_decimal() + fee_per_hour;
    let tip = req.tip.unwrap_or(Amount::ZERO);

    let (amount, hours) = match (req.amount, req.paid_hours) {
        (None, None) => {
            return Err(Error::validation(
                "either amount or paidHours is required",
            ));
        }
        (Some(amount), None) => {
            let hours = if effective > Decimal::ZERO {
                Hours::try_from_decimal(amount.as_decimal() / effective)
                    .map_err(|e| Error::validation(e.to_string()))?
                    .round3()
            } else {
                Hours::ZERO
            };
            (amount, hours)
        }
        (None, Some(hours)) => {
            let amount =
                Amount::try_from_decimal(hours.as_decimal() * effective)
                    .map_err(|e| Error::validation(e.to_string()))?
                    .round2();
            (amount, hours)
        }
        (Some(amount), Some(hours)) => {
            let expected = hours.as_decimal() * effective;
            if (amount.as_decimal() - expected).abs()
                > ctx.config.amount_tolerance
            {
                let base = hours.as_decimal() * rate.as_decimal();
                let prop_fee = hours.as_decimal() * fee_per_hour;
                return Err(Error::validation(format!(
                    "amount {amount} does not match {hours} hours: expected \
                     {expected:.2} ({hours} x rate {rate} = {base:.2}, plus \
                     proportional transfer fee {prop_fee:.2})",
                )));
            }
            (amount, hours)
        }
    };

    Ok(Normalized { amount, hours, tip })
}

/// Whether an existing payment log entry matches this request's fingerprint:
/// identical amount, method, tip, and hours, plus either a matching
/// transaction id or a processed-at within the duplicate window.
#[allow(clippy::too_many_arguments)]
fn log_fingerprint_match(
    invoice: &Invoice,
    amount_with_tip: Option<Amount>,
    hours: Option<Hours>,
    method: &PaymentMethod,
    tip: Amount,
    transaction_id: Option<&str>,
    at: TimestampMs,
    window_ms: u64,
) -> bool {
    invoice.payment_log.iter().any(|entry| {
        if !entry.is_payment() || &entry.method != method {
            return false;
        }
        if entry.tip() != tip {
            return false;
        }
        if let Some(amount) = amount_with_tip {
            if entry.amount != amount {
                return false;
            }
        }
        if let Some(hours) = hours {
            match entry.paid_hours() {
                Some(logged) if logged.approx_eq(hours) => {}
                _ => return false,
            }
        }
        let tx_match = matches!(
            (transaction_id, entry.transaction_id.as_deref()),
            (Some(a), Some(b)) if a == b
        );
        let time_match = entry.processed_at.abs_diff(at) <= window_ms;
        tx_match || time_match
    })
}

/// Split the net tip (after the platform cut) across the invoice's teachers
/// proportionally to their item amounts, appending one log entry per
/// teacher. Returns the per-teacher credits. The rounding remainder goes to
/// the largest-share teacher; ties break by ascending teacher id.
async fn distribute_tip(
    ctx: &BillingContext,
    invoice: &mut Invoice,
    tip: Amount,
    actor: Option<ActorId>,
    now: TimestampMs,
) -> Result<Vec<(tutora_core::ids::TeacherId, Amount)>> {
    if tip.is_zero() {
        return Ok(Vec::new());
    }

    let cut = ctx.config.tip_platform_cut;
    let net = (tip * (Decimal::ONE - cut)).round2();

    // Group item amounts by non-excluded teacher.
    let mut shares: Vec<(tutora_core::ids::TeacherId, Amount)> = Vec::new();
    for item in &invoice.items {
        if item.exclude_from_teacher_payment {
            continue;
        }
        let excluded = match ctx.store.get_teacher(item.teacher).await? {
            Some(teacher) => teacher.exclude_from_tips,
            None => false,
        };
        if excluded {
            continue;
        }
        match shares.iter_mut().find(|(t, _)| *t == item.teacher) {
            Some((_, sum)) => *sum = *sum + item.amount,
            None => shares.push((item.teacher, item.amount)),
        }
    }
    let total: Amount = shares.iter().map(|(_, a)| *a).sum();
    if shares.is_empty() || total.is_zero() {
        return Ok(Vec::new());
    }

    let mut credits: Vec<(tutora_core::ids::TeacherId, Amount)> = shares
        .iter()
        .map(|(teacher, amount)| {
            let fraction = amount.as_decimal() / total.as_decimal();
            (*teacher, (net * fraction).round2())
        })
        .collect();

    // Assign the rounding remainder deterministically.
    let distributed: Amount = credits.iter().map(|(_, a)| *a).sum();
    if let Some(remainder) = net.checked_sub(distributed) {
        if !remainder.is_zero() {
            let largest = credits
                .iter()
                .enumerate()
                .max_by(|(ai, a), (bi, b)| {
                    a.1.cmp(&b.1)
                        // Reversed id order so max() picks the smaller id
                        // on ties.
                        .then(shares[*bi].0.cmp(&shares[*ai].0))
                })
                .map(|(i, _)| i);
            if let Some(i) = largest {
                credits[i].1 = credits[i].1 + remainder;
            }
        }
    }

    for (teacher, share) in &credits {
        invoice.payment_log.push(PaymentLogEntry {
            amount: *share,
            method: PaymentMethod::TipDistribution,
            transaction_id: None,
            idempotency_key: None,
            processed_at: now,
            actor,
            note: None,
            detail: PaymentLogDetail::TipDistribution { teacher: *teacher },
        });
    }

    Ok(credits)
}

/// Flag every class on the invoice as paid-by-guardian.
async fn mark_classes_paid(
    ctx: &BillingContext,
    invoice: &Invoice,
) -> Result<()> {
    for item in &invoice.items {
        if let Some(mut class) = ctx.store.get_class(item.class).await? {
            if !class.paid_by_guardian {
                class.paid_by_guardian = true;
                ctx.store.update_class(&class).await?;
            }
        }
    }
    Ok(())
}

/// Remove every class on the newly-paid invoice from all other unpaid
/// invoices it may appear on.
async fn strip_classes_from_other_unpaid(
    ctx: &BillingContext,
    paid: &Invoice,
) -> Result<()> {
    for item in &paid.items {
        let others = ctx.store.invoices_containing_class(item.class).await?;
        for mut other in others {
            if other.id == paid.id
                || !other.active()
                || !other.status.is_unpaid_family()
                || other.status.is_settled()
            {
                continue;
            }
            if let Some(idx) = other.item_index_for_class(item.class) {
                other.items.remove(idx);
                totals::recompute(&mut other);
                other.push_activity(
                    None,
                    format!(
                        "Lesson moved to paid invoice {}",
                        paid.number
                    ),
                    ctx.now(),
                );
                match ctx.store.update_invoice(&mut other).await {
                    Ok(()) => {}
                    // A racing writer wins; the duplicate sweep runs again
                    // on the next touch.
                    Err(Error::Conflict) => warn!(
                        invoice = %other.id,
                        "conflict stripping duplicated lesson, skipping"
                    ),
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Ok(())
}
