//! `BillingManager`, the top-level cloneable actor exposing the main
//! entrypoints for invoice actions.
//!
//! Each mutation follows the same discipline: load the aggregate, validate
//! against the state machine, mutate in memory, persist with the optimistic
//! version check, then run compensating writes (ledgers, flags, audit) and
//! finally drain the outbox. Concurrent writers to the same invoice are
//! serialized by the version token; the loser gets
//! [`Error::Conflict`] and retries.

use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use tracing::{info, instrument};
use tutora_core::{
    Error, Result,
    amount::Amount,
    audit::{AuditAction, AuditEntry, FieldDiff},
    class::Class,
    hours::Hours,
    ids::{ActorId, AuditId, ClassId, GuardianId, InvoiceId, TeacherId},
    invoice::{
        Coverage, DeliveryAttempt, DeliveryChannel, DeliveryStatus,
        FinancialSnapshot, Invoice, InvoiceKind, InvoiceStatus, LineItem,
        PaymentLogDetail, TransferFee,
    },
    party::Guardian,
    payment::PaymentState,
    period::BillingPeriod,
};

use crate::{
    allocator,
    apply::{self, PaymentOutcome, PaymentRequest},
    context::BillingContext,
    dispatcher::{self, ClassEvent},
    export::{CurrencyFormat, ExportSnapshot},
    lifecycle::{self, InvoiceCommand, Transition},
    outbox::{BillingEvent, Outbox},
    query::{InvoiceFilter, StatsOverview},
    refund::{self, AdjustmentPayload, NewItemSpec, RefundRequest},
    selector::{self, SelectOptions, SelectionWindow},
    snapshot, totals,
};

/// Who is asking. Role scoping happens in the manager, not the HTTP layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Admin,
    Guardian(GuardianId),
    Teacher(TeacherId),
    Public,
}

/// A manual invoice creation request.
#[derive(Clone, Debug)]
pub struct CreateInvoiceRequest {
    pub kind: InvoiceKind,
    pub guardian: Option<GuardianId>,
    pub teacher: Option<TeacherId>,
    pub period: BillingPeriod,
    pub due_date: Option<NaiveDate>,
    pub coverage: Option<Coverage>,
    /// Populate items from the lesson selector.
    pub select_lessons: bool,
    pub notes: Option<String>,
}

/// Metadata fields an admin may edit.
#[derive(Clone, Debug, Default)]
pub struct UpdateInvoiceRequest {
    pub name: Option<String>,
    pub notes: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub discount: Option<Amount>,
    pub late_fee: Option<Amount>,
}

/// Options for the paid-flag rebuild sweep.
#[derive(Clone, Debug, Default)]
pub struct RebuildFlagsOptions {
    pub invoice: Option<InvoiceId>,
    pub since_days: Option<i64>,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

/// Admin-computed totals applied without recalculation.
#[derive(Clone, Copy, Debug)]
pub struct PreviewTotals {
    pub subtotal: Amount,
    pub total: Amount,
}

/// One item edit operation.
#[derive(Clone, Debug)]
pub enum ItemOp {
    Add(NewItemSpec),
    Update { class: ClassId, patch: ItemPatch },
    Remove { class: ClassId },
}

#[derive(Clone, Debug, Default)]
pub struct ItemPatch {
    pub duration_mins: Option<u32>,
    pub attended: Option<bool>,
    pub description: Option<String>,
    pub exempt_from_guardian: Option<bool>,
    pub exclude_from_teacher_payment: Option<bool>,
}

/// The top-level billing actor. Cheap to clone; all state is behind the
/// context's store handle.
#[derive(Clone)]
pub struct BillingManager {
    ctx: BillingContext,
}

impl BillingManager {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BillingContext {
        &self.ctx
    }

    // --- Creation --- //

    /// Manual creation by an admin. Starts in `draft`.
    #[instrument(skip_all, name = "(create-invoice)")]
    pub async fn create_invoice(
        &self,
        req: CreateInvoiceRequest,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut outbox = Outbox::new();

        let guardian = match req.kind {
            InvoiceKind::GuardianInvoice => {
                let id = req.guardian.ok_or_else(|| {
                    Error::validation(
                        "guardian is required for a guardian invoice",
                    )
                })?;
                Some(id)
            }
            InvoiceKind::TeacherPayment => {
                req.teacher.ok_or_else(|| {
                    Error::validation(
                        "teacher is required for a teacher payment",
                    )
                })?;
                req.guardian
            }
        };

        let guardian_doc: Option<Guardian> = match guardian {
            Some(id) => ctx.store.get_guardian(id).await?,
            None => None,
        };
        let financial = match &guardian_doc {
            Some(g) => snapshot::build_guardian_financial_snapshot(g),
            None => FinancialSnapshot {
                hourly_rate: ctx.config.default_hourly_rate,
                transfer_fee: TransferFee::none(),
            },
        };

        let sequence = allocator::allocate_next(ctx, req.kind).await?;
        let identifiers = allocator::build_identifiers(
            ctx,
            sequence,
            Some((req.period.year, req.period.month)),
        );

        let coverage = req.coverage.unwrap_or_else(Coverage::full_period);
        let mut invoice = Invoice {
            id: ctx.ids.invoice_id(),
            kind: req.kind,
            sequence,
            number: identifiers.number,
            name: identifiers.name,
            manual_name: false,
            slug: identifiers.slug,
            guardian,
            teacher: req.teacher,
            created_by: actor,
            updated_by: None,
            period: req.period,
            items: Vec::new(),
            coverage,
            snapshot: financial,
            subtotal: Amount::ZERO,
            discount: Amount::ZERO,
            tax: Amount::ZERO,
            late_fee: Amount::ZERO,
            tip: Amount::ZERO,
            total: Amount::ZERO,
            adjusted_total: Amount::ZERO,
            paid_amount: Amount::ZERO,
            status: InvoiceStatus::Draft,
            due_date: req.due_date.or(Some(req.period.end)),
            paid_at: None,
            created_at: now,
            deleted_at: None,
            restored_at: None,
            restored_by: None,
            excluded_classes: Default::default(),
            payment_log: Vec::new(),
            activity_log: Vec::new(),
            delivery_log: Vec::new(),
            notes: req.notes,
            version: 0,
        };

        if req.select_lessons {
            if let Some(guardian_id) = invoice.guardian {
                let lessons = self
                    .select_for_invoice(&invoice, guardian_id)
                    .await?;
                self.populate_items(&mut invoice, &lessons, &guardian_doc)
                    .await?;
            }
        }
        totals::recompute(&mut invoice);
        invoice.push_activity(actor, "Invoice created", now);

        ctx.store.insert_invoice(&invoice).await?;
        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice.id,
            actor,
            AuditAction::Create,
            now,
        )
        .with_summary(format!("Invoice {} created", invoice.number));
        ctx.store.append_audit(&audit).await?;

        outbox.push(BillingEvent::InvoiceCreated { invoice: invoice.id });
        outbox.push(BillingEvent::StatsUpdated);
        outbox.drain_to(ctx.sink.as_ref());

        info!(invoice = %invoice.id, number = %invoice.number, "created");
        Ok(invoice)
    }

    async fn select_for_invoice(
        &self,
        invoice: &Invoice,
        guardian_id: GuardianId,
    ) -> Result<Vec<Class>> {
        let end = invoice.coverage.end_date().unwrap_or(invoice.period.end);
        let window = SelectionWindow::bounded(invoice.period.start, end);
        let mut options =
            SelectOptions::new(self.ctx.config.selector_max_items);
        options.cap_hours = invoice.coverage.max_hours();
        options.excluded = invoice.excluded_classes.clone();
        options.filters = invoice.coverage.filters.clone();
        selector::eligible_lessons(
            &self.ctx,
            guardian_id,
            &window,
            &options,
            Some(invoice.id),
        )
        .await
    }

    async fn populate_items(
        &self,
        invoice: &mut Invoice,
        lessons: &[Class],
        guardian: &Option<Guardian>,
    ) -> Result<()> {
        for class in lessons {
            let rate = selector::resolve_rate(
                &self.ctx,
                Some(&invoice.snapshot),
                guardian.as_ref(),
                &invoice.items,
            );
            let item =
                self.line_item_from_class(class, rate).await?;
            invoice.items.push(item);
        }
        Ok(())
    }

    async fn line_item_from_class(
        &self,
        class: &Class,
        rate: Amount,
    ) -> Result<LineItem> {
        let spec = NewItemSpec {
            class: Some(class.id),
            description: class.description.clone(),
            date: class.scheduled_date(),
            duration_mins: class.duration_mins,
            rate: Some(rate),
            student: class.student,
            teacher: class.teacher,
        };
        self.build_item_from_spec(&spec, rate, class).await
    }

    async fn build_item_from_spec(
        &self,
        spec: &NewItemSpec,
        rate: Amount,
        class: &Class,
    ) -> Result<LineItem> {
        use tutora_core::invoice::PersonSnapshot;
        let student_snapshot =
            match self.ctx.store.get_student(spec.student).await? {
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
        let teacher_snapshot =
            match self.ctx.store.get_teacher(spec.teacher).await? {
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
            student: spec.student,
            student_snapshot,
            teacher: spec.teacher,
            teacher_snapshot,
            description: spec.description.clone(),
            date: spec.date,
            duration_mins: spec.duration_mins,
            rate,
            amount: LineItem::compute_amount(rate, spec.duration_mins),
            attended: class.status
                == Some(tutora_core::class::ClassStatus::Attended),
            status: class.status,
            exclude_from_student_balance: false,
            exempt_from_guardian: false,
            exclude_from_teacher_payment: false,
        })
    }

    // --- Reads --- //

    /// Fetch by id-string or slug, enforcing role scoping.
    pub async fn fetch(
        &self,
        identifier: &str,
        role: Role,
    ) -> Result<Invoice> {
        let invoice = match identifier.parse::<InvoiceId>() {
            Ok(id) => self.ctx.store.get_invoice(id).await?,
            Err(_) =>
                self.ctx.store.get_invoice_by_slug(identifier).await?,
        }
        .ok_or(Error::not_found("invoice"))?;

        match role {
            Role::Admin => Ok(invoice),
            Role::Public => {
                if invoice.deleted_at.is_some() {
                    Err(Error::not_found("invoice"))
                } else {
                    Ok(invoice)
                }
            }
            Role::Guardian(id) => {
                if invoice.guardian == Some(id)
                    && invoice.deleted_at.is_none()
                {
                    Ok(invoice)
                } else {
                    Err(Error::Forbidden("not your invoice"))
                }
            }
            Role::Teacher(id) => {
                let on_items =
                    invoice.items.iter().any(|i| i.teacher == id);
                if (invoice.teacher == Some(id) || on_items)
                    && invoice.deleted_at.is_none()
                {
                    Ok(invoice)
                } else {
                    Err(Error::Forbidden("not your invoice"))
                }
            }
        }
    }

    pub async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>> {
        self.ctx.store.list_invoices(filter).await
    }

    pub async fn stats(&self) -> Result<StatsOverview> {
        crate::query::stats_overview(&self.ctx).await
    }

    pub async fn audits(&self, invoice: InvoiceId) -> Result<Vec<AuditEntry>> {
        self.ctx.store.audits_for_invoice(invoice).await
    }

    // --- Metadata --- //

    /// Field edits. Money-bearing fields are rejected on settled invoices.
    pub async fn update_metadata(
        &self,
        invoice_id: InvoiceId,
        req: UpdateInvoiceRequest,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;

        if invoice.is_settled()
            && (req.discount.is_some() || req.late_fee.is_some())
        {
            return Err(Error::validation(
                "discount and late fee cannot change on a settled invoice",
            ));
        }

        let mut audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::Update,
            now,
        );

        if let Some(name) = req.name {
            audit = audit
                .with_diff("name", FieldDiff::new(&invoice.name, &name));
            // An admin-assigned name that encodes a sequence advances the
            // counter so future auto-allocations cannot collide.
            if let Some(seq) = allocator::sequence_from_name(&name) {
                allocator::ensure_at_least(ctx, invoice.kind, seq).await?;
            }
            invoice.name = name;
            invoice.manual_name = true;
        }
        if let Some(notes) = req.notes {
            invoice.notes = Some(notes);
        }
        if let Some(due) = req.due_date {
            audit = audit
                .with_diff("due_date", FieldDiff::new(&invoice.due_date, &due));
            invoice.due_date = Some(due);
        }
        if let Some(discount) = req.discount {
            audit = audit.with_diff(
                "discount",
                FieldDiff::new(&invoice.discount, &discount),
            );
            invoice.discount = discount;
        }
        if let Some(late_fee) = req.late_fee {
            audit = audit.with_diff(
                "late_fee",
                FieldDiff::new(&invoice.late_fee, &late_fee),
            );
            invoice.late_fee = late_fee;
        }

        totals::recompute(&mut invoice);
        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
        Ok(invoice)
    }

    // --- Coverage and snapshot --- //

    /// Update coverage. If payments exist and no preview totals are
    /// supplied, automatic recalculation is skipped so a previously-settled
    /// invoice cannot silently inflate.
    pub async fn update_coverage(
        &self,
        invoice_id: InvoiceId,
        coverage: Coverage,
        preview: Option<PreviewTotals>,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;

        if invoice.status.is_terminal() {
            return Err(Error::validation(format!(
                "coverage cannot change in status {}",
                invoice.status
            )));
        }

        let coverage_before = invoice.coverage.clone();
        invoice.coverage = coverage;

        let has_payments = !invoice.payment_log.is_empty();
        match (has_payments, preview) {
            (true, None) => {
                // Keep the settled totals untouched.
            }
            (_, Some(preview)) => {
                invoice.subtotal = preview.subtotal;
                invoice.total = preview.total;
                invoice.adjusted_total = preview.total;
                invoice.paid_amount = invoice.paid_amount_derived();
            }
            (false, None) => {
                if !invoice.is_settled() {
                    if let Some(guardian_id) = invoice.guardian {
                        let guardian_doc =
                            ctx.store.get_guardian(guardian_id).await?;
                        let lessons = self
                            .select_for_invoice(&invoice, guardian_id)
                            .await?;
                        invoice.items.clear();
                        self.populate_items(
                            &mut invoice,
                            &lessons,
                            &guardian_doc,
                        )
                        .await?;
                    }
                }
                totals::recompute(&mut invoice);
            }
        }

        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::CoverageUpdate,
            now,
        )
        .with_diff(
            "coverage",
            FieldDiff::new(&coverage_before, &invoice.coverage),
        );
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
        Ok(invoice)
    }

    /// Apply admin-computed totals directly, without recalculation.
    pub async fn apply_snapshot_totals(
        &self,
        invoice_id: InvoiceId,
        preview: PreviewTotals,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let mut invoice = self.load(invoice_id).await?;
        let before = invoice.total;
        invoice.subtotal = preview.subtotal;
        invoice.total = preview.total;
        invoice.adjusted_total = preview.total;
        invoice.paid_amount = invoice.paid_amount_derived();
        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::SnapshotUpdate,
            ctx.now(),
        )
        .with_diff("total", FieldDiff::new(&before, &invoice.total));
        ctx.store.append_audit(&audit).await?;
        Ok(invoice)
    }

    // --- Items --- //

    /// Apply item operations. With `dry_run` the mutated invoice is
    /// returned without persisting (the preview endpoint).
    pub async fn edit_items(
        &self,
        invoice_id: InvoiceId,
        ops: Vec<ItemOp>,
        command: InvoiceCommand,
        actor: Option<ActorId>,
        dry_run: bool,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;
        lifecycle::ensure_items_mutable(&invoice, &command)?;

        let items_before = invoice.items.clone();

        for op in ops {
            match op {
                ItemOp::Add(spec) => {
                    self.add_item(&mut invoice, spec, &command, dry_run)
                        .await?;
                }
                ItemOp::Update { class, patch } => {
                    let Some(idx) = invoice.item_index_for_class(class)
                    else {
                        return Err(Error::validation(format!(
                            "class {class} is not on this invoice"
                        )));
                    };
                    let item = &mut invoice.items[idx];
                    if let Some(mins) = patch.duration_mins {
                        item.duration_mins = mins;
                        item.amount =
                            LineItem::compute_amount(item.rate, mins);
                    }
                    if let Some(attended) = patch.attended {
                        item.attended = attended;
                    }
                    if let Some(description) = patch.description {
                        item.description = description;
                    }
                    if let Some(v) = patch.exempt_from_guardian {
                        item.exempt_from_guardian = v;
                    }
                    if let Some(v) = patch.exclude_from_teacher_payment {
                        item.exclude_from_teacher_payment = v;
                    }
                }
                ItemOp::Remove { class } => {
                    let Some(idx) = invoice.item_index_for_class(class)
                    else {
                        return Err(Error::validation(format!(
                            "class {class} is not on this invoice"
                        )));
                    };
                    invoice.items.remove(idx);
                    invoice.excluded_classes.insert(class);
                }
            }
        }

        totals::recompute(&mut invoice);
        if dry_run {
            return Ok(invoice);
        }

        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::ItemUpdate,
            now,
        )
        .with_diff(
            "items",
            FieldDiff::new(&items_before, &invoice.items),
        );
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
        Ok(invoice)
    }

    async fn add_item(
        &self,
        invoice: &mut Invoice,
        spec: NewItemSpec,
        command: &InvoiceCommand,
        dry_run: bool,
    ) -> Result<()> {
        let ctx = &self.ctx;

        // One lesson, one invoice.
        if let Some(class_id) = spec.class {
            let conflicting = ctx
                .store
                .invoices_containing_class(class_id)
                .await?
                .into_iter()
                .find(|i| i.id != invoice.id && i.active());
            if let Some(mut conflicting) = conflicting {
                if !command.transfer_on_duplicate {
                    return Err(Error::LessonAlreadyInvoiced {
                        invoice_id: conflicting.id,
                        invoice_number: conflicting.number,
                    });
                }
                if conflicting.is_settled() {
                    return Err(Error::validation(format!(
                        "lesson {class_id} is on settled invoice {}",
                        conflicting.number
                    )));
                }
                if !dry_run {
                    if let Some(idx) =
                        conflicting.item_index_for_class(class_id)
                    {
                        conflicting.items.remove(idx);
                        totals::recompute(&mut conflicting);
                        ctx.store.update_invoice(&mut conflicting).await?;
                    }
                }
            }
        }

        let guardian_doc = match invoice.guardian {
            Some(id) => ctx.store.get_guardian(id).await?,
            None => None,
        };
        let rate = spec.rate.unwrap_or_else(|| {
            selector::resolve_rate(
                ctx,
                Some(&invoice.snapshot),
                guardian_doc.as_ref(),
                &invoice.items,
            )
        });

        let item = match spec.class {
            Some(class_id) => {
                match ctx.store.get_class(class_id).await? {
                    Some(class) =>
                        self.build_item_from_spec(&spec, rate, &class).await?,
                    None => self.detached_item(&spec, rate).await?,
                }
            }
            None => self.detached_item(&spec, rate).await?,
        };
        invoice.excluded_classes.remove(&item.class);
        invoice.items.push(item);
        Ok(())
    }

    /// An item with no backing class document (ad-hoc fees, adjustments).
    async fn detached_item(
        &self,
        spec: &NewItemSpec,
        rate: Amount,
    ) -> Result<LineItem> {
        use tutora_core::invoice::PersonSnapshot;
        let student_snapshot =
            match self.ctx.store.get_student(spec.student).await? {
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
        let teacher_snapshot =
            match self.ctx.store.get_teacher(spec.teacher).await? {
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
            class: spec.class.unwrap_or(ClassId::from_array([0; 16])),
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

    // --- Money movement --- //

    pub async fn apply_payment(
        &self,
        invoice_id: InvoiceId,
        req: PaymentRequest,
        actor: Option<ActorId>,
    ) -> Result<PaymentOutcome> {
        apply::apply(&self.ctx, invoice_id, req, actor).await
    }

    pub async fn record_refund(
        &self,
        invoice_id: InvoiceId,
        req: RefundRequest,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        refund::record_refund(&self.ctx, invoice_id, req, actor).await
    }

    pub async fn apply_adjustment(
        &self,
        invoice_id: InvoiceId,
        payload: AdjustmentPayload,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        refund::apply_post_payment_adjustment(
            &self.ctx, invoice_id, payload, actor,
        )
        .await
    }

    /// Revert all payments, restoring the pre-payment ledgers. The removed
    /// log is preserved in the audit record, and applied payment records
    /// release their idempotency keys so the same payment data can be
    /// re-applied.
    #[instrument(skip_all, name = "(mark-unpaid)", fields(invoice = %invoice_id))]
    pub async fn mark_unpaid(
        &self,
        invoice_id: InvoiceId,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;

        if invoice.payment_log.is_empty() {
            return Err(Error::NoPayments);
        }

        let target =
            lifecycle::revert_target(&invoice, now.date_utc());
        let new_status = lifecycle::check_transition(
            invoice.status,
            Transition::RevertPayments { target },
        )?;

        // Reverse the guardian hour credit for the covered span.
        let covered = totals::paid_coverage_hours(&invoice);
        let credited = if invoice.items.is_empty() {
            totals::net_paid_hours(&invoice)
        } else {
            totals::eligible_increment(&invoice, Hours::ZERO, covered)
        };
        if let Some(guardian_id) = invoice.guardian {
            if let Some(mut guardian) =
                ctx.store.get_guardian(guardian_id).await?
            {
                guardian.debit_hours(credited);
                ctx.store.update_guardian(&guardian).await?;
            }
        }

        // Reverse tip distributions from the teacher ledgers.
        use chrono::Datelike;
        for entry in &invoice.payment_log {
            if let PaymentLogDetail::TipDistribution { teacher } =
                entry.detail
            {
                if let Some(mut doc) =
                    ctx.store.get_teacher(teacher).await?
                {
                    let date = entry.processed_at.date_utc();
                    let month =
                        doc.month_entry(date.year(), date.month());
                    month.earnings =
                        month.earnings.saturating_sub(entry.amount);
                    ctx.store.update_teacher(&doc).await?;
                }
            }
        }

        let removed_log = std::mem::take(&mut invoice.payment_log);
        let status_before = invoice.status;
        invoice.tip = Amount::ZERO;
        if invoice.coverage.max_hours().is_some() {
            invoice.coverage.set_max_hours(Hours::ZERO);
        }
        totals::recompute(&mut invoice);
        invoice.status = new_status;
        invoice.paid_at = None;
        invoice.updated_by = actor;
        invoice.push_activity(actor, "All payments reverted", now);
        ctx.store.update_invoice(&mut invoice).await?;

        // Clear paid flags.
        for item in &invoice.items {
            if let Some(mut class) =
                ctx.store.get_class(item.class).await?
            {
                if class.paid_by_guardian {
                    class.paid_by_guardian = false;
                    ctx.store.update_class(&class).await?;
                }
            }
        }

        // Release idempotency keys held by applied records.
        for mut record in
            ctx.store.payments_for_invoice(invoice_id).await?
        {
            if record.state == PaymentState::Applied {
                record.state = PaymentState::Failed;
                ctx.store.update_payment(&record).await?;
            }
        }

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::PaymentsReverted,
            now,
        )
        .with_diff("status", FieldDiff::new(&status_before, &invoice.status))
        .with_metadata(
            serde_json::to_value(&removed_log)
                .unwrap_or(serde_json::Value::Null),
        )
        .with_summary("All payments reverted");
        ctx.store.append_audit(&audit).await?;

        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
        ctx.sink.post(BillingEvent::StatsUpdated);
        Ok(invoice)
    }

    /// Reverse a specific audit entry. Supported for item updates only.
    pub async fn rollback(
        &self,
        audit_id: AuditId,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let entry = ctx
            .store
            .get_audit(audit_id)
            .await?
            .ok_or(Error::not_found("audit entry"))?;
        if entry.action != AuditAction::ItemUpdate {
            return Err(Error::validation(format!(
                "rollback is only supported for item updates, not {}",
                entry.action
            )));
        }
        let diff = entry
            .diff
            .get("items")
            .ok_or_else(|| {
                Error::validation("audit entry carries no item diff")
            })?;
        let items: Vec<LineItem> =
            serde_json::from_value(diff.before.clone()).map_err(|e| {
                Error::validation(format!("item diff unreadable: {e}"))
            })?;

        let mut invoice = self.load(entry.invoice).await?;
        let items_before = invoice.items.clone();
        invoice.items = items;
        totals::recompute(&mut invoice);
        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice.id,
            actor,
            AuditAction::Rollback,
            ctx.now(),
        )
        .with_diff("items", FieldDiff::new(&items_before, &invoice.items))
        .with_summary(format!("Rolled back audit entry {audit_id}"));
        ctx.store.append_audit(&audit).await?;
        Ok(invoice)
    }

    // --- Delivery --- //

    /// Queue a delivery attempt, advancing draft/pending to sent.
    pub async fn send(
        &self,
        invoice_id: InvoiceId,
        channel: DeliveryChannel,
        template: &str,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;

        if matches!(
            invoice.status,
            InvoiceStatus::Draft | InvoiceStatus::Pending
        ) {
            invoice.status = lifecycle::check_transition(
                invoice.status,
                Transition::MarkSent,
            )?;
        }

        let attempt = invoice.next_delivery_attempt(channel);
        let mut hasher = std::hash::DefaultHasher::new();
        (template, &invoice.number, attempt).hash(&mut hasher);
        invoice.record_delivery(DeliveryAttempt {
            channel,
            status: DeliveryStatus::Queued,
            template: template.to_owned(),
            attempt,
            message_hash: Some(format!("{:016x}", hasher.finish())),
            at: now,
        });
        invoice.push_activity(
            actor,
            format!("Queued {channel} delivery (attempt {attempt})"),
            now,
        );
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::Send,
            now,
        )
        .with_summary(format!("Delivery queued on {channel}"));
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
        Ok(invoice)
    }

    /// Toggle the latest queued delivery on `channel`: a queued attempt is
    /// withdrawn, otherwise a new one is queued.
    pub async fn toggle_send(
        &self,
        invoice_id: InvoiceId,
        channel: DeliveryChannel,
        template: &str,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let mut invoice = self.load(invoice_id).await?;
        let last_queued = invoice
            .delivery_log
            .iter_mut()
            .rev()
            .find(|d| d.channel == channel);
        match last_queued {
            Some(attempt) if attempt.status == DeliveryStatus::Queued => {
                attempt.status = DeliveryStatus::Failed;
                invoice.push_activity(
                    actor,
                    format!("Withdrew queued {channel} delivery"),
                    self.ctx.now(),
                );
                self.ctx.store.update_invoice(&mut invoice).await?;
                Ok(invoice)
            }
            _ => self.send(invoice_id, channel, template, actor).await,
        }
    }

    // --- Lifecycle operations --- //

    pub async fn cancel(
        &self,
        invoice_id: InvoiceId,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;
        let before = invoice.status;
        invoice.status =
            lifecycle::check_transition(invoice.status, Transition::Cancel)?;
        invoice.updated_by = actor;
        invoice.push_activity(actor, "Invoice cancelled", now);
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::Cancel,
            now,
        )
        .with_diff("status", FieldDiff::new(&before, &invoice.status));
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceUpdated { invoice: invoice_id });
        ctx.sink.post(BillingEvent::StatsUpdated);
        Ok(invoice)
    }

    pub async fn soft_delete(
        &self,
        invoice_id: InvoiceId,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;
        if invoice.deleted_at.is_some() {
            return Ok(invoice);
        }
        invoice.deleted_at = Some(now);
        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::SoftDelete,
            now,
        );
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceDeleted { invoice: invoice_id });
        Ok(invoice)
    }

    /// Restore a soft-deleted invoice; the pre-delete status was retained.
    pub async fn restore(
        &self,
        invoice_id: InvoiceId,
        actor: Option<ActorId>,
    ) -> Result<Invoice> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let mut invoice = self.load(invoice_id).await?;
        if invoice.deleted_at.is_none() {
            return Err(Error::validation("invoice is not deleted"));
        }
        invoice.deleted_at = None;
        invoice.restored_at = Some(now);
        invoice.restored_by = actor;
        invoice.updated_by = actor;
        ctx.store.update_invoice(&mut invoice).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::Restore,
            now,
        );
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoiceRestored { invoice: invoice_id });
        Ok(invoice)
    }

    /// Permanent deletion is allowed only on already soft-deleted invoices.
    pub async fn permanent_delete(
        &self,
        invoice_id: InvoiceId,
        actor: Option<ActorId>,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let invoice = self.load(invoice_id).await?;
        if invoice.deleted_at.is_none() {
            return Err(Error::validation(
                "only soft-deleted invoices can be permanently deleted",
            ));
        }
        ctx.store.delete_invoice(invoice_id).await?;

        let audit = AuditEntry::new(
            ctx.ids.audit_id(),
            invoice_id,
            actor,
            AuditAction::PermanentDelete,
            ctx.now(),
        )
        .with_summary(format!(
            "Invoice {} permanently deleted",
            invoice.number
        ));
        ctx.store.append_audit(&audit).await?;
        ctx.sink.post(BillingEvent::InvoicePermanentlyDeleted {
            invoice: invoice_id,
        });
        Ok(())
    }

    /// Sweep unpaid invoices past their due date into `overdue`.
    pub async fn overdue_tick(&self, today: NaiveDate) -> Result<usize> {
        let ctx = &self.ctx;
        let filter = InvoiceFilter {
            status: Some(crate::query::StatusFilter::Unpaid),
            ..Default::default()
        };
        let invoices = ctx.store.list_invoices(&filter).await?;
        let mut flipped = 0;
        for mut invoice in invoices {
            let due_passed =
                invoice.due_date.is_some_and(|due| due < today);
            if !due_passed {
                continue;
            }
            let Ok(next) = lifecycle::check_transition(
                invoice.status,
                Transition::OverdueTick,
            ) else {
                continue;
            };
            let before = invoice.status;
            invoice.status = next;
            ctx.store.update_invoice(&mut invoice).await?;
            let audit = AuditEntry::new(
                ctx.ids.audit_id(),
                invoice.id,
                None,
                AuditAction::StatusChange,
                ctx.now(),
            )
            .with_diff("status", FieldDiff::new(&before, &invoice.status));
            ctx.store.append_audit(&audit).await?;
            flipped += 1;
        }
        Ok(flipped)
    }

    // --- Class events --- //

    pub async fn on_class_event(
        &self,
        class: &Class,
        event: ClassEvent,
    ) -> Result<()> {
        dispatcher::on_class_event(&self.ctx, class, event).await
    }

    // --- Export --- //

    /// Build the renderer-ready export snapshot, including the guardian's
    /// previous invoice summary when one exists.
    pub async fn export(
        &self,
        invoice_id: InvoiceId,
        currency: &CurrencyFormat,
    ) -> Result<ExportSnapshot> {
        let ctx = &self.ctx;
        let invoice = self.load(invoice_id).await?;

        let previous = match invoice.guardian {
            Some(guardian_id) => {
                let filter = InvoiceFilter {
                    guardian: Some(guardian_id),
                    ..Default::default()
                };
                ctx.store
                    .list_invoices(&filter)
                    .await?
                    .into_iter()
                    .filter(|i| {
                        i.id != invoice.id
                            && i.created_at < invoice.created_at
                    })
                    .max_by_key(|i| i.created_at)
            }
            None => None,
        };

        crate::export::build_export_snapshot(
            ctx,
            &invoice,
            currency,
            previous.as_ref(),
        )
        .await
    }

    // --- Admin --- //

    /// Re-derive identifiers for unpaid, auto-named invoices from fresh
    /// sequences, in creation order.
    pub async fn resequence_unpaid(
        &self,
        actor: Option<ActorId>,
        dry_run: bool,
    ) -> Result<usize> {
        let ctx = &self.ctx;
        let filter = InvoiceFilter {
            status: Some(crate::query::StatusFilter::Unpaid),
            ..Default::default()
        };
        let mut invoices = ctx.store.list_invoices(&filter).await?;
        invoices.sort_by_key(|i| i.created_at);

        let mut changed = 0;
        for mut invoice in invoices {
            if invoice.manual_name {
                continue;
            }
            changed += 1;
            if dry_run {
                continue;
            }
            let sequence =
                allocator::allocate_next(ctx, invoice.kind).await?;
            let identifiers = allocator::build_identifiers(
                ctx,
                sequence,
                Some((invoice.period.year, invoice.period.month)),
            );
            let before = invoice.number.clone();
            invoice.sequence = identifiers.sequence;
            invoice.number = identifiers.number;
            invoice.name = identifiers.name;
            invoice.slug = identifiers.slug;
            invoice.updated_by = actor;
            ctx.store.update_invoice(&mut invoice).await?;

            let audit = AuditEntry::new(
                ctx.ids.audit_id(),
                invoice.id,
                actor,
                AuditAction::Resequence,
                ctx.now(),
            )
            .with_diff(
                "number",
                FieldDiff::new(&before, &invoice.number),
            );
            ctx.store.append_audit(&audit).await?;
        }
        Ok(changed)
    }

    /// Resync `paid_by_guardian` flags on settled invoices from the current
    /// paid coverage.
    pub async fn rebuild_paid_flags(
        &self,
        options: &RebuildFlagsOptions,
    ) -> Result<usize> {
        let ctx = &self.ctx;
        let invoices = match options.invoice {
            Some(id) => vec![self.load(id).await?],
            None => ctx.store.list_invoices(&InvoiceFilter::default()).await?,
        };
        let cutoff = options.since_days.map(|days| {
            ctx.now().date_utc() - chrono::Duration::days(days)
        });
        let limit = options.limit.unwrap_or(usize::MAX);

        let mut touched = 0;
        for invoice in invoices.iter().filter(|i| i.is_settled()) {
            if let Some(cutoff) = cutoff {
                if invoice.created_at.date_utc() < cutoff {
                    continue;
                }
            }
            if touched >= limit {
                break;
            }
            touched += 1;
            if !options.dry_run {
                refund::resync_paid_flags(ctx, invoice).await?;
            }
        }
        Ok(touched)
    }

    // --- Internals --- //

    async fn load(&self, invoice_id: InvoiceId) -> Result<Invoice> {
        self.ctx
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or(Error::not_found("invoice"))
    }
}

/// Create a generated (auto) invoice in `pending`, populated from
/// pre-selected lessons. Used by the zero-hour generator.
pub async fn create_generated_invoice(
    ctx: &BillingContext,
    guardian_id: GuardianId,
    kind: InvoiceKind,
    period: BillingPeriod,
    lessons: &[Class],
) -> Result<Invoice> {
    let manager = BillingManager::new(ctx.clone());
    let req = CreateInvoiceRequest {
        kind,
        guardian: Some(guardian_id),
        teacher: None,
        period,
        due_date: Some(period.end),
        coverage: None,
        select_lessons: false,
        notes: None,
    };
    let mut invoice = manager.create_invoice(req, None).await?;

    let guardian_doc = ctx.store.get_guardian(guardian_id).await?;
    manager
        .populate_items(&mut invoice, lessons, &guardian_doc)
        .await?;
    totals::recompute(&mut invoice);
    invoice.status = InvoiceStatus::Pending;
    ctx.store.update_invoice(&mut invoice).await?;
    Ok(invoice)
}
