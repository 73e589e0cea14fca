//! Invoice list filters, sort orders, and dashboard aggregates.
//!
//! The filter and sort logic is store-independent: implementations of
//! [`BillingStore::list_invoices`] scan their collection with
//! [`InvoiceFilter::matches`] and then call [`sort_and_page`].
//!
//! [`BillingStore::list_invoices`]: crate::traits::BillingStore::list_invoices

use chrono::NaiveDate;
use tutora_core::{
    Result,
    amount::Amount,
    ids::{GuardianId, TeacherId},
    invoice::{Invoice, InvoiceKind, InvoiceStatus},
    time::TimestampMs,
};

use crate::context::BillingContext;

/// Status filtering: a literal status, or one of the paid/unpaid families.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusFilter {
    Literal(InvoiceStatus),
    Paid,
    Unpaid,
}

impl StatusFilter {
    fn matches(&self, status: InvoiceStatus) -> bool {
        match self {
            Self::Literal(s) => *s == status,
            Self::Paid => status == InvoiceStatus::Paid,
            Self::Unpaid => status.is_unpaid_family(),
        }
    }
}

/// List query parameters.
#[derive(Clone, Debug, Default)]
pub struct InvoiceFilter {
    pub status: Option<StatusFilter>,
    pub kind: Option<InvoiceKind>,
    pub guardian: Option<GuardianId>,
    pub teacher: Option<TeacherId>,
    /// Case-insensitive substring over number, name, and slug.
    pub search: Option<String>,
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
    /// Soft-deleted invoices are hidden unless requested.
    pub include_deleted: bool,
    /// Unpaid-first, then effective-sort-date descending.
    pub smart_sort: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl InvoiceFilter {
    pub fn matches(&self, invoice: &Invoice) -> bool {
        if !self.include_deleted && invoice.deleted_at.is_some() {
            return false;
        }
        if let Some(status) = &self.status {
            if !status.matches(invoice.status) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if invoice.kind != kind {
                return false;
            }
        }
        if let Some(guardian) = self.guardian {
            if invoice.guardian != Some(guardian) {
                return false;
            }
        }
        if let Some(teacher) = self.teacher {
            let on_items =
                invoice.items.iter().any(|i| i.teacher == teacher);
            if invoice.teacher != Some(teacher) && !on_items {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = invoice.number.to_lowercase().contains(&needle)
                || invoice.name.to_lowercase().contains(&needle)
                || invoice.slug.to_lowercase().contains(&needle);
            if !hit {
                return false;
            }
        }
        let created = invoice.created_at.date_utc();
        if let Some(from) = self.created_from {
            if created < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if created > to {
                return false;
            }
        }
        true
    }
}

/// The date a smart-sorted list orders by: paid date for settled invoices,
/// else due date, else creation date.
fn effective_sort_date(invoice: &Invoice) -> TimestampMs {
    if let Some(paid_at) = invoice.paid_at {
        return paid_at;
    }
    if let Some(due) = invoice.due_date {
        if let Some(dt) = due.and_hms_opt(0, 0, 0) {
            if let Ok(ts) =
                TimestampMs::try_from_i64(dt.and_utc().timestamp_millis())
            {
                return ts;
            }
        }
    }
    invoice.created_at
}

/// Sort per the filter's semantics and apply offset/limit.
///
/// Defaults: an unpaid filter sorts by due date ascending, a paid filter by
/// paid date descending, anything else by creation date descending.
pub fn sort_and_page(invoices: &mut Vec<Invoice>, filter: &InvoiceFilter) {
    if filter.smart_sort {
        invoices.sort_by(|a, b| {
            let a_unpaid = a.status.is_unpaid_family();
            let b_unpaid = b.status.is_unpaid_family();
            b_unpaid
                .cmp(&a_unpaid)
                .then(effective_sort_date(b).cmp(&effective_sort_date(a)))
        });
    } else {
        match filter.status {
            Some(StatusFilter::Unpaid) => invoices.sort_by(|a, b| {
                a.due_date
                    .cmp(&b.due_date)
                    .then(a.created_at.cmp(&b.created_at))
            }),
            Some(StatusFilter::Paid) => invoices.sort_by(|a, b| {
                b.paid_at
                    .cmp(&a.paid_at)
                    .then(b.created_at.cmp(&a.created_at))
            }),
            _ => invoices
                .sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }
    }

    if filter.offset > 0 {
        let offset = filter.offset.min(invoices.len());
        invoices.drain(..offset);
    }
    if let Some(limit) = filter.limit {
        invoices.truncate(limit);
    }
}

/// Dashboard aggregates over the live (non-deleted) invoices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsOverview {
    pub total: usize,
    pub draft: usize,
    pub pending: usize,
    pub sent: usize,
    pub overdue: usize,
    pub partially_paid: usize,
    pub paid: usize,
    pub refunded: usize,
    pub cancelled: usize,
    pub billed_amount: Amount,
    pub collected_amount: Amount,
    pub outstanding_amount: Amount,
}

pub async fn stats_overview(ctx: &BillingContext) -> Result<StatsOverview> {
    let filter = InvoiceFilter::default();
    let invoices = ctx.store.list_invoices(&filter).await?;

    let mut stats = StatsOverview::default();
    for invoice in &invoices {
        stats.total += 1;
        match invoice.status {
            InvoiceStatus::Draft => stats.draft += 1,
            InvoiceStatus::Pending => stats.pending += 1,
            InvoiceStatus::Sent => stats.sent += 1,
            InvoiceStatus::Overdue => stats.overdue += 1,
            InvoiceStatus::PartiallyPaid => stats.partially_paid += 1,
            InvoiceStatus::Paid => stats.paid += 1,
            InvoiceStatus::Refunded => stats.refunded += 1,
            InvoiceStatus::Cancelled => stats.cancelled += 1,
        }
        if invoice.status != InvoiceStatus::Cancelled {
            stats.billed_amount = stats.billed_amount + invoice.total;
            stats.collected_amount =
                stats.collected_amount + invoice.paid_amount_derived();
            stats.outstanding_amount =
                stats.outstanding_amount + invoice.remaining_balance();
        }
    }
    Ok(stats)
}
