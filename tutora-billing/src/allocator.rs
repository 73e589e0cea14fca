//! Invoice identifier allocation.
//!
//! Sequences are allocated by the store's atomic counter, one counter per
//! [`InvoiceKind`], so concurrent creations always observe strictly
//! increasing values. Formatting is centralised here: the canonical number
//! is a zero-padded derivative of the sequence, the display name is
//! human-facing, and the slug is URL-safe with a random suffix (collision is
//! extremely improbable given the monotonic number, but the suffix is kept
//! anyway).

use tutora_core::{Result, invoice::InvoiceKind};

use crate::context::BillingContext;

/// The identifiers derived from one allocated sequence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvoiceIdentifiers {
    pub sequence: u64,
    pub number: String,
    pub name: String,
    pub slug: String,
}

/// Allocate the next sequence for `kind`. Serialized by the store.
pub async fn allocate_next(
    ctx: &BillingContext,
    kind: InvoiceKind,
) -> Result<u64> {
    ctx.store.next_sequence(kind).await
}

/// Advance the counter so future allocations start above `floor`.
pub async fn ensure_at_least(
    ctx: &BillingContext,
    kind: InvoiceKind,
    floor: u64,
) -> Result<()> {
    ctx.store.ensure_sequence_at_least(kind, floor).await
}

/// Derive number, display name, and slug from an allocated sequence.
/// `month` is `(year, month)` when the invoice bills a calendar month.
pub fn build_identifiers(
    ctx: &BillingContext,
    sequence: u64,
    month: Option<(i32, u32)>,
) -> InvoiceIdentifiers {
    let width = ctx.config.invoice_number_width;
    let number = format!("INV-{sequence:0width$}");
    let name = match month.and_then(|(y, m)| month_label(y, m)) {
        Some(label) => format!("Invoice #{sequence} ({label})"),
        None => format!("Invoice #{sequence}"),
    };
    let slug =
        format!("{}-{}", number.to_lowercase(), ctx.ids.slug_suffix());
    InvoiceIdentifiers { sequence, number, name, slug }
}

fn month_label(year: i32, month: u32) -> Option<String> {
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| d.format("%B %Y").to_string())
}

/// Extract a sequence from an admin-set invoice name, so the counter can be
/// advanced past it and future auto-allocations do not collide. Uses the
/// last run of digits in the name body: "Invoice #57 (May 2025)" yields 57,
/// not 2025, because digit runs inside a trailing parenthesised label are
/// ignored.
pub fn sequence_from_name(name: &str) -> Option<u64> {
    // Strip one trailing "(...)" label if present.
    let trimmed = name.trim_end();
    let body = match (trimmed.rfind('('), trimmed.ends_with(')')) {
        (Some(open), true) => trimmed[..open].trim_end(),
        _ => trimmed,
    };

    let mut best: Option<u64> = None;
    let mut current = String::new();
    for c in body.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            best = current.parse().ok().or(best);
            current.clear();
        }
    }
    if !current.is_empty() {
        best = current.parse().ok().or(best);
    }
    best
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tutora_core::time::TimestampMs;

    use super::*;
    use crate::{
        context::{BillingConfig, BillingContext, FixedClock},
        outbox::NullSink,
        store::memory::MemoryStore,
    };

    fn ctx() -> BillingContext {
        BillingContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock::at(TimestampMs::try_from_i64(0).unwrap())),
            Arc::new(NullSink),
            BillingConfig::default(),
        )
    }

    #[test]
    fn number_is_zero_padded() {
        let ctx = ctx();
        let ids = build_identifiers(&ctx, 42, Some((2025, 1)));
        assert_eq!(ids.number, "INV-000042");
        assert_eq!(ids.name, "Invoice #42 (January 2025)");
        assert!(ids.slug.starts_with("inv-000042-"));
        assert_eq!(ids.slug.len(), "inv-000042-".len() + 12);
    }

    #[test]
    fn sequence_from_name_parses_admin_names() {
        assert_eq!(sequence_from_name("Invoice #57"), Some(57));
        assert_eq!(sequence_from_name("INV-000103"), Some(103));
        assert_eq!(sequence_from_name("Invoice #57 (May 2025)"), Some(57));
        assert_eq!(sequence_from_name("no digits"), None);
    }

    #[tokio::test]
    async fn sequences_strictly_increase() {
        let ctx = ctx();
        let a = allocate_next(&ctx, InvoiceKind::GuardianInvoice)
            .await
            .unwrap();
        let b = allocate_next(&ctx, InvoiceKind::GuardianInvoice)
            .await
            .unwrap();
        assert!(b > a);

        ensure_at_least(&ctx, InvoiceKind::GuardianInvoice, 500)
            .await
            .unwrap();
        let c = allocate_next(&ctx, InvoiceKind::GuardianInvoice)
            .await
            .unwrap();
        assert!(c > 500);

        // Kinds are independent.
        let t = allocate_next(&ctx, InvoiceKind::TeacherPayment)
            .await
            .unwrap();
        assert_eq!(t, 1);
    }
}
