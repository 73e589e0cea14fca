//! Shared total and coverage recomputation.
//!
//! Everything here is pure math over the aggregate. The invariants:
//!
//! - `subtotal` = the sum of item amounts over non-exempt items
//! - `total` = subtotal + transfer fee (unless waived) + late fee + tip
//!   - discount (+ tax, modelled but zero)
//! - `paid_amount` = the derived sum over the payment log
//! - coverage = net paid hours, capped by the scheduled item hours

use rust_decimal::Decimal;
use tutora_core::{
    amount::Amount,
    hours::Hours,
    ids::ClassId,
    invoice::{Invoice, LineItem},
    period::BillingPeriod,
};

/// Recompute the derived monetary fields in place.
pub fn recompute(invoice: &mut Invoice) {
    let subtotal: Amount = invoice
        .items
        .iter()
        .filter(|i| i.billable())
        .map(|i| i.amount)
        .sum();
    let subtotal = subtotal.round2();

    invoice.snapshot.transfer_fee.waived_by_coverage =
        invoice.coverage.waive_transfer_fee;
    let fee = invoice.snapshot.transfer_fee.amount_for(subtotal);
    invoice.snapshot.transfer_fee.amount = fee;

    let gross = subtotal + fee + invoice.late_fee + invoice.tip + invoice.tax;
    let total = gross.saturating_sub(invoice.discount).round2();

    invoice.subtotal = subtotal;
    invoice.total = total;
    invoice.adjusted_total = total;
    invoice.paid_amount = invoice.paid_amount_derived();
}

/// Net hours unlocked by payments: positive payment hours minus refunded
/// hours, never negative.
pub fn net_paid_hours(invoice: &Invoice) -> Hours {
    invoice
        .positive_payment_hours()
        .saturating_sub(invoice.refunded_hours())
}

/// The hours of scheduled lessons the invoice's payments have unlocked,
/// capped by the scheduled item hours.
pub fn paid_coverage_hours(invoice: &Invoice) -> Hours {
    net_paid_hours(invoice).min(invoice.total_item_hours())
}

/// Items in chronological order (by lesson date, then insertion order).
pub fn chronological_items(invoice: &Invoice) -> Vec<&LineItem> {
    let mut items: Vec<(usize, &LineItem)> =
        invoice.items.iter().enumerate().collect();
    items.sort_by_key(|(idx, item)| (item.date, *idx));
    items.into_iter().map(|(_, item)| item).collect()
}

/// The classes whose full duration falls within `covered` hours, walking
/// items chronologically.
pub fn covered_class_ids(invoice: &Invoice, covered: Hours) -> Vec<ClassId> {
    let mut out = Vec::new();
    let mut cumulative = Hours::ZERO;
    for item in chronological_items(invoice) {
        let after = cumulative + item.hours();
        if after.exceeds(covered) {
            break;
        }
        cumulative = after;
        out.push(item.class);
    }
    out
}

/// The portion of the coverage increment `(from, to]` that maps onto
/// non-exempt items, walking items chronologically. This is the quantity
/// credited to the guardian's hour balance on payment.
pub fn eligible_increment(invoice: &Invoice, from: Hours, to: Hours) -> Hours {
    let mut credited = Hours::ZERO;
    let mut cumulative = Hours::ZERO;
    for item in chronological_items(invoice) {
        let start = cumulative;
        let end = cumulative + item.hours();
        cumulative = end;

        if end <= from {
            continue;
        }
        if start >= to {
            break;
        }
        if !item.billable() {
            continue;
        }
        let overlap_start = start.as_decimal().max(from.as_decimal());
        let overlap_end = end.as_decimal().min(to.as_decimal());
        let overlap = (overlap_end - overlap_start).max(Decimal::ZERO);
        if let Ok(h) = Hours::try_from_decimal(overlap) {
            credited = credited + h;
        }
    }
    credited
}

/// Per-student share of item hours on the invoice; used to allocate refund
/// debits proportionally.
pub fn student_hour_shares(
    invoice: &Invoice,
) -> Vec<(tutora_core::ids::StudentId, Hours)> {
    let mut shares: Vec<(tutora_core::ids::StudentId, Hours)> = Vec::new();
    for item in &invoice.items {
        if item.exclude_from_student_balance {
            continue;
        }
        match shares.iter_mut().find(|(s, _)| *s == item.student) {
            Some((_, hours)) => *hours = *hours + item.hours(),
            None => shares.push((item.student, item.hours())),
        }
    }
    shares
}

/// Widen the billing-period bounds so every item's lesson date is inside.
pub fn expand_period_to_items(invoice: &mut Invoice) {
    let dates: Vec<_> = invoice.items.iter().map(|i| i.date).collect();
    let (Some(min), Some(max)) =
        (dates.iter().min().copied(), dates.iter().max().copied())
    else {
        return;
    };
    if min < invoice.period.start || max > invoice.period.end {
        invoice.period = BillingPeriod::from_bounds(
            invoice.period.start.min(min),
            invoice.period.end.max(max),
        );
    }
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;
    use tutora_core::{
        ids::StudentId,
        invoice::InvoiceKind,
        test_utils::fixtures,
    };

    use super::*;

    fn invoice_with_items(n: u64) -> Invoice {
        let mut invoice = fixtures::invoice(InvoiceKind::GuardianInvoice);
        for i in 1..=n {
            let mut item = fixtures::line_item(ClassId::from_u64(i));
            item.date = fixtures::date(2025, 1, i as u32);
            invoice.items.push(item);
        }
        invoice
    }

    #[test]
    fn recompute_totals_with_fee_and_discount() {
        let mut invoice = invoice_with_items(2);
        invoice.snapshot.transfer_fee = fixtures::transfer_fee_fixed(dec!(2));
        invoice.discount = Amount::from_major(5);
        recompute(&mut invoice);

        assert_eq!(invoice.subtotal, Amount::from_major(20));
        assert_eq!(
            invoice.snapshot.transfer_fee.amount,
            Amount::from_major(2)
        );
        assert_eq!(invoice.total, Amount::from_major(17));
        assert_eq!(invoice.adjusted_total, invoice.total);
    }

    #[test]
    fn waived_fee_contributes_nothing() {
        let mut invoice = invoice_with_items(1);
        invoice.snapshot.transfer_fee = fixtures::transfer_fee_fixed(dec!(2));
        invoice.coverage.waive_transfer_fee = true;
        recompute(&mut invoice);
        assert_eq!(invoice.total, Amount::from_major(10));
        assert!(invoice.snapshot.transfer_fee.waived_by_coverage);
    }

    #[test]
    fn exempt_items_stay_out_of_subtotal() {
        let mut invoice = invoice_with_items(2);
        invoice.items[1].exempt_from_guardian = true;
        recompute(&mut invoice);
        assert_eq!(invoice.subtotal, Amount::from_major(10));
    }

    #[test]
    fn covered_classes_walk_chronologically() {
        let invoice = invoice_with_items(3);
        let covered = covered_class_ids(&invoice, Hours::from_minutes(120));
        assert_eq!(
            covered,
            vec![ClassId::from_u64(1), ClassId::from_u64(2)]
        );
        assert!(
            covered_class_ids(&invoice, Hours::from_minutes(30)).is_empty()
        );
    }

    #[test]
    fn eligible_increment_skips_exempt_spans() {
        let mut invoice = invoice_with_items(3);
        invoice.items[1].exempt_from_guardian = true;
        // Increment covering all three hours credits only the two billable.
        let credited = eligible_increment(
            &invoice,
            Hours::ZERO,
            Hours::from_minutes(180),
        );
        assert_eq!(credited, Hours::from_minutes(120));

        // Increment covering only the exempt middle hour credits nothing.
        let credited = eligible_increment(
            &invoice,
            Hours::from_minutes(60),
            Hours::from_minutes(120),
        );
        assert_eq!(credited, Hours::ZERO);
    }

    #[test]
    fn student_shares_accumulate() {
        let mut invoice = invoice_with_items(3);
        invoice.items[2].student = StudentId::from_u64(2);
        let shares = student_hour_shares(&invoice);
        assert_eq!(
            shares,
            vec![
                (StudentId::from_u64(1), Hours::from_minutes(120)),
                (StudentId::from_u64(2), Hours::from_minutes(60)),
            ]
        );
    }

    #[test]
    fn recompute_upholds_total_invariant() {
        use proptest::{prop_assert_eq, proptest};
        proptest!(|(
            mins in proptest::collection::vec(15u32..240, 0..10),
            fee in 0u32..20,
        )| {
            let mut invoice =
                fixtures::invoice(InvoiceKind::GuardianInvoice);
            for (i, m) in mins.iter().enumerate() {
                let mut item =
                    fixtures::line_item(ClassId::from_u64(i as u64 + 1));
                item.duration_mins = *m;
                item.amount = LineItem::compute_amount(item.rate, *m);
                invoice.items.push(item);
            }
            invoice.snapshot.transfer_fee =
                fixtures::transfer_fee_fixed(Decimal::from(fee));
            recompute(&mut invoice);

            let expected = (invoice.subtotal
                + invoice.snapshot.transfer_fee.amount
                + invoice.late_fee
                + invoice.tip
                + invoice.tax)
                .saturating_sub(invoice.discount)
                .round2();
            prop_assert_eq!(invoice.total, expected);
            prop_assert_eq!(invoice.adjusted_total, invoice.total);
            prop_assert_eq!(
                invoice.paid_amount,
                invoice.paid_amount_derived()
            );
        })
    }

    #[test]
    fn expand_period_widens_but_never_narrows() {
        let mut invoice = invoice_with_items(1);
        invoice.items[0].date = fixtures::date(2025, 2, 10);
        expand_period_to_items(&mut invoice);
        assert_eq!(invoice.period.start, fixtures::date(2025, 1, 1));
        assert_eq!(invoice.period.end, fixtures::date(2025, 2, 10));
    }
}
