//! The deterministic export snapshot consumed by document renderers.
//!
//! Everything a DOCX/PDF renderer needs is precomputed into plain strings
//! here, so rendering is a dumb template fill: same invoice in, same
//! snapshot out. Money is formatted with the configured currency format;
//! hours use at most two fractional digits.

use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use tutora_core::{
    Result,
    amount::Amount,
    hours::Hours,
    invoice::{Invoice, PaymentLogDetail},
    party::Guardian,
};

use crate::context::BillingContext;

/// Locale-ish money formatting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrencyFormat {
    pub symbol: String,
    pub thousands_sep: char,
    pub decimal_sep: char,
}

impl Default for CurrencyFormat {
    fn default() -> Self {
        Self { symbol: "$".to_owned(), thousands_sep: ',', decimal_sep: '.' }
    }
}

/// Format an amount as e.g. `$1,234.50`.
pub fn format_money(amount: Amount, format: &CurrencyFormat) -> String {
    let rounded = amount.round2().as_decimal();
    let negative_free = rounded.abs();
    let units = negative_free.trunc();
    let cents = (negative_free.fract() * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u32()
        .unwrap_or(0);

    // Group the integer part in threes.
    let digits = units.trunc().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(format.thousands_sep);
        }
        grouped.push(c);
    }

    format!(
        "{}{}{}{:02}",
        format.symbol, grouped, format.decimal_sep, cents
    )
}

/// Format hours with up to two fractional digits (`1.5`, `2`, `0.75`).
pub fn format_hours(hours: Hours) -> String {
    let rounded = hours
        .as_decimal()
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    rounded.to_string()
}

// --- Snapshot sections --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportHeader {
    pub number: String,
    pub name: String,
    pub status: String,
    pub due_date: Option<String>,
    pub period_label: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportGuardian {
    pub name: String,
    pub email: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportSummary {
    pub lesson_count: usize,
    pub student_count: usize,
    pub teacher_count: usize,
    pub total_hours: String,
}

/// One row of the financial table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinancialRow {
    pub label: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportItem {
    pub date: String,
    pub description: String,
    pub student: String,
    pub teacher: String,
    pub hours: String,
    pub rate: String,
    pub amount: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartyTotal {
    pub name: String,
    pub hours: String,
    pub amount: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportPayment {
    pub date: String,
    pub method: String,
    pub amount: String,
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportDelivery {
    pub channel: String,
    pub status: String,
    pub attempt: u32,
    pub at: String,
}

/// Summary of the guardian's previous invoice, when requested.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviousInvoiceSummary {
    pub number: String,
    pub total: String,
    pub paid_amount: String,
    pub status: String,
}

/// The complete, render-ready value object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub header: ExportHeader,
    pub guardian: Option<ExportGuardian>,
    pub summary: ExportSummary,
    pub financials: Vec<FinancialRow>,
    pub items: Vec<ExportItem>,
    pub per_student: Vec<PartyTotal>,
    pub per_teacher: Vec<PartyTotal>,
    pub payments: Vec<ExportPayment>,
    pub deliveries: Vec<ExportDelivery>,
    pub notes: Option<String>,
    pub previous: Option<PreviousInvoiceSummary>,
}

/// Build the export snapshot for `invoice`.
pub async fn build_export_snapshot(
    ctx: &BillingContext,
    invoice: &Invoice,
    currency: &CurrencyFormat,
    previous: Option<&Invoice>,
) -> Result<ExportSnapshot> {
    let guardian: Option<Guardian> = match invoice.guardian {
        Some(id) => ctx.store.get_guardian(id).await?,
        None => None,
    };

    let mut students: Vec<&str> = Vec::new();
    let mut teachers: Vec<&str> = Vec::new();
    for item in &invoice.items {
        let s = item.student_snapshot.first_name.as_str();
        if !students.contains(&s) {
            students.push(s);
        }
        let t = item.teacher_snapshot.first_name.as_str();
        if !teachers.contains(&t) {
            teachers.push(t);
        }
    }

    let header = ExportHeader {
        number: invoice.number.clone(),
        name: invoice.name.clone(),
        status: invoice.status.to_string(),
        due_date: invoice.due_date.map(|d| d.format("%Y-%m-%d").to_string()),
        period_label: invoice.period.label(),
    };

    let summary = ExportSummary {
        lesson_count: invoice.items.len(),
        student_count: students.len(),
        teacher_count: teachers.len(),
        total_hours: format_hours(invoice.total_item_hours()),
    };

    let fee = &invoice.snapshot.transfer_fee;
    let fee_label = match (fee.is_waived(), fee.mode) {
        (true, _) => "Transfer fee (waived)".to_owned(),
        (false, tutora_core::invoice::TransferFeeMode::Percent) => {
            format!("Transfer fee ({}%)", fee.value.normalize())
        }
        (false, tutora_core::invoice::TransferFeeMode::Fixed) => {
            "Transfer fee".to_owned()
        }
    };
    let financials = vec![
        row("Subtotal", invoice.subtotal, currency),
        row(&fee_label, fee.amount, currency),
        row("Discount", invoice.discount, currency),
        row("Tax", invoice.tax, currency),
        row("Late fee", invoice.late_fee, currency),
        row("Tip", invoice.tip, currency),
        row("Total", invoice.total, currency),
        row("Adjusted total", invoice.adjusted_total, currency),
        row("Paid", invoice.paid_amount_derived(), currency),
        row("Balance", invoice.remaining_balance(), currency),
    ];

    let items = invoice
        .items
        .iter()
        .map(|item| ExportItem {
            date: item.date.format("%Y-%m-%d").to_string(),
            description: item.description.clone(),
            student: item.student_snapshot.full_name(),
            teacher: item.teacher_snapshot.full_name(),
            hours: format_hours(item.hours()),
            rate: format_money(item.rate, currency),
            amount: format_money(item.amount, currency),
        })
        .collect();

    let per_student = party_totals(invoice, currency, |item| {
        (item.student_snapshot.full_name(), item.hours(), item.amount)
    });
    let per_teacher = party_totals(invoice, currency, |item| {
        (item.teacher_snapshot.full_name(), item.hours(), item.amount)
    });

    let payments = invoice
        .payment_log
        .iter()
        .map(|entry| ExportPayment {
            date: entry
                .processed_at
                .date_utc()
                .format("%Y-%m-%d")
                .to_string(),
            method: entry.method.to_string(),
            amount: format_money(entry.amount, currency),
            kind: match entry.detail {
                PaymentLogDetail::Payment { .. } => "payment".to_owned(),
                PaymentLogDetail::Refund { .. } => "refund".to_owned(),
                PaymentLogDetail::TipDistribution { .. } =>
                    "tip_distribution".to_owned(),
            },
        })
        .collect();

    let deliveries = invoice
        .delivery_log
        .iter()
        .map(|d| ExportDelivery {
            channel: d.channel.to_string(),
            status: d.status.to_string(),
            attempt: d.attempt,
            at: d.at.date_utc().format("%Y-%m-%d").to_string(),
        })
        .collect();

    let previous = previous.map(|p| PreviousInvoiceSummary {
        number: p.number.clone(),
        total: format_money(p.total, currency),
        paid_amount: format_money(p.paid_amount_derived(), currency),
        status: p.status.to_string(),
    });

    Ok(ExportSnapshot {
        header,
        guardian: guardian.map(|g| ExportGuardian {
            name: g.full_name(),
            email: g.email,
        }),
        summary,
        financials,
        items,
        per_student,
        per_teacher,
        payments,
        deliveries,
        notes: invoice.notes.clone(),
        previous,
    })
}

fn row(label: &str, value: Amount, currency: &CurrencyFormat) -> FinancialRow {
    FinancialRow {
        label: label.to_owned(),
        value: format_money(value, currency),
    }
}

fn party_totals<F>(
    invoice: &Invoice,
    currency: &CurrencyFormat,
    key: F,
) -> Vec<PartyTotal>
where
    F: Fn(&tutora_core::invoice::LineItem) -> (String, Hours, Amount),
{
    let mut totals: Vec<(String, Hours, Amount)> = Vec::new();
    for item in &invoice.items {
        let (name, hours, amount) = key(item);
        match totals.iter_mut().find(|(n, _, _)| *n == name) {
            Some((_, h, a)) => {
                *h = *h + hours;
                *a = *a + amount;
            }
            None => totals.push((name, hours, amount)),
        }
    }
    totals
        .into_iter()
        .map(|(name, hours, amount)| PartyTotal {
            name,
            hours: format_hours(hours),
            amount: format_money(amount, currency),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn money_formatting_groups_thousands() {
        let fmt = CurrencyFormat::default();
        let amount = Amount::try_from_decimal(dec!(1234567.5)).unwrap();
        assert_eq!(format_money(amount, &fmt), "$1,234,567.50");
        assert_eq!(format_money(Amount::ZERO, &fmt), "$0.00");
        assert_eq!(
            format_money(Amount::from_major(12), &fmt),
            "$12.00"
        );
    }

    #[test]
    fn hours_use_at_most_two_digits() {
        assert_eq!(format_hours(Hours::from_minutes(90)), "1.5");
        assert_eq!(format_hours(Hours::from_minutes(120)), "2");
        assert_eq!(format_hours(Hours::from_minutes(50)), "0.83");
    }
}
