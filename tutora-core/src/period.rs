use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// The calendar window an invoice bills over.
///
/// The bounds are fixed at invoice creation and never shift implicitly on
/// read; only explicit coverage updates (or the payment applier widening the
/// window to span included items) may rewrite them. Both bounds are
/// inclusive: a lesson scheduled exactly on `end` belongs to the period.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub month: u32,
    pub year: i32,
}

impl BillingPeriod {
    /// The period spanning a full calendar month.
    pub fn for_month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let end = start
            .checked_add_months(Months::new(1))?
            .pred_opt()?;
        Some(Self { start, end, month, year })
    }

    /// A period with explicit bounds; month/year are taken from the start.
    pub fn from_bounds(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            month: start.month(),
            year: start.year(),
        }
    }

    /// Whether `date` falls inside the period, inclusive on both bounds.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Human-readable label for exports, e.g. "January 2025".
    pub fn label(&self) -> String {
        self.start.format("%B %Y").to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn month_bounds() {
        let p = BillingPeriod::for_month(2025, 1).unwrap();
        assert_eq!(p.start, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(p.end, NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
        assert_eq!(p.label(), "January 2025");

        let feb = BillingPeriod::for_month(2024, 2).unwrap();
        assert_eq!(feb.end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn contains_is_inclusive() {
        let p = BillingPeriod::for_month(2025, 1).unwrap();
        assert!(p.contains(p.start));
        assert!(p.contains(p.end));
        assert!(!p.contains(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()));
    }
}
