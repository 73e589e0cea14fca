//! Lesson eligibility selection.
//!
//! Given a guardian's classes and the set of class keys already billed
//! elsewhere, [`select`] returns the chronologically-ordered lessons
//! eligible for a billing window, honouring exclusion sets, coverage
//! filters, the hour cap, and the hard output limit. The function is pure;
//! [`eligible_lessons`] is the store-backed wrapper.

use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use tutora_core::{
    Result,
    amount::Amount,
    class::Class,
    hours::Hours,
    ids::{ClassId, GuardianId, InvoiceId, StudentId},
    invoice::{CoverageFilters, FinancialSnapshot, LineItem},
    party::Guardian,
    time::TimestampMs,
};

use crate::context::BillingContext;

/// The time window lessons are selected from.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionWindow {
    pub lower: Option<NaiveDate>,
    pub upper: Option<NaiveDate>,
}

impl SelectionWindow {
    pub fn bounded(lower: NaiveDate, upper: NaiveDate) -> Self {
        Self { lower: Some(lower), upper: Some(upper) }
    }

    pub fn until(upper: NaiveDate) -> Self {
        Self { lower: None, upper: Some(upper) }
    }

    pub fn from(lower: NaiveDate) -> Self {
        Self { lower: Some(lower), upper: None }
    }

    fn contains(&self, date: NaiveDate) -> bool {
        // Bounds are inclusive; a lesson on the period end date belongs to
        // the period.
        self.lower.is_none_or(|lo| lo <= date)
            && self.upper.is_none_or(|hi| date <= hi)
    }
}

/// Selection options beyond the window itself.
#[derive(Clone, Debug)]
pub struct SelectOptions {
    /// If set, only these students' lessons are considered.
    pub students: Option<BTreeSet<StudentId>>,
    /// Stop once cumulative duration reaches this cap.
    pub cap_hours: Option<Hours>,
    /// Classes excluded from coverage even if inside the window.
    pub excluded: BTreeSet<ClassId>,
    /// Whether past-dated lessons whose report-submission window is still
    /// open are eligible.
    pub include_report_window: bool,
    /// Coverage-level filters (status allow-list, max duration, student
    /// sets).
    pub filters: CoverageFilters,
    /// Hard cap on the result length.
    pub max_items: usize,
}

impl SelectOptions {
    pub fn new(max_items: usize) -> Self {
        Self {
            students: None,
            cap_hours: None,
            excluded: BTreeSet::new(),
            include_report_window: true,
            filters: CoverageFilters::default(),
            max_items,
        }
    }
}

/// Apply the selection rules to `classes`, returning eligible lessons in
/// chronological order.
pub fn select<'a>(
    classes: &'a [Class],
    billed_elsewhere: &HashSet<ClassId>,
    window: &SelectionWindow,
    options: &SelectOptions,
    now: TimestampMs,
) -> Vec<&'a Class> {
    let today = now.date_utc();

    let mut candidates: Vec<&Class> = classes
        .iter()
        .filter(|class| {
            // Candidate set: never cancelled, hidden, or already paid.
            if class.status_is_cancelled()
                || class.hidden
                || class.paid_by_guardian
            {
                return false;
            }
            // One lesson, one invoice.
            if billed_elsewhere.contains(&class.id) {
                return false;
            }
            if options.excluded.contains(&class.id) {
                return false;
            }
            if !window.contains(class.scheduled_date()) {
                return false;
            }
            if let Some(students) = &options.students {
                if !students.contains(&class.student) {
                    return false;
                }
            }
            if !options.filters.allows_student(class.student) {
                return false;
            }
            if let Some(max_mins) = options.filters.max_lesson_mins {
                if class.duration_mins > max_mins {
                    return false;
                }
            }
            if let Some(allowed) = &options.filters.statuses {
                match class.status {
                    Some(status) if allowed.contains(&status) => {}
                    _ => return false,
                }
            }
            eligible_by_status_and_time(class, today, now, options)
        })
        .collect();

    candidates.sort_by_key(|c| (c.scheduled_at, c.created_at));

    let mut out = Vec::new();
    let mut cumulative = Hours::ZERO;
    for class in candidates {
        if let Some(cap) = options.cap_hours {
            let after = cumulative + class.hours();
            // Include the boundary lesson in full only if doing so stays
            // within cap + epsilon.
            if after.exceeds(cap) {
                break;
            }
            cumulative = after;
        }
        out.push(class);
        if out.len() >= options.max_items {
            break;
        }
    }
    out
}

fn eligible_by_status_and_time(
    class: &Class,
    today: NaiveDate,
    now: TimestampMs,
    options: &SelectOptions,
) -> bool {
    use tutora_core::class::ClassStatus::*;

    // Always billable outcomes.
    if matches!(class.status, Some(Attended) | Some(MissedByStudent)) {
        return true;
    }

    let future = class.scheduled_date() >= today;
    if future {
        return matches!(
            class.status,
            None | Some(Scheduled) | Some(InProgress) | Some(Completed)
        );
    }

    // Past-dated without a terminal outcome: billable only while the report
    // window is open, and only when the caller opted in.
    let terminal = class.status.is_some_and(|s| s.is_terminal());
    if terminal {
        return false;
    }
    options.include_report_window && class.report_window_open(now)
}

/// Resolve the hourly rate for new items: frozen snapshot first, then the
/// guardian's current rate, then any existing item rate, then a rate derived
/// from an existing item's amount, then the configured default.
pub fn resolve_rate(
    ctx: &BillingContext,
    snapshot: Option<&FinancialSnapshot>,
    guardian: Option<&Guardian>,
    existing_items: &[LineItem],
) -> Amount {
    if let Some(snapshot) = snapshot {
        if !snapshot.hourly_rate.is_zero() {
            return snapshot.hourly_rate;
        }
    }
    if let Some(guardian) = guardian {
        if !guardian.hourly_rate.is_zero() {
            return guardian.hourly_rate;
        }
    }
    if let Some(item) = existing_items.iter().find(|i| !i.rate.is_zero()) {
        return item.rate;
    }
    if let Some(item) = existing_items
        .iter()
        .find(|i| !i.amount.is_zero() && i.duration_mins > 0)
    {
        let hours = item.hours();
        if let Some(rate) =
            item.amount.checked_div(hours.as_decimal())
        {
            return rate.round2();
        }
    }
    ctx.config.default_hourly_rate
}

/// Store-backed selection for a guardian: loads the guardian's classes and
/// the set of class keys billed on other active invoices, then delegates to
/// [`select`].
pub async fn eligible_lessons(
    ctx: &BillingContext,
    guardian: GuardianId,
    window: &SelectionWindow,
    options: &SelectOptions,
    ignore_invoice: Option<InvoiceId>,
) -> Result<Vec<Class>> {
    let classes = ctx.store.classes_for_guardian(guardian).await?;
    let billed =
        ctx.store.billed_class_keys(guardian, ignore_invoice).await?;
    let now = ctx.now();
    let selected = select(&classes, &billed, window, options, now);
    Ok(selected.into_iter().cloned().collect())
}

#[cfg(test)]
mod test {
    use tutora_core::{class::ClassStatus, test_utils::fixtures};

    use super::*;

    fn noon_utc(y: i32, m: u32, d: u32) -> TimestampMs {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        let dt = date.and_hms_opt(12, 0, 0).unwrap().and_utc();
        TimestampMs::try_from_i64(dt.timestamp_millis()).unwrap()
    }

    fn class_on(n: u64, y: i32, m: u32, d: u32) -> Class {
        let mut class = fixtures::class(n, fixtures::guardian(1).id);
        class.scheduled_at = noon_utc(y, m, d);
        class
    }

    #[test]
    fn excludes_cancelled_hidden_paid_and_billed() {
        let now = noon_utc(2025, 1, 10);
        let mut cancelled = class_on(1, 2025, 1, 20);
        cancelled.status = Some(ClassStatus::CancelledByGuardian);
        let mut hidden = class_on(2, 2025, 1, 21);
        hidden.hidden = true;
        let mut paid = class_on(3, 2025, 1, 22);
        paid.paid_by_guardian = true;
        let billed = class_on(4, 2025, 1, 23);
        let ok = class_on(5, 2025, 1, 24);

        let classes = vec![cancelled, hidden, paid, billed.clone(), ok];
        let billed_set = HashSet::from([billed.id]);
        let window = SelectionWindow::bounded(
            fixtures::date(2025, 1, 1),
            fixtures::date(2025, 1, 31),
        );
        let options = SelectOptions::new(400);

        let selected = select(&classes, &billed_set, &window, &options, now);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, ClassId::from_u64(5));
    }

    #[test]
    fn window_end_date_is_inclusive() {
        let now = noon_utc(2025, 1, 10);
        let on_end = class_on(1, 2025, 1, 31);
        let after = class_on(2, 2025, 2, 1);
        let classes = vec![on_end, after];
        let window = SelectionWindow::bounded(
            fixtures::date(2025, 1, 1),
            fixtures::date(2025, 1, 31),
        );
        let selected = select(
            &classes,
            &HashSet::new(),
            &window,
            &SelectOptions::new(400),
            now,
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, ClassId::from_u64(1));
    }

    #[test]
    fn past_dated_respects_report_window() {
        let now = noon_utc(2025, 1, 20);
        // Past lesson, still Scheduled, report deadline not yet passed.
        let mut open = class_on(1, 2025, 1, 5);
        open.report_deadline = Some(noon_utc(2025, 1, 25));
        // Past lesson whose deadline expired.
        let mut expired = class_on(2, 2025, 1, 6);
        expired.report_deadline = Some(noon_utc(2025, 1, 10));

        let classes = vec![open.clone(), expired];
        let window = SelectionWindow::bounded(
            fixtures::date(2025, 1, 1),
            fixtures::date(2025, 1, 31),
        );
        let mut options = SelectOptions::new(400);
        let selected =
            select(&classes, &HashSet::new(), &window, &options, now);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, open.id);

        options.include_report_window = false;
        let selected =
            select(&classes, &HashSet::new(), &window, &options, now);
        assert!(selected.is_empty());
    }

    #[test]
    fn cap_stops_before_boundary_lesson_that_would_exceed() {
        let now = noon_utc(2025, 1, 1);
        let classes = vec![
            class_on(1, 2025, 1, 10),
            class_on(2, 2025, 1, 11),
            class_on(3, 2025, 1, 12),
        ];
        let window = SelectionWindow::bounded(
            fixtures::date(2025, 1, 1),
            fixtures::date(2025, 1, 31),
        );
        let mut options = SelectOptions::new(400);
        options.cap_hours = Some(Hours::from_minutes(120));

        let selected =
            select(&classes, &HashSet::new(), &window, &options, now);
        assert_eq!(selected.len(), 2);

        // A cap that exactly matches the third lesson includes it.
        options.cap_hours = Some(Hours::from_minutes(180));
        let selected =
            select(&classes, &HashSet::new(), &window, &options, now);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn hard_cap_limits_output() {
        let now = noon_utc(2025, 1, 1);
        let classes: Vec<Class> =
            (1..=10).map(|n| class_on(n, 2025, 1, n as u32)).collect();
        let window = SelectionWindow::default();
        let mut options = SelectOptions::new(4);
        options.include_report_window = true;

        let selected =
            select(&classes, &HashSet::new(), &window, &options, now);
        assert_eq!(selected.len(), 4);
    }
}
