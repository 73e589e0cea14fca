//! The invoice aggregate and its embedded documents.
//!
//! An [`Invoice`] embeds its line items, payment log, activity log, and
//! delivery log in a single document, mirroring the persistent layout: one
//! aggregate per invoice, with audit entries and payment idempotency records
//! stored out-of-line (see [`crate::audit`] and [`crate::payment`]).
//!
//! ### Derived vs stored totals
//!
//! `paid_amount` is stored for query efficiency but the derived sum over the
//! payment log ([`Invoice::paid_amount_derived`]) is authoritative; every
//! engine mutation recomputes the stored field from the log.

use std::{
    collections::BTreeSet,
    fmt::{self, Display},
    str::FromStr,
};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::{
    amount::Amount,
    class::ClassStatus,
    hours::Hours,
    ids::{ActorId, ClassId, GuardianId, InvoiceId, StudentId, TeacherId},
    period::BillingPeriod,
    time::TimestampMs,
};

// --- Status and kind --- //

/// Which ledger an invoice belongs to. Sequence counters are independent per
/// kind.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum InvoiceKind {
    GuardianInvoice,
    TeacherPayment,
}

/// Invoice lifecycle states. Transition rules live in the engine's state
/// machine; this type only knows the family predicates.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(
    any(test, feature = "test-utils"),
    derive(proptest_derive::Arbitrary)
)]
pub enum InvoiceStatus {
    Draft,
    Pending,
    Sent,
    Overdue,
    PartiallyPaid,
    Paid,
    Refunded,
    Cancelled,
}

impl InvoiceStatus {
    /// Settled invoices freeze their item lists.
    pub fn is_settled(&self) -> bool {
        use InvoiceStatus::*;
        matches!(self, Paid | PartiallyPaid | Refunded)
    }

    /// Terminal states accept no further money movement.
    pub fn is_terminal(&self) -> bool {
        use InvoiceStatus::*;
        matches!(self, Refunded | Cancelled)
    }

    /// The "unpaid" family used by list filters and the auto generator.
    pub fn is_unpaid_family(&self) -> bool {
        use InvoiceStatus::*;
        matches!(self, Draft | Pending | Sent | Overdue | PartiallyPaid)
    }

    /// States in which ordinary item edits are allowed.
    pub fn items_mutable(&self) -> bool {
        use InvoiceStatus::*;
        matches!(self, Draft | Pending | Sent | Overdue)
    }
}

// --- Payment methods --- //

/// How a payment (or reversal) moved. Open set: unrecognized methods
/// roundtrip through [`PaymentMethod::Other`].
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub enum PaymentMethod {
    Manual,
    Paypal,
    Card,
    Cash,
    Bank,
    Refund,
    TipDistribution,
    Other(String),
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Paypal => "paypal",
            Self::Card => "card",
            Self::Cash => "cash",
            Self::Bank => "bank",
            Self::Refund => "refund",
            Self::TipDistribution => "tip_distribution",
            Self::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

impl FromStr for PaymentMethod {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "manual" => Self::Manual,
            "paypal" => Self::Paypal,
            "card" => Self::Card,
            "cash" => Self::Cash,
            "bank" => Self::Bank,
            "refund" => Self::Refund,
            "tip_distribution" => Self::TipDistribution,
            other => Self::Other(other.to_owned()),
        })
    }
}

// --- Line items --- //

/// Frozen name/email of a person at item-insertion time, so later profile
/// edits do not rewrite historical invoices.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PersonSnapshot {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl PersonSnapshot {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// One row on an invoice.
///
/// Both `class` and the denormalized `lesson_id` string are retained so a
/// class deletion cannot orphan the row: `lesson_id` survives even when the
/// referenced class document is gone.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub class: ClassId,
    pub lesson_id: String,
    pub student: StudentId,
    pub student_snapshot: PersonSnapshot,
    pub teacher: TeacherId,
    pub teacher_snapshot: PersonSnapshot,
    pub description: String,
    /// Date of the lesson.
    pub date: NaiveDate,
    pub duration_mins: u32,
    /// Rate frozen at insertion.
    pub rate: Amount,
    /// `rate × duration/60`, rounded to 2dp at insertion.
    pub amount: Amount,
    pub attended: bool,
    /// Class status at insertion; not live-tracked.
    pub status: Option<ClassStatus>,
    #[serde(default)]
    pub exclude_from_student_balance: bool,
    #[serde(default)]
    pub exempt_from_guardian: bool,
    #[serde(default)]
    pub exclude_from_teacher_payment: bool,
}

impl LineItem {
    pub fn hours(&self) -> Hours {
        Hours::from_minutes(self.duration_mins)
    }

    /// `rate × minutes/60`, rounded to two decimal places.
    pub fn compute_amount(rate: Amount, duration_mins: u32) -> Amount {
        (rate * (Decimal::from(duration_mins) / dec!(60))).round2()
    }

    /// Whether this item participates in the guardian-facing subtotal.
    pub fn billable(&self) -> bool {
        !self.exempt_from_guardian
    }
}

// --- Coverage --- //

/// How the billable window of an invoice is bounded.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CoverageStrategy {
    /// Bill everything inside the billing period.
    FullPeriod,
    /// Bill chronologically until the hour cap is reached.
    CapHours { max_hours: Hours },
    /// Bill up to an explicit end date overriding the period end.
    CustomEnd { end_date: NaiveDate },
    /// Fully custom: optional cap and optional end override.
    Custom {
        max_hours: Option<Hours>,
        end_date: Option<NaiveDate>,
    },
}

/// Additional lesson filters applied by the selector.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CoverageFilters {
    /// If set, only classes in one of these statuses are eligible.
    pub statuses: Option<BTreeSet<ClassStatus>>,
    /// If set, classes longer than this are skipped.
    pub max_lesson_mins: Option<u32>,
    /// If non-empty, only these students' classes are eligible.
    pub include_students: BTreeSet<StudentId>,
    /// These students' classes are never eligible.
    pub exclude_students: BTreeSet<StudentId>,
}

impl CoverageFilters {
    pub fn allows_student(&self, student: StudentId) -> bool {
        if self.exclude_students.contains(&student) {
            return false;
        }
        self.include_students.is_empty()
            || self.include_students.contains(&student)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub strategy: CoverageStrategy,
    #[serde(default)]
    pub waive_transfer_fee: bool,
    #[serde(default)]
    pub filters: CoverageFilters,
}

impl Coverage {
    pub fn full_period() -> Self {
        Self {
            strategy: CoverageStrategy::FullPeriod,
            waive_transfer_fee: false,
            filters: CoverageFilters::default(),
        }
    }

    pub fn capped(max_hours: Hours) -> Self {
        Self {
            strategy: CoverageStrategy::CapHours { max_hours },
            waive_transfer_fee: false,
            filters: CoverageFilters::default(),
        }
    }

    pub fn max_hours(&self) -> Option<Hours> {
        match &self.strategy {
            CoverageStrategy::FullPeriod
            | CoverageStrategy::CustomEnd { .. } => None,
            CoverageStrategy::CapHours { max_hours } => Some(*max_hours),
            CoverageStrategy::Custom { max_hours, .. } => *max_hours,
        }
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        match &self.strategy {
            CoverageStrategy::FullPeriod
            | CoverageStrategy::CapHours { .. } => None,
            CoverageStrategy::CustomEnd { end_date } => Some(*end_date),
            CoverageStrategy::Custom { end_date, .. } => *end_date,
        }
    }

    /// Sets the hour cap, preserving any end-date override by switching to
    /// the `Custom` strategy where needed.
    pub fn set_max_hours(&mut self, hours: Hours) {
        self.strategy = match &self.strategy {
            CoverageStrategy::FullPeriod => {
                CoverageStrategy::CapHours { max_hours: hours }
            }
            CoverageStrategy::CapHours { .. } => {
                CoverageStrategy::CapHours { max_hours: hours }
            }
            CoverageStrategy::CustomEnd { end_date } => CoverageStrategy::Custom {
                max_hours: Some(hours),
                end_date: Some(*end_date),
            },
            CoverageStrategy::Custom { end_date, .. } => CoverageStrategy::Custom {
                max_hours: Some(hours),
                end_date: *end_date,
            },
        };
    }
}

// --- Financial snapshot --- //

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferFeeMode {
    Fixed,
    Percent,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferFeeSource {
    GuardianDefault,
    Manual,
}

/// The transfer-fee policy frozen onto an invoice.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransferFee {
    pub mode: TransferFeeMode,
    /// Configured quantity: a currency amount for `Fixed`, a percentage for
    /// `Percent`.
    pub value: Decimal,
    /// Resolved fee amount for this invoice; recomputed with the totals.
    pub amount: Amount,
    pub source: TransferFeeSource,
    #[serde(default)]
    pub waived: bool,
    #[serde(default)]
    pub waived_by_coverage: bool,
}

impl TransferFee {
    pub fn none() -> Self {
        Self {
            mode: TransferFeeMode::Fixed,
            value: Decimal::ZERO,
            amount: Amount::ZERO,
            source: TransferFeeSource::GuardianDefault,
            waived: false,
            waived_by_coverage: false,
        }
    }

    pub fn is_waived(&self) -> bool {
        self.waived || self.waived_by_coverage
    }

    /// The fee this policy yields on `subtotal`. Zero when waived.
    pub fn amount_for(&self, subtotal: Amount) -> Amount {
        if self.is_waived() {
            return Amount::ZERO;
        }
        match self.mode {
            TransferFeeMode::Fixed => Amount::try_from_decimal(self.value)
                .unwrap_or(Amount::ZERO)
                .round2(),
            TransferFeeMode::Percent =>
                (subtotal * (self.value / dec!(100))).round2(),
        }
    }
}

/// Guardian financial configuration frozen at invoice creation. Later
/// guardian edits do not propagate unless an admin re-snapshots explicitly.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub hourly_rate: Amount,
    pub transfer_fee: TransferFee,
}

// --- Payment log --- //

/// What kind of money movement a log entry records. The header's `amount` is
/// always non-negative; direction is carried by the variant (refunds are
/// debits, everything else credits or is informational).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentLogDetail {
    /// A guardian payment.
    Payment {
        paid_hours: Option<Hours>,
        tip: Amount,
    },
    /// A reversal of previously-paid money.
    Refund { hours: Hours, reason: String },
    /// A teacher's share of a distributed tip.
    TipDistribution { teacher: TeacherId },
}

/// One money movement on an invoice.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentLogEntry {
    pub amount: Amount,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub processed_at: TimestampMs,
    pub actor: Option<ActorId>,
    pub note: Option<String>,
    #[serde(flatten)]
    pub detail: PaymentLogDetail,
}

impl PaymentLogEntry {
    pub fn is_payment(&self) -> bool {
        matches!(self.detail, PaymentLogDetail::Payment { .. })
    }

    pub fn is_refund(&self) -> bool {
        matches!(self.detail, PaymentLogDetail::Refund { .. })
    }

    pub fn paid_hours(&self) -> Option<Hours> {
        match self.detail {
            PaymentLogDetail::Payment { paid_hours, .. } => paid_hours,
            _ => None,
        }
    }

    pub fn tip(&self) -> Amount {
        match self.detail {
            PaymentLogDetail::Payment { tip, .. } => tip,
            _ => Amount::ZERO,
        }
    }
}

// --- Activity and delivery logs --- //

/// A human-readable action line shown to admins on the invoice page.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub actor: Option<ActorId>,
    pub message: String,
    pub at: TimestampMs,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryChannel {
    Email,
    Sms,
    Broadcast,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

/// Per-channel record of one send attempt.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub channel: DeliveryChannel,
    pub status: DeliveryStatus,
    pub template: String,
    pub attempt: u32,
    pub message_hash: Option<String>,
    pub at: TimestampMs,
}

// --- The aggregate --- //

/// The central billing aggregate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub kind: InvoiceKind,

    // Identity derived from the sequence counter.
    pub sequence: u64,
    /// Zero-padded canonical number, e.g. "INV-000042".
    pub number: String,
    /// Display name; admin-editable.
    pub name: String,
    /// Set when an admin renamed the invoice; blocks auto-renames.
    #[serde(default)]
    pub manual_name: bool,
    /// URL-safe public slug.
    pub slug: String,

    pub guardian: Option<GuardianId>,
    pub teacher: Option<TeacherId>,
    pub created_by: Option<ActorId>,
    pub updated_by: Option<ActorId>,

    pub period: BillingPeriod,
    pub items: Vec<LineItem>,
    pub coverage: Coverage,
    pub snapshot: FinancialSnapshot,

    // Totals. `subtotal`..`total` are derived and recomputed by the engine;
    // they are stored for query efficiency.
    pub subtotal: Amount,
    pub discount: Amount,
    /// Modelled but currently always zero.
    pub tax: Amount,
    pub late_fee: Amount,
    pub tip: Amount,
    pub total: Amount,
    /// Mirrors `total` after adjustments; retained for compatibility.
    pub adjusted_total: Amount,
    pub paid_amount: Amount,

    pub status: InvoiceStatus,
    pub due_date: Option<NaiveDate>,
    pub paid_at: Option<TimestampMs>,
    pub created_at: TimestampMs,
    pub deleted_at: Option<TimestampMs>,
    pub restored_at: Option<TimestampMs>,
    pub restored_by: Option<ActorId>,

    /// Classes excluded from coverage even if inside the window.
    #[serde(default)]
    pub excluded_classes: BTreeSet<ClassId>,

    #[serde(default)]
    pub payment_log: Vec<PaymentLogEntry>,
    #[serde(default)]
    pub activity_log: Vec<ActivityEntry>,
    #[serde(default)]
    pub delivery_log: Vec<DeliveryAttempt>,

    pub notes: Option<String>,

    /// Optimistic-concurrency token; bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
}

impl Invoice {
    // --- Derived money --- //

    /// The authoritative paid amount: payment entries minus refund entries.
    /// Tip distributions are informational and excluded.
    pub fn paid_amount_derived(&self) -> Amount {
        let mut paid = Amount::ZERO;
        let mut refunded = Amount::ZERO;
        for entry in &self.payment_log {
            match entry.detail {
                PaymentLogDetail::Payment { .. } => paid = paid + entry.amount,
                PaymentLogDetail::Refund { .. } =>
                    refunded = refunded + entry.amount,
                PaymentLogDetail::TipDistribution { .. } => {}
            }
        }
        paid.saturating_sub(refunded).round2()
    }

    /// `max(0, total − paid)`.
    pub fn remaining_balance(&self) -> Amount {
        self.total.saturating_sub(self.paid_amount_derived())
    }

    /// Re-derives the stored `paid_amount` from the payment log. One-time
    /// repair for legacy documents whose stored field diverged.
    pub fn reconcile_paid_amount(&mut self) {
        self.paid_amount = self.paid_amount_derived();
    }

    // --- Derived hours --- //

    /// Total scheduled hours across all items.
    pub fn total_item_hours(&self) -> Hours {
        self.items.iter().map(LineItem::hours).sum()
    }

    /// Hours across items that count toward the guardian balance.
    pub fn eligible_item_hours(&self) -> Hours {
        self.items
            .iter()
            .filter(|i| i.billable())
            .map(LineItem::hours)
            .sum()
    }

    /// Sum of hours across all positive payment entries, deriving from
    /// amount and the snapshot rate where hours were not recorded.
    pub fn positive_payment_hours(&self) -> Hours {
        let rate = self.snapshot.hourly_rate;
        self.payment_log
            .iter()
            .filter(|e| e.is_payment())
            .map(|e| {
                e.paid_hours().unwrap_or_else(|| {
                    if rate.is_zero() {
                        Hours::ZERO
                    } else {
                        Hours::try_from_decimal(
                            e.amount.as_decimal() / rate.as_decimal(),
                        )
                        .unwrap_or(Hours::ZERO)
                    }
                })
            })
            .sum()
    }

    /// Sum of hours reversed by refund entries.
    pub fn refunded_hours(&self) -> Hours {
        self.payment_log
            .iter()
            .filter_map(|e| match &e.detail {
                PaymentLogDetail::Refund { hours, .. } => Some(*hours),
                _ => None,
            })
            .sum()
    }

    // --- Predicates --- //

    pub fn is_settled(&self) -> bool {
        self.status.is_settled()
    }

    /// Active invoices hold the one-lesson-one-invoice claim on their items.
    pub fn active(&self) -> bool {
        !self.status.is_terminal() && self.deleted_at.is_none()
    }

    /// Whether `class` (or the matching denormalized lesson id) appears on
    /// this invoice.
    pub fn contains_class(&self, class: ClassId) -> bool {
        let lesson_id = class.to_string();
        self.items
            .iter()
            .any(|i| i.class == class || i.lesson_id == lesson_id)
    }

    pub fn item_index_for_class(&self, class: ClassId) -> Option<usize> {
        let lesson_id = class.to_string();
        self.items
            .iter()
            .position(|i| i.class == class || i.lesson_id == lesson_id)
    }

    // --- Log helpers --- //

    pub fn push_activity(
        &mut self,
        actor: Option<ActorId>,
        message: impl Into<String>,
        at: TimestampMs,
    ) {
        self.activity_log.push(ActivityEntry {
            actor,
            message: message.into(),
            at,
        });
    }

    pub fn record_delivery(&mut self, attempt: DeliveryAttempt) {
        self.delivery_log.push(attempt);
    }

    /// Next attempt number for `channel`.
    pub fn next_delivery_attempt(&self, channel: DeliveryChannel) -> u32 {
        self.delivery_log
            .iter()
            .filter(|d| d.channel == channel)
            .map(|d| d.attempt)
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::fixtures;

    #[test]
    fn paid_amount_excludes_tip_distributions() {
        let mut invoice = fixtures::invoice(InvoiceKind::GuardianInvoice);
        let at = TimestampMs::try_from_i64(1_000).unwrap();
        invoice.payment_log.push(PaymentLogEntry {
            amount: Amount::from_major(12),
            method: PaymentMethod::Manual,
            transaction_id: None,
            idempotency_key: None,
            processed_at: at,
            actor: None,
            note: None,
            detail: PaymentLogDetail::Payment {
                paid_hours: Some(Hours::from_minutes(60)),
                tip: Amount::ZERO,
            },
        });
        invoice.payment_log.push(PaymentLogEntry {
            amount: Amount::from_major(3),
            method: PaymentMethod::TipDistribution,
            transaction_id: None,
            idempotency_key: None,
            processed_at: at,
            actor: None,
            note: None,
            detail: PaymentLogDetail::TipDistribution {
                teacher: TeacherId::from_u64(1),
            },
        });
        invoice.payment_log.push(PaymentLogEntry {
            amount: Amount::from_major(5),
            method: PaymentMethod::Refund,
            transaction_id: None,
            idempotency_key: None,
            processed_at: at,
            actor: None,
            note: None,
            detail: PaymentLogDetail::Refund {
                hours: Hours::from_minutes(30),
                reason: "overcharge".to_owned(),
            },
        });

        assert_eq!(invoice.paid_amount_derived(), Amount::from_major(7));
    }

    #[test]
    fn contains_class_matches_denormalized_lesson_id() {
        let mut invoice = fixtures::invoice(InvoiceKind::GuardianInvoice);
        let class = ClassId::from_u64(9);
        let mut item = fixtures::line_item(class);
        // Simulate a dangling class ref: only the lesson_id string survives.
        item.class = ClassId::from_u64(999);
        item.lesson_id = class.to_string();
        invoice.items.push(item);

        assert!(invoice.contains_class(class));
    }

    #[test]
    fn coverage_set_max_hours_preserves_end_date() {
        let end = NaiveDate::from_ymd_opt(2025, 3, 15).unwrap();
        let mut coverage = Coverage {
            strategy: CoverageStrategy::CustomEnd { end_date: end },
            waive_transfer_fee: false,
            filters: CoverageFilters::default(),
        };
        coverage.set_max_hours(Hours::from_minutes(120));
        assert_eq!(coverage.max_hours(), Some(Hours::from_minutes(120)));
        assert_eq!(coverage.end_date(), Some(end));
    }

    #[test]
    fn transfer_fee_percent_and_waive() {
        let fee = TransferFee {
            mode: TransferFeeMode::Percent,
            value: rust_decimal_macros::dec!(2.5),
            amount: Amount::ZERO,
            source: TransferFeeSource::GuardianDefault,
            waived: false,
            waived_by_coverage: false,
        };
        assert_eq!(
            fee.amount_for(Amount::from_major(200)),
            Amount::from_major(5)
        );

        let waived = TransferFee { waived: true, ..fee };
        assert_eq!(waived.amount_for(Amount::from_major(200)), Amount::ZERO);
    }

    #[test]
    fn status_and_kind_json_roundtrip() {
        use crate::test_utils::roundtrip;
        roundtrip::json_value_roundtrip_proptest::<InvoiceStatus>();
        roundtrip::json_value_roundtrip_proptest::<InvoiceKind>();
    }

    #[test]
    fn payment_method_roundtrips_unknown() {
        let m: PaymentMethod = "apple_pay".parse().unwrap();
        assert_eq!(m, PaymentMethod::Other("apple_pay".to_owned()));
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"apple_pay\"");
        assert_eq!(serde_json::from_str::<PaymentMethod>(&json).unwrap(), m);
    }
}
