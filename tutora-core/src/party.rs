//! Guardian, teacher, and student projections: the fields of the user
//! documents that the billing engine reads and the three hour/earnings
//! ledgers it writes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    amount::Amount,
    hours::Hours,
    ids::{GuardianId, StudentId, TeacherId},
    invoice::{PaymentMethod, TransferFeeMode},
};

/// A guardian's transfer-fee configuration, the source of the
/// `guardian_default` financial snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransferFeeConfig {
    pub mode: TransferFeeMode,
    pub value: Decimal,
}

/// The billed party.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: GuardianId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub hourly_rate: Amount,
    pub transfer_fee: Option<TransferFeeConfig>,
    pub preferred_payment_method: Option<PaymentMethod>,

    /// The hour balance: initial + payment credits − consumed lesson hours −
    /// refund reversals. May go negative; the auto generator watches for the
    /// balance dropping to or below the minimum-lesson threshold.
    pub total_hours: Decimal,
    /// Cumulative hours ever consumed, monotonically increasing.
    pub consumed_hours: Decimal,
    /// While set, `total_hours` is re-derived from invoices on lesson
    /// debits. Cleared by the payment applier once a manual credit lands so
    /// a stale recomputation cannot clobber it.
    #[serde(default)]
    pub auto_total: bool,
    /// Shortest lesson this guardian books, in minutes. The auto generator
    /// triggers when the balance cannot cover one more such lesson.
    pub min_lesson_mins: Option<u32>,
}

impl Guardian {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Credit hours from an invoice payment.
    pub fn credit_hours(&mut self, hours: Hours) {
        self.total_hours += hours.round3().as_decimal();
    }

    /// Debit hours, e.g. when a lesson becomes countable or on refund.
    pub fn debit_hours(&mut self, hours: Hours) {
        self.total_hours -= hours.round3().as_decimal();
    }
}

/// A student's remaining-hours ledger. Unlike the guardian balance this is
/// clamped at zero on debit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub guardian: GuardianId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub remaining_hours: Decimal,
}

impl Student {
    /// Debit, clamped so the ledger never goes negative. Returns the hours
    /// actually removed.
    pub fn debit_hours_clamped(&mut self, hours: Hours) -> Hours {
        let requested = hours.round3().as_decimal();
        let applied = requested.min(self.remaining_hours.max(Decimal::ZERO));
        self.remaining_hours -= applied;
        Hours::try_from_decimal(applied).unwrap_or(Hours::ZERO)
    }

    pub fn credit_hours(&mut self, hours: Hours) {
        self.remaining_hours += hours.round3().as_decimal();
    }
}

/// One month of a teacher's hours/earnings ledger.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TeacherMonth {
    pub year: i32,
    pub month: u32,
    pub hours: Decimal,
    pub earnings: Amount,
}

/// A teacher and their monthly ledger.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Teacher {
    pub id: TeacherId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Excluded teachers receive no tip distributions.
    #[serde(default)]
    pub exclude_from_tips: bool,
    #[serde(default)]
    pub months: Vec<TeacherMonth>,
}

impl Teacher {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn month_entry(&mut self, year: i32, month: u32) -> &mut TeacherMonth {
        let idx = self
            .months
            .iter()
            .position(|m| m.year == year && m.month == month);
        match idx {
            Some(idx) => &mut self.months[idx],
            None => {
                self.months.push(TeacherMonth {
                    year,
                    month,
                    hours: Decimal::ZERO,
                    earnings: Amount::ZERO,
                });
                self.months.last_mut().unwrap()
            }
        }
    }

    pub fn add_month_hours(&mut self, year: i32, month: u32, hours: Decimal) {
        self.month_entry(year, month).hours += hours;
    }

    pub fn add_month_earnings(&mut self, year: i32, month: u32, amount: Amount) {
        let entry = self.month_entry(year, month);
        entry.earnings = entry.earnings + amount;
    }
}
