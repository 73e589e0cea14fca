use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    hours::Hours,
    ids::{ClassId, GuardianId, StudentId, TeacherId},
    time::TimestampMs,
};

/// The lifecycle status of a class. Freshly scheduled classes carry no status
/// at all (`Option<ClassStatus>::None` on [`Class`]).
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
pub enum ClassStatus {
    Scheduled,
    InProgress,
    Completed,
    Attended,
    MissedByStudent,
    Absent,
    Cancelled,
    CancelledByGuardian,
    CancelledByTeacher,
    CancelledByAdmin,
    NoShowBoth,
    Pattern,
    OnHold,
}

impl ClassStatus {
    /// The cancelled family: statuses that permanently exclude a class from
    /// billing.
    pub fn is_cancelled_family(&self) -> bool {
        use ClassStatus::*;
        matches!(
            self,
            Cancelled
                | CancelledByGuardian
                | CancelledByTeacher
                | CancelledByAdmin
                | NoShowBoth
                | Pattern
                | OnHold
        )
    }

    /// Statuses that count against the guardian/teacher hour ledgers.
    pub fn is_countable(&self) -> bool {
        use ClassStatus::*;
        matches!(self, Attended | MissedByStudent | Absent)
    }

    /// Whether the class has reached a final outcome (countable or
    /// cancelled).
    pub fn is_terminal(&self) -> bool {
        self.is_countable() || self.is_cancelled_family()
    }
}

/// The class (lesson) projection the billing engine consumes. A thin view of
/// the scheduling engine's class document: only the fields billing reads.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: ClassId,
    pub guardian: GuardianId,
    pub teacher: TeacherId,
    pub student: StudentId,
    pub description: String,
    /// Scheduled start of the lesson.
    pub scheduled_at: TimestampMs,
    pub duration_mins: u32,
    /// `None` until the scheduling engine assigns a status.
    pub status: Option<ClassStatus>,
    /// Set when the class's full duration falls within the paid coverage of
    /// an invoice. Cleared on refund or coverage reduction.
    pub paid_by_guardian: bool,
    /// Soft-hidden classes never enter billing.
    pub hidden: bool,
    /// Teacher report deadline; past-dated non-terminal classes are billable
    /// only while this (or the admin extension below) has not passed.
    pub report_deadline: Option<TimestampMs>,
    pub report_extension: Option<TimestampMs>,
    pub created_at: TimestampMs,
}

impl Class {
    pub fn hours(&self) -> Hours {
        Hours::from_minutes(self.duration_mins)
    }

    pub fn scheduled_date(&self) -> NaiveDate {
        self.scheduled_at.date_utc()
    }

    /// Whether this class's report-submission window is still open at `now`.
    pub fn report_window_open(&self, now: TimestampMs) -> bool {
        let deadline = match (self.report_deadline, self.report_extension) {
            (Some(d), Some(e)) => Some(d.max(e)),
            (Some(d), None) => Some(d),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        match deadline {
            Some(deadline) => now <= deadline,
            // No deadline recorded: the window never closes.
            None => true,
        }
    }

    pub fn status_is_countable(&self) -> bool {
        self.status.is_some_and(|s| s.is_countable())
    }

    pub fn status_is_cancelled(&self) -> bool {
        self.status.is_some_and(|s| s.is_cancelled_family())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancelled_family_membership() {
        assert!(ClassStatus::CancelledByGuardian.is_cancelled_family());
        assert!(ClassStatus::OnHold.is_cancelled_family());
        assert!(!ClassStatus::Attended.is_cancelled_family());
        assert!(!ClassStatus::Scheduled.is_cancelled_family());
    }

    #[test]
    fn countable_statuses() {
        assert!(ClassStatus::Attended.is_countable());
        assert!(ClassStatus::MissedByStudent.is_countable());
        assert!(ClassStatus::Absent.is_countable());
        assert!(!ClassStatus::Completed.is_countable());
    }

    #[test]
    fn serde_snake_case() {
        let s = serde_json::to_string(&ClassStatus::MissedByStudent).unwrap();
        assert_eq!(s, "\"missed_by_student\"");
        assert_eq!(ClassStatus::MissedByStudent.to_string(), "missed_by_student");
    }

    #[test]
    fn report_window_uses_latest_deadline() {
        let mk = |ms| TimestampMs::try_from_i64(ms).unwrap();
        let class = Class {
            id: ClassId::from_u64(1),
            guardian: GuardianId::from_u64(1),
            teacher: TeacherId::from_u64(1),
            student: StudentId::from_u64(1),
            description: "lesson".to_owned(),
            scheduled_at: mk(1_000),
            duration_mins: 60,
            status: None,
            paid_by_guardian: false,
            hidden: false,
            report_deadline: Some(mk(2_000)),
            report_extension: Some(mk(5_000)),
            created_at: mk(500),
        };
        assert!(class.report_window_open(mk(3_000)));
        assert!(!class.report_window_open(mk(6_000)));
    }
}
