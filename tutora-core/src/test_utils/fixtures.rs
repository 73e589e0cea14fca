//! Fixture builders shared by unit and integration tests. All fixtures use
//! deterministic ids so assertions can name entities directly.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::{
    amount::Amount,
    class::{Class, ClassStatus},
    ids::{
        ActorId, ClassId, GuardianId, InvoiceId, StudentId, TeacherId,
    },
    invoice::{
        Coverage, FinancialSnapshot, Invoice, InvoiceKind, InvoiceStatus,
        LineItem, PersonSnapshot, TransferFee, TransferFeeMode,
        TransferFeeSource,
    },
    party::{Guardian, Student, Teacher},
    period::BillingPeriod,
    time::TimestampMs,
};

pub fn ts(ms: i64) -> TimestampMs {
    TimestampMs::try_from_i64(ms).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn person(name: &str) -> PersonSnapshot {
    PersonSnapshot {
        first_name: name.to_owned(),
        last_name: "Fixture".to_owned(),
        email: format!("{}@example.com", name.to_lowercase()),
    }
}

pub fn guardian(n: u64) -> Guardian {
    Guardian {
        id: GuardianId::from_u64(n),
        first_name: format!("Guardian{n}"),
        last_name: "Fixture".to_owned(),
        email: format!("guardian{n}@example.com"),
        hourly_rate: Amount::from_major(10),
        transfer_fee: None,
        preferred_payment_method: None,
        total_hours: Decimal::ZERO,
        consumed_hours: Decimal::ZERO,
        auto_total: false,
        min_lesson_mins: Some(30),
    }
}

pub fn teacher(n: u64) -> Teacher {
    Teacher {
        id: TeacherId::from_u64(n),
        first_name: format!("Teacher{n}"),
        last_name: "Fixture".to_owned(),
        email: format!("teacher{n}@example.com"),
        exclude_from_tips: false,
        months: Vec::new(),
    }
}

pub fn student(n: u64, guardian: GuardianId) -> Student {
    Student {
        id: StudentId::from_u64(n),
        guardian,
        first_name: format!("Student{n}"),
        last_name: "Fixture".to_owned(),
        email: format!("student{n}@example.com"),
        remaining_hours: Decimal::ZERO,
    }
}

/// A 60-minute class on 2025-01-15 at noon UTC, scheduled, unbilled.
pub fn class(n: u64, guardian: GuardianId) -> Class {
    Class {
        id: ClassId::from_u64(n),
        guardian,
        teacher: TeacherId::from_u64(1),
        student: StudentId::from_u64(1),
        description: format!("Lesson {n}"),
        scheduled_at: ts(1_736_942_400_000),
        duration_mins: 60,
        status: Some(ClassStatus::Scheduled),
        paid_by_guardian: false,
        hidden: false,
        report_deadline: None,
        report_extension: None,
        created_at: ts(1_736_000_000_000),
    }
}

pub fn line_item(class_id: ClassId) -> LineItem {
    let rate = Amount::from_major(10);
    LineItem {
        class: class_id,
        lesson_id: class_id.to_string(),
        student: StudentId::from_u64(1),
        student_snapshot: person("Student1"),
        teacher: TeacherId::from_u64(1),
        teacher_snapshot: person("Teacher1"),
        description: "Lesson".to_owned(),
        date: date(2025, 1, 15),
        duration_mins: 60,
        rate,
        amount: LineItem::compute_amount(rate, 60),
        attended: false,
        status: Some(ClassStatus::Scheduled),
        exclude_from_student_balance: false,
        exempt_from_guardian: false,
        exclude_from_teacher_payment: false,
    }
}

pub fn transfer_fee_fixed(value: Decimal) -> TransferFee {
    TransferFee {
        mode: TransferFeeMode::Fixed,
        value,
        amount: Amount::ZERO,
        source: TransferFeeSource::GuardianDefault,
        waived: false,
        waived_by_coverage: false,
    }
}

/// A pending January-2025 invoice with no items and a 10/hour snapshot.
pub fn invoice(kind: InvoiceKind) -> Invoice {
    Invoice {
        id: InvoiceId::from_u64(1),
        kind,
        sequence: 1,
        number: "INV-000001".to_owned(),
        name: "Invoice #1".to_owned(),
        manual_name: false,
        slug: "inv-000001-abcdef".to_owned(),
        guardian: Some(GuardianId::from_u64(1)),
        teacher: None,
        created_by: Some(ActorId::from_u64(1)),
        updated_by: None,
        period: BillingPeriod::for_month(2025, 1).unwrap(),
        items: Vec::new(),
        coverage: Coverage::full_period(),
        snapshot: FinancialSnapshot {
            hourly_rate: Amount::from_major(10),
            transfer_fee: transfer_fee_fixed(dec!(0)),
        },
        subtotal: Amount::ZERO,
        discount: Amount::ZERO,
        tax: Amount::ZERO,
        late_fee: Amount::ZERO,
        tip: Amount::ZERO,
        total: Amount::ZERO,
        adjusted_total: Amount::ZERO,
        paid_amount: Amount::ZERO,
        status: InvoiceStatus::Pending,
        due_date: Some(date(2025, 1, 31)),
        paid_at: None,
        created_at: ts(1_736_000_000_000),
        deleted_at: None,
        restored_at: None,
        restored_by: None,
        excluded_classes: Default::default(),
        payment_log: Vec::new(),
        activity_log: Vec::new(),
        delivery_log: Vec::new(),
        notes: None,
        version: 0,
    }
}
