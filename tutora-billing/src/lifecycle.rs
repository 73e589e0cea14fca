//! The invoice state machine: the single authority for status transitions
//! and mutation locks.
//!
//! Callers describe what they are about to do with a [`Transition`] and get
//! back the target status, or a validation error naming the disallowed move.
//! Options that used to travel as ad-hoc scratch-pad flags on the aggregate
//! are an explicit [`InvoiceCommand`] instead.

use chrono::NaiveDate;
use tutora_core::{
    Error, Result,
    invoice::{Invoice, InvoiceStatus},
};

/// Options accompanying a mutation command.
#[derive(Clone, Copy, Debug, Default)]
pub struct InvoiceCommand {
    /// Skip automatic total recalculation (coverage updates on invoices
    /// with payments, unless preview totals are supplied).
    pub skip_recalculate: bool,
    /// Permit item mutation on a settled invoice. Only the refund /
    /// adjustment engine and the dispatcher set this.
    pub allow_paid_modification: bool,
    /// When adding a lesson that already sits on another unpaid invoice,
    /// move it instead of failing.
    pub transfer_on_duplicate: bool,
}

impl InvoiceCommand {
    pub fn paid_modification() -> Self {
        Self { allow_paid_modification: true, ..Self::default() }
    }
}

/// A proposed state transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    MarkSent,
    /// Due date passed while unpaid.
    OverdueTick,
    /// A payment settling the full remaining balance.
    PaymentFull,
    /// A payment leaving a balance outstanding.
    PaymentPartial,
    /// Revert all payments; the target depends on the due date and prior
    /// delivery, see [`revert_target`].
    RevertPayments { target: InvoiceStatus },
    /// All money returned.
    RefundFull,
    /// Money partially returned; status is unchanged.
    RefundPartial,
    Cancel,
}

/// Validate `transition` from `current`, returning the target status.
pub fn check_transition(
    current: InvoiceStatus,
    transition: Transition,
) -> Result<InvoiceStatus> {
    use InvoiceStatus::*;

    let disallowed = |t: &str| {
        Err(Error::validation(format!(
            "cannot {t} an invoice in status {current}"
        )))
    };

    match transition {
        Transition::MarkSent => match current {
            Draft | Pending => Ok(Sent),
            _ => disallowed("mark sent"),
        },
        Transition::OverdueTick => match current {
            Pending | Sent | PartiallyPaid => Ok(Overdue),
            _ => disallowed("mark overdue"),
        },
        Transition::PaymentFull => match current {
            Draft | Pending | Sent | Overdue | PartiallyPaid => Ok(Paid),
            _ => disallowed("apply a payment to"),
        },
        Transition::PaymentPartial => match current {
            Draft | Pending | Sent | Overdue | PartiallyPaid =>
                Ok(PartiallyPaid),
            _ => disallowed("apply a payment to"),
        },
        Transition::RevertPayments { target } => {
            match current {
                Paid | PartiallyPaid | Sent | Overdue => {}
                _ => return disallowed("revert payments on"),
            }
            match target {
                Pending | Sent | Overdue => Ok(target),
                _ => Err(Error::validation(format!(
                    "invalid revert target {target}"
                ))),
            }
        }
        Transition::RefundFull => match current {
            Paid | PartiallyPaid | Sent | Overdue => Ok(Refunded),
            _ => disallowed("refund"),
        },
        Transition::RefundPartial => match current {
            Paid | PartiallyPaid | Sent | Overdue => Ok(current),
            _ => disallowed("refund"),
        },
        Transition::Cancel => match current {
            Paid | Refunded => disallowed("cancel"),
            _ => Ok(Cancelled),
        },
    }
}

/// The status an invoice lands on when all payments are reverted: overdue if
/// the due date has passed, else sent if it was ever delivered, else
/// pending.
pub fn revert_target(invoice: &Invoice, today: NaiveDate) -> InvoiceStatus {
    let due_passed =
        invoice.due_date.is_some_and(|due| due < today);
    if due_passed {
        InvoiceStatus::Overdue
    } else if !invoice.delivery_log.is_empty() {
        InvoiceStatus::Sent
    } else {
        InvoiceStatus::Pending
    }
}

/// Guard for ordinary item mutation: allowed while unpaid, or on a settled
/// invoice only with [`InvoiceCommand::allow_paid_modification`].
pub fn ensure_items_mutable(
    invoice: &Invoice,
    command: &InvoiceCommand,
) -> Result<()> {
    if invoice.status.items_mutable() || command.allow_paid_modification {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "items are frozen in status {}",
            invoice.status
        )))
    }
}

#[cfg(test)]
mod test {
    use tutora_core::{
        invoice::InvoiceKind,
        test_utils::fixtures,
    };

    use super::*;
    use InvoiceStatus::*;

    #[test]
    fn payment_sources() {
        for src in [Draft, Pending, Sent, Overdue, PartiallyPaid] {
            assert_eq!(
                check_transition(src, Transition::PaymentFull).unwrap(),
                Paid
            );
            assert_eq!(
                check_transition(src, Transition::PaymentPartial).unwrap(),
                PartiallyPaid
            );
        }
        for src in [Paid, Refunded, Cancelled] {
            assert!(check_transition(src, Transition::PaymentFull).is_err());
        }
    }

    #[test]
    fn cancel_excludes_paid_and_refunded() {
        assert!(check_transition(Paid, Transition::Cancel).is_err());
        assert!(check_transition(Refunded, Transition::Cancel).is_err());
        assert_eq!(
            check_transition(Overdue, Transition::Cancel).unwrap(),
            Cancelled
        );
    }

    #[test]
    fn refund_full_vs_partial() {
        assert_eq!(
            check_transition(Paid, Transition::RefundFull).unwrap(),
            Refunded
        );
        assert_eq!(
            check_transition(PartiallyPaid, Transition::RefundPartial)
                .unwrap(),
            PartiallyPaid
        );
        assert!(check_transition(Draft, Transition::RefundFull).is_err());
    }

    #[test]
    fn revert_target_depends_on_due_date_and_delivery() {
        let mut invoice = fixtures::invoice(InvoiceKind::GuardianInvoice);
        invoice.due_date = Some(fixtures::date(2025, 1, 31));

        assert_eq!(
            revert_target(&invoice, fixtures::date(2025, 1, 20)),
            Pending
        );
        assert_eq!(
            revert_target(&invoice, fixtures::date(2025, 2, 1)),
            Overdue
        );

        invoice.record_delivery(tutora_core::invoice::DeliveryAttempt {
            channel: tutora_core::invoice::DeliveryChannel::Email,
            status: tutora_core::invoice::DeliveryStatus::Sent,
            template: "invoice".to_owned(),
            attempt: 1,
            message_hash: None,
            at: fixtures::ts(0),
        });
        assert_eq!(
            revert_target(&invoice, fixtures::date(2025, 1, 20)),
            Sent
        );
    }

    #[test]
    fn items_frozen_when_settled_without_flag() {
        let mut invoice = fixtures::invoice(InvoiceKind::GuardianInvoice);
        invoice.status = Paid;
        assert!(
            ensure_items_mutable(&invoice, &InvoiceCommand::default())
                .is_err()
        );
        assert!(
            ensure_items_mutable(
                &invoice,
                &InvoiceCommand::paid_modification()
            )
            .is_ok()
        );
    }
}
