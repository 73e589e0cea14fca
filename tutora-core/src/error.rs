//! The error taxonomy surfaced by every billing operation.
//!
//! Variants map one-to-one onto the wire error kinds returned by the API
//! layer; [`Error::kind_str`] gives the stable identifier. Internal failures
//! (store corruption, broken invariants) travel as [`Error::Store`] and are
//! the only variants that map to a 5xx.

use crate::ids::InvoiceId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller input failed validation: amount/hours mismatch, missing
    /// required fields, hours exceeding invoice scope, state disallowing the
    /// operation.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Optimistic version conflict during save; refetch and retry.
    #[error("write conflict, please retry")]
    Conflict,

    /// Adding the lesson would violate the one-lesson-one-invoice rule.
    #[error("lesson already billed on invoice {invoice_number}")]
    LessonAlreadyInvoiced {
        invoice_id: InvoiceId,
        invoice_number: String,
    },

    /// Payment attempted on a fully-paid invoice. Callers treat this as
    /// success with a `duplicate` marker.
    #[error("invoice is already settled")]
    AlreadySettled,

    #[error("invoice has no payments to revert")]
    NoPayments,

    /// The zero-hour generator found nothing to bill; the admin is notified
    /// rather than an error surfaced to the guardian.
    #[error("guardian has a zero balance and no future classes")]
    NoFutureClassesZeroBalance,

    /// Internal failure. Never retried automatically.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    /// The stable wire identifier for this error.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict => "conflict",
            Self::LessonAlreadyInvoiced { .. } => "lesson_already_invoiced",
            Self::AlreadySettled => "already_settled",
            Self::NoPayments => "no_payments",
            Self::NoFutureClassesZeroBalance =>
                "no_future_classes_zero_balance",
            Self::Store(_) => "internal_error",
        }
    }

    /// Whether a caller may retry the operation after a refetch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            Error::validation("bad").kind_str(),
            "validation_error"
        );
        assert_eq!(Error::Conflict.kind_str(), "conflict");
        assert_eq!(Error::AlreadySettled.kind_str(), "already_settled");
        assert_eq!(
            Error::NoFutureClassesZeroBalance.kind_str(),
            "no_future_classes_zero_balance"
        );
    }
}
