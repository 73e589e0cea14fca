//! The persistent payment idempotency record.
//!
//! A [`PaymentRecord`] is inserted with [`PaymentState::Pending`] *before*
//! the invoice is mutated; the store's unique indexes on
//! (invoice, idempotency_key) and (invoice, transaction_id) make the insert
//! the exactly-once gate for payment application. A crash between insert and
//! mark-applied leaves a `Pending` record for the background reconciler.

use serde::{Deserialize, Serialize};

use crate::{
    amount::Amount,
    ids::{InvoiceId, PaymentId},
    invoice::{PaymentLogEntry, PaymentMethod},
    time::TimestampMs,
};

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Applied,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub invoice: InvoiceId,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub state: PaymentState,
    pub created_at: TimestampMs,
    pub applied_at: Option<TimestampMs>,
    /// Snapshot of the log entry this record produced, written at
    /// mark-applied time; replayed verbatim on duplicate requests.
    pub log_snapshot: Option<PaymentLogEntry>,
}

impl PaymentRecord {
    pub fn pending(
        id: PaymentId,
        invoice: InvoiceId,
        amount: Amount,
        method: PaymentMethod,
        transaction_id: Option<String>,
        idempotency_key: Option<String>,
        created_at: TimestampMs,
    ) -> Self {
        Self {
            id,
            invoice,
            amount,
            method,
            transaction_id,
            idempotency_key,
            state: PaymentState::Pending,
            created_at,
            applied_at: None,
            log_snapshot: None,
        }
    }

    pub fn mark_applied(
        &mut self,
        at: TimestampMs,
        log_snapshot: PaymentLogEntry,
    ) {
        self.state = PaymentState::Applied;
        self.applied_at = Some(at);
        self.log_snapshot = Some(log_snapshot);
    }
}
