//! Core value types for the Tutora billing engine.
//!
//! This crate holds the persisted data model (invoices, line items, payment
//! logs, audit entries, class and party projections) plus the money, hour,
//! time, and id newtypes they are built from. It contains no I/O; everything
//! here is plain data with invariants enforced at construction.

/// Currency amounts.
pub mod amount;
/// Immutable audit records.
pub mod audit;
/// The class (lesson) projection consumed by the billing engine.
pub mod class;
/// The error taxonomy surfaced by every billing operation.
pub mod error;
/// Hour quantities.
pub mod hours;
/// Byte-array id newtypes.
pub mod ids;
/// The invoice aggregate and its embedded documents.
pub mod invoice;
/// Guardian, teacher, and student ledger projections.
pub mod party;
/// Persistent payment idempotency records.
pub mod payment;
/// Billing period calendar windows.
pub mod period;
/// Unix-epoch millisecond timestamps.
pub mod time;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{Error, Result};
