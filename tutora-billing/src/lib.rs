//! The Tutora billing engine.
//!
//! Turns a stream of scheduled and completed lessons into guardian invoices,
//! applies payments and refunds, and keeps the invoice totals, guardian hour
//! balance, and teacher monthly ledgers mutually consistent under concurrent
//! modification.
//!
//! The top-level entrypoint is [`manager::BillingManager`]; everything else
//! is a component it wires together. All state lives behind the
//! [`traits::BillingStore`] abstraction; the engine itself holds no mutable
//! state beyond the [`context::BillingContext`] configuration set once at
//! start-up.

/// Invoice sequence numbers, canonical numbers, names, and slugs.
pub mod allocator;
/// The payment application pipeline.
pub mod apply;
/// Constructor-injected dependencies: store, clock, config, sink.
pub mod context;
/// Reacts to class create/update/delete events.
pub mod dispatcher;
/// The deterministic export snapshot consumed by document renderers.
pub mod export;
/// The invoice state machine: transitions, locks, commands.
pub mod lifecycle;
/// `BillingManager`, the top-level actor.
pub mod manager;
/// Post-persist event buffering.
pub mod outbox;
/// List filters, sorting, and dashboard aggregates.
pub mod query;
/// Money/hour reversal and post-payment adjustments.
pub mod refund;
/// Lesson eligibility selection.
pub mod selector;
/// Guardian financial snapshot freezing.
pub mod snapshot;
/// Store implementations.
pub mod store;
/// The `BillingStore` persistence abstraction.
pub mod traits;
/// Shared total/coverage recomputation.
pub mod totals;
/// The auto-payg follow-up generator.
pub mod zero_hours;
