//! The persistence abstraction the engine runs against.
//!
//! [`BillingStore`] models a document store: CRUD over the invoice, payment,
//! audit, class, and party collections, an atomic sequence counter per
//! invoice kind, and two unique compound indexes on the payment collection.
//! The engine never assumes multi-document transactions; where the store
//! supports them ([`BillingStore::supports_transactions`]) implementations
//! may group writes, but the exactly-once payment invariant must be
//! protected by the unique payment indexes alone.

use std::collections::HashSet;

use async_trait::async_trait;
use tutora_core::{
    Result,
    audit::AuditEntry,
    class::Class,
    ids::{AuditId, ClassId, GuardianId, InvoiceId, StudentId, TeacherId},
    invoice::{Invoice, InvoiceKind},
    party::{Guardian, Student, Teacher},
    payment::PaymentRecord,
};

use crate::query::InvoiceFilter;

/// Outcome of inserting a payment idempotency record.
#[derive(Clone, Debug)]
pub enum PaymentInsert {
    Inserted,
    /// A record with the same (invoice, idempotency_key) or
    /// (invoice, transaction_id) already exists; the conflicting record is
    /// returned so callers can replay its result.
    Duplicate(PaymentRecord),
}

#[async_trait]
pub trait BillingStore: Send + Sync + 'static {
    /// Whether this store can group writes in multi-document transactions.
    /// Callers must behave correctly either way; this only enables an
    /// optimization.
    fn supports_transactions(&self) -> bool {
        false
    }

    // --- Sequences --- //

    /// Atomically increment and fetch the sequence counter for `kind`.
    async fn next_sequence(&self, kind: InvoiceKind) -> Result<u64>;

    /// Advance the counter for `kind` to at least `floor`.
    async fn ensure_sequence_at_least(
        &self,
        kind: InvoiceKind,
        floor: u64,
    ) -> Result<()>;

    /// The last allocated sequence for `kind` (0 if none yet).
    async fn current_sequence(&self, kind: InvoiceKind) -> Result<u64>;

    // --- Invoices --- //

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<()>;

    /// Persist `invoice`, checking `invoice.version` against the stored
    /// document. On success the version is bumped in place; on mismatch
    /// returns [`Error::Conflict`].
    ///
    /// [`Error::Conflict`]: tutora_core::Error::Conflict
    async fn update_invoice(&self, invoice: &mut Invoice) -> Result<()>;

    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>>;

    async fn get_invoice_by_slug(&self, slug: &str)
    -> Result<Option<Invoice>>;

    /// All invoices matching `filter`, sorted and paginated per the filter.
    async fn list_invoices(&self, filter: &InvoiceFilter)
    -> Result<Vec<Invoice>>;

    /// Invoices whose items reference `class`, by class ref or by the
    /// denormalized lesson id.
    async fn invoices_containing_class(
        &self,
        class: ClassId,
    ) -> Result<Vec<Invoice>>;

    /// The union of class keys billed on any *active* (non-cancelled,
    /// non-refunded, non-deleted) invoice of `guardian`, optionally ignoring
    /// one invoice (used when re-selecting for that invoice).
    async fn billed_class_keys(
        &self,
        guardian: GuardianId,
        ignore: Option<InvoiceId>,
    ) -> Result<HashSet<ClassId>>;

    /// Permanently remove an invoice document.
    async fn delete_invoice(&self, id: InvoiceId) -> Result<()>;

    // --- Payments --- //

    /// Insert a payment record, enforcing the unique indexes on
    /// (invoice, idempotency_key) and (invoice, transaction_id).
    async fn insert_payment(
        &self,
        record: &PaymentRecord,
    ) -> Result<PaymentInsert>;

    async fn update_payment(&self, record: &PaymentRecord) -> Result<()>;

    async fn find_payment(
        &self,
        invoice: InvoiceId,
        idempotency_key: Option<&str>,
        transaction_id: Option<&str>,
    ) -> Result<Option<PaymentRecord>>;

    async fn payments_for_invoice(
        &self,
        invoice: InvoiceId,
    ) -> Result<Vec<PaymentRecord>>;

    // --- Audit --- //

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    async fn audits_for_invoice(
        &self,
        invoice: InvoiceId,
    ) -> Result<Vec<AuditEntry>>;

    async fn get_audit(&self, id: AuditId) -> Result<Option<AuditEntry>>;

    // --- Classes --- //

    async fn get_class(&self, id: ClassId) -> Result<Option<Class>>;

    async fn update_class(&self, class: &Class) -> Result<()>;

    async fn classes_for_guardian(
        &self,
        guardian: GuardianId,
    ) -> Result<Vec<Class>>;

    // --- Parties --- //

    async fn get_guardian(&self, id: GuardianId) -> Result<Option<Guardian>>;

    async fn update_guardian(&self, guardian: &Guardian) -> Result<()>;

    async fn list_guardian_ids(&self) -> Result<Vec<GuardianId>>;

    async fn get_teacher(&self, id: TeacherId) -> Result<Option<Teacher>>;

    async fn update_teacher(&self, teacher: &Teacher) -> Result<()>;

    async fn get_student(&self, id: StudentId) -> Result<Option<Student>>;

    async fn update_student(&self, student: &Student) -> Result<()>;
}
