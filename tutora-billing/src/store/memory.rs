//! An in-memory [`BillingStore`] with the same observable semantics as the
//! production document store: optimistic invoice versioning, unique payment
//! indexes, and atomic sequence counters. Supports serializing the entire
//! state, which the admin CLI uses for its state files.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tutora_core::{
    Error, Result,
    audit::AuditEntry,
    class::Class,
    ids::{AuditId, ClassId, GuardianId, InvoiceId, StudentId, TeacherId},
    invoice::{Invoice, InvoiceKind},
    party::{Guardian, Student, Teacher},
    payment::{PaymentRecord, PaymentState},
};

use crate::{
    query,
    traits::{BillingStore, PaymentInsert},
};

/// The complete persistent state, serializable as one JSON document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub invoices: BTreeMap<InvoiceId, Invoice>,
    #[serde(default)]
    pub payments: Vec<PaymentRecord>,
    #[serde(default)]
    pub audits: Vec<AuditEntry>,
    #[serde(default)]
    pub classes: BTreeMap<ClassId, Class>,
    #[serde(default)]
    pub guardians: BTreeMap<GuardianId, Guardian>,
    #[serde(default)]
    pub teachers: BTreeMap<TeacherId, Teacher>,
    #[serde(default)]
    pub students: BTreeMap<StudentId, Student>,
    #[serde(default)]
    pub sequences: BTreeMap<InvoiceKind, u64>,
}

pub struct MemoryStore {
    inner: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(StoreState::default()) }
    }

    pub fn from_state(state: StoreState) -> Self {
        Self { inner: RwLock::new(state) }
    }

    /// Clone the entire state, e.g. to write a CLI state file.
    pub async fn snapshot(&self) -> StoreState {
        self.inner.read().await.clone()
    }

    // --- Test/CLI seeding helpers --- //

    pub async fn put_class(&self, class: Class) {
        self.inner.write().await.classes.insert(class.id, class);
    }

    pub async fn put_guardian(&self, guardian: Guardian) {
        self.inner.write().await.guardians.insert(guardian.id, guardian);
    }

    pub async fn put_teacher(&self, teacher: Teacher) {
        self.inner.write().await.teachers.insert(teacher.id, teacher);
    }

    pub async fn put_student(&self, student: Student) {
        self.inner.write().await.students.insert(student.id, student);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn class_keys_of(invoice: &Invoice, out: &mut HashSet<ClassId>) {
    for item in &invoice.items {
        out.insert(item.class);
        if let Ok(parsed) = item.lesson_id.parse::<ClassId>() {
            out.insert(parsed);
        }
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    fn supports_transactions(&self) -> bool {
        false
    }

    // --- Sequences --- //

    async fn next_sequence(&self, kind: InvoiceKind) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let counter = inner.sequences.entry(kind).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn ensure_sequence_at_least(
        &self,
        kind: InvoiceKind,
        floor: u64,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let counter = inner.sequences.entry(kind).or_insert(0);
        *counter = (*counter).max(floor);
        Ok(())
    }

    async fn current_sequence(&self, kind: InvoiceKind) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.sequences.get(&kind).copied().unwrap_or(0))
    }

    // --- Invoices --- //

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.invoices.contains_key(&invoice.id) {
            return Err(Error::Conflict);
        }
        inner.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn update_invoice(&self, invoice: &mut Invoice) -> Result<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .invoices
            .get_mut(&invoice.id)
            .ok_or(Error::not_found("invoice"))?;
        if stored.version != invoice.version {
            return Err(Error::Conflict);
        }
        invoice.version += 1;
        *stored = invoice.clone();
        Ok(())
    }

    async fn get_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>> {
        let inner = self.inner.read().await;
        Ok(inner.invoices.get(&id).cloned())
    }

    async fn get_invoice_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<Invoice>> {
        let inner = self.inner.read().await;
        Ok(inner.invoices.values().find(|i| i.slug == slug).cloned())
    }

    async fn list_invoices(
        &self,
        filter: &query::InvoiceFilter,
    ) -> Result<Vec<Invoice>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Invoice> = inner
            .invoices
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        query::sort_and_page(&mut out, filter);
        Ok(out)
    }

    async fn invoices_containing_class(
        &self,
        class: ClassId,
    ) -> Result<Vec<Invoice>> {
        let inner = self.inner.read().await;
        Ok(inner
            .invoices
            .values()
            .filter(|i| i.contains_class(class))
            .cloned()
            .collect())
    }

    async fn billed_class_keys(
        &self,
        guardian: GuardianId,
        ignore: Option<InvoiceId>,
    ) -> Result<HashSet<ClassId>> {
        let inner = self.inner.read().await;
        let mut keys = HashSet::new();
        for invoice in inner.invoices.values() {
            if invoice.guardian != Some(guardian)
                || !invoice.active()
                || Some(invoice.id) == ignore
            {
                continue;
            }
            class_keys_of(invoice, &mut keys);
        }
        Ok(keys)
    }

    async fn delete_invoice(&self, id: InvoiceId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .invoices
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::not_found("invoice"))
    }

    // --- Payments --- //

    async fn insert_payment(
        &self,
        record: &PaymentRecord,
    ) -> Result<PaymentInsert> {
        let mut inner = self.inner.write().await;
        // The unique compound indexes: failed records do not hold the key.
        let conflict = inner.payments.iter().find(|existing| {
            if existing.invoice != record.invoice
                || existing.state == PaymentState::Failed
            {
                return false;
            }
            let key_clash = match (
                &existing.idempotency_key,
                &record.idempotency_key,
            ) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            let tx_clash = match (
                &existing.transaction_id,
                &record.transaction_id,
            ) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            key_clash || tx_clash
        });
        if let Some(existing) = conflict {
            return Ok(PaymentInsert::Duplicate(existing.clone()));
        }
        inner.payments.push(record.clone());
        Ok(PaymentInsert::Inserted)
    }

    async fn update_payment(&self, record: &PaymentRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.payments.iter_mut().find(|p| p.id == record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(Error::not_found("payment")),
        }
    }

    async fn find_payment(
        &self,
        invoice: InvoiceId,
        idempotency_key: Option<&str>,
        transaction_id: Option<&str>,
    ) -> Result<Option<PaymentRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .iter()
            .find(|p| {
                if p.invoice != invoice {
                    return false;
                }
                let key_match = matches!(
                    (idempotency_key, p.idempotency_key.as_deref()),
                    (Some(a), Some(b)) if a == b
                );
                let tx_match = matches!(
                    (transaction_id, p.transaction_id.as_deref()),
                    (Some(a), Some(b)) if a == b
                );
                key_match || tx_match
            })
            .cloned())
    }

    async fn payments_for_invoice(
        &self,
        invoice: InvoiceId,
    ) -> Result<Vec<PaymentRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .iter()
            .filter(|p| p.invoice == invoice)
            .cloned()
            .collect())
    }

    // --- Audit --- //

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.audits.push(entry.clone());
        Ok(())
    }

    async fn audits_for_invoice(
        &self,
        invoice: InvoiceId,
    ) -> Result<Vec<AuditEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .audits
            .iter()
            .filter(|a| a.invoice == invoice)
            .cloned()
            .collect())
    }

    async fn get_audit(&self, id: AuditId) -> Result<Option<AuditEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.audits.iter().find(|a| a.id == id).cloned())
    }

    // --- Classes --- //

    async fn get_class(&self, id: ClassId) -> Result<Option<Class>> {
        let inner = self.inner.read().await;
        Ok(inner.classes.get(&id).cloned())
    }

    async fn update_class(&self, class: &Class) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.classes.insert(class.id, class.clone());
        Ok(())
    }

    async fn classes_for_guardian(
        &self,
        guardian: GuardianId,
    ) -> Result<Vec<Class>> {
        let inner = self.inner.read().await;
        Ok(inner
            .classes
            .values()
            .filter(|c| c.guardian == guardian)
            .cloned()
            .collect())
    }

    // --- Parties --- //

    async fn get_guardian(&self, id: GuardianId) -> Result<Option<Guardian>> {
        let inner = self.inner.read().await;
        Ok(inner.guardians.get(&id).cloned())
    }

    async fn update_guardian(&self, guardian: &Guardian) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.guardians.insert(guardian.id, guardian.clone());
        Ok(())
    }

    async fn list_guardian_ids(&self) -> Result<Vec<GuardianId>> {
        let inner = self.inner.read().await;
        Ok(inner.guardians.keys().copied().collect())
    }

    async fn get_teacher(&self, id: TeacherId) -> Result<Option<Teacher>> {
        let inner = self.inner.read().await;
        Ok(inner.teachers.get(&id).cloned())
    }

    async fn update_teacher(&self, teacher: &Teacher) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.teachers.insert(teacher.id, teacher.clone());
        Ok(())
    }

    async fn get_student(&self, id: StudentId) -> Result<Option<Student>> {
        let inner = self.inner.read().await;
        Ok(inner.students.get(&id).cloned())
    }

    async fn update_student(&self, student: &Student) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.students.insert(student.id, student.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use tutora_core::{
        amount::Amount, invoice::PaymentMethod, test_utils::fixtures,
        time::TimestampMs,
    };

    use super::*;
    use tutora_core::ids::PaymentId;

    fn record(key: Option<&str>, tx: Option<&str>) -> PaymentRecord {
        PaymentRecord::pending(
            PaymentId::from_rng(&mut rand_core::OsRng),
            InvoiceId::from_u64(1),
            Amount::from_major(10),
            PaymentMethod::Manual,
            tx.map(str::to_owned),
            key.map(str::to_owned),
            TimestampMs::try_from_i64(0).unwrap(),
        )
    }

    #[tokio::test]
    async fn version_conflict_detected() {
        let store = MemoryStore::new();
        let invoice =
            fixtures::invoice(tutora_core::invoice::InvoiceKind::GuardianInvoice);
        store.insert_invoice(&invoice).await.unwrap();

        let mut copy_a = store.get_invoice(invoice.id).await.unwrap().unwrap();
        let mut copy_b = store.get_invoice(invoice.id).await.unwrap().unwrap();

        store.update_invoice(&mut copy_a).await.unwrap();
        assert_eq!(copy_a.version, 1);

        let err = store.update_invoice(&mut copy_b).await.unwrap_err();
        assert!(matches!(err, Error::Conflict));
    }

    #[tokio::test]
    async fn payment_unique_indexes() {
        let store = MemoryStore::new();
        let a = record(Some("key-1"), None);
        assert!(matches!(
            store.insert_payment(&a).await.unwrap(),
            PaymentInsert::Inserted
        ));

        // Same idempotency key clashes.
        let b = record(Some("key-1"), Some("tx-9"));
        assert!(matches!(
            store.insert_payment(&b).await.unwrap(),
            PaymentInsert::Duplicate(_)
        ));

        // A failed record releases the key.
        let mut failed = a.clone();
        failed.state = PaymentState::Failed;
        store.update_payment(&failed).await.unwrap();
        assert!(matches!(
            store.insert_payment(&b).await.unwrap(),
            PaymentInsert::Inserted
        ));

        // Distinct keys coexist.
        let c = record(Some("key-2"), None);
        assert!(matches!(
            store.insert_payment(&c).await.unwrap(),
            PaymentInsert::Inserted
        ));
    }

    #[tokio::test]
    async fn state_roundtrips_through_json() {
        let store = MemoryStore::new();
        store.put_guardian(fixtures::guardian(1)).await;
        store
            .put_class(fixtures::class(1, fixtures::guardian(1).id))
            .await;
        store
            .insert_invoice(&fixtures::invoice(
                tutora_core::invoice::InvoiceKind::GuardianInvoice,
            ))
            .await
            .unwrap();

        let state = store.snapshot().await;
        let json = serde_json::to_string(&state).unwrap();
        let restored: StoreState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.invoices.len(), 1);
        assert_eq!(restored.guardians.len(), 1);
        assert_eq!(restored.classes.len(), 1);
    }
}
