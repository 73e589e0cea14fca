//! Immutable audit records, stored out-of-line and keyed by invoice id.
//!
//! Audit entries never mutate; a rollback produces a new compensating entry
//! rather than rewriting history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ids::{ActorId, AuditId, InvoiceId},
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
pub enum AuditAction {
    Create,
    Update,
    ItemUpdate,
    CoverageUpdate,
    SnapshotUpdate,
    StatusChange,
    PaymentApplied,
    PaymentsReverted,
    Refund,
    Adjustment,
    Rollback,
    Send,
    Cancel,
    SoftDelete,
    Restore,
    PermanentDelete,
    Resequence,
    ManualReview,
}

/// Entries at `High` severity require admin attention (e.g. a deleted lesson
/// on a paid invoice with no replacement available).
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditSeverity {
    #[default]
    Normal,
    High,
}

/// Before/after values for one changed attribute.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

impl FieldDiff {
    pub fn new<B, A>(before: &B, after: &A) -> Self
    where
        B: Serialize,
        A: Serialize,
    {
        Self {
            before: serde_json::to_value(before)
                .unwrap_or(serde_json::Value::Null),
            after: serde_json::to_value(after)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// An immutable record of one action taken against an invoice.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub invoice: InvoiceId,
    pub actor: Option<ActorId>,
    pub action: AuditAction,
    /// Structured per-attribute diff, keyed by field path.
    #[serde(default)]
    pub diff: BTreeMap<String, FieldDiff>,
    /// Free-form context; e.g. `{"teacherId": "..."}` for tip entries.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Human-readable one-liner suitable for notifications.
    pub summary: Option<String>,
    #[serde(default)]
    pub severity: AuditSeverity,
    pub at: TimestampMs,
}

impl AuditEntry {
    pub fn new(
        id: AuditId,
        invoice: InvoiceId,
        actor: Option<ActorId>,
        action: AuditAction,
        at: TimestampMs,
    ) -> Self {
        Self {
            id,
            invoice,
            actor,
            action,
            diff: BTreeMap::new(),
            metadata: serde_json::Value::Null,
            summary: None,
            severity: AuditSeverity::Normal,
            at,
        }
    }

    pub fn with_diff(
        mut self,
        field: impl Into<String>,
        diff: FieldDiff,
    ) -> Self {
        self.diff.insert(field.into(), diff);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
