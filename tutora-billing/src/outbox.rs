//! Post-persist event buffering.
//!
//! Mutations append [`BillingEvent`]s to an [`Outbox`] while they run and
//! drain it to the [`NotificationSink`] only after the persistent write
//! succeeds. A crash before the drain leaves the invoice consistent and the
//! events lost; they are advisory. Delivery outcome is never awaited.

use tokio::sync::mpsc;
use tutora_core::ids::{ClassId, GuardianId, InvoiceId};

/// An event published to the notification / realtime-broadcast channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BillingEvent {
    InvoiceCreated { invoice: InvoiceId },
    InvoiceUpdated { invoice: InvoiceId },
    InvoicePaid { invoice: InvoiceId },
    InvoicePartiallyPaid { invoice: InvoiceId },
    InvoiceRefunded { invoice: InvoiceId },
    InvoiceDeleted { invoice: InvoiceId },
    InvoiceRestored { invoice: InvoiceId },
    InvoicePermanentlyDeleted { invoice: InvoiceId },
    StatsUpdated,
    /// A settled invoice lost a lesson and no replacement was available;
    /// an admin needs to look.
    ManualReviewRequired {
        invoice: InvoiceId,
        class: Option<ClassId>,
    },
    /// The zero-hour generator suppressed an invoice for this guardian.
    ZeroBalanceNoFutureClasses { guardian: GuardianId },
}

/// Fire-and-forget event posting. Implementations must not block.
pub trait NotificationSink: Send + Sync + 'static {
    fn post(&self, event: BillingEvent);
}

/// Discards all events.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn post(&self, _event: BillingEvent) {}
}

/// Forwards events into an unbounded channel; the receiving half typically
/// feeds the notification service and the realtime broadcast.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<BillingEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BillingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn post(&self, event: BillingEvent) {
        // Fire and forget: a closed receiver just drops the event.
        let _ = self.tx.send(event);
    }
}

/// The in-mutation event buffer.
#[derive(Default)]
pub struct Outbox {
    events: Vec<BillingEvent>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: BillingEvent) {
        self.events.push(event);
    }

    /// Emit all buffered events. Call only after the persistent write
    /// succeeded.
    pub fn drain_to(&mut self, sink: &dyn NotificationSink) {
        for event in self.events.drain(..) {
            sink.post(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tutora_core::ids::InvoiceId;

    #[test]
    fn drain_preserves_order_and_empties() {
        let (sink, mut rx) = ChannelSink::new();
        let mut outbox = Outbox::new();
        let inv = InvoiceId::from_u64(1);
        outbox.push(BillingEvent::InvoiceCreated { invoice: inv });
        outbox.push(BillingEvent::InvoicePaid { invoice: inv });

        outbox.drain_to(&sink);
        assert!(outbox.is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            BillingEvent::InvoiceCreated { invoice: inv }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            BillingEvent::InvoicePaid { invoice: inv }
        );
        assert!(rx.try_recv().is_err());
    }
}
