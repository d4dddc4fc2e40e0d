//! Subscription manager for broadcasting committed changes.

use crate::engine::ObjectChange;
use crate::types::{FieldSet, Object};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{
    RawChangeEvent, RawSubscription, Snapshot, SubscriptionId, WatchTarget, MEMBERSHIP_FIELD,
};

/// Default max buffered events per subscriber.
const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Internal subscription state.
struct Subscription {
    target: WatchTarget,
    sender: Sender<RawChangeEvent<Snapshot>>,
}

impl Subscription {
    /// Try to send an event. Returns false if the subscriber must be dropped.
    fn try_send(&self, event: RawChangeEvent<Snapshot>) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Outcome of delivering one commit to one subscriber.
enum Delivery {
    Skipped,
    Sent,
    /// Sent a terminal event; remove afterwards.
    Finished,
    Failed,
}

/// Manages live-query subscriptions and broadcasts committed changes.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    buffer_size: usize,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Register a subscription and deliver its first event.
    ///
    /// The caller must hold whatever lock keeps commits out, so that nothing
    /// is broadcast between computing `first` and registering.
    pub fn subscribe(
        self: &Arc<Self>,
        target: WatchTarget,
        first: RawChangeEvent<Snapshot>,
    ) -> RawSubscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);
        let terminal = first.kind == super::types::KIND_DELETED;

        let subscription = Subscription { target, sender };
        if subscription.try_send(first) && !terminal {
            self.subscriptions.write().insert(id, subscription);
        }

        RawSubscription::new(id, receiver, Arc::downgrade(self))
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscriptions.write().remove(&id).is_some() {
            debug!(subscription = id.0, "unsubscribed");
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Drop every subscriber; their streams end once drained.
    pub fn close_all(&self) {
        let mut subs = self.subscriptions.write();
        if !subs.is_empty() {
            debug!(count = subs.len(), "closing subscriptions");
        }
        subs.clear();
    }

    // --- Broadcasting ---

    /// Deliver one committed transaction to every affected subscriber.
    ///
    /// `collection` returns the committed members of an entity type, ordered
    /// by id.
    pub fn broadcast_commit<F>(&self, changes: &[ObjectChange], collection: F)
    where
        F: Fn(&str) -> Vec<Object>,
    {
        if changes.is_empty() {
            return;
        }

        let mut to_remove = Vec::new();
        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                let delivery = match &sub.target {
                    WatchTarget::Object { entity_type, id } => {
                        Self::deliver_object(sub, entity_type, *id, changes)
                    }
                    WatchTarget::Collection { entity_type } => {
                        Self::deliver_collection(sub, entity_type, changes, &collection)
                    }
                };
                match delivery {
                    Delivery::Skipped | Delivery::Sent => {}
                    Delivery::Finished => to_remove.push(*id),
                    Delivery::Failed => {
                        warn!(subscription = id.0, "dropping slow or disconnected subscriber");
                        to_remove.push(*id);
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                subs.remove(&id);
            }
        }
    }

    fn deliver_object(
        sub: &Subscription,
        entity_type: &str,
        id: crate::types::EntityId,
        changes: &[ObjectChange],
    ) -> Delivery {
        let change = changes
            .iter()
            .find(|c| c.entity_type() == entity_type && c.id() == id);

        match change {
            None | Some(ObjectChange::Inserted(_)) => Delivery::Skipped,
            Some(ObjectChange::Modified { after, fields, .. }) => {
                let event = RawChangeEvent::updated(
                    Snapshot::Object(after.clone()),
                    fields.iter().cloned(),
                );
                if sub.try_send(event) {
                    Delivery::Sent
                } else {
                    Delivery::Failed
                }
            }
            Some(ObjectChange::Deleted(last)) => {
                let event = RawChangeEvent::deleted(Some(Snapshot::Object(last.clone())));
                if sub.try_send(event) {
                    Delivery::Finished
                } else {
                    Delivery::Failed
                }
            }
        }
    }

    fn deliver_collection<F>(
        sub: &Subscription,
        entity_type: &str,
        changes: &[ObjectChange],
        collection: &F,
    ) -> Delivery
    where
        F: Fn(&str) -> Vec<Object>,
    {
        let mut fields = FieldSet::new();
        let mut touched = false;
        for change in changes.iter().filter(|c| c.entity_type() == entity_type) {
            touched = true;
            if !matches!(change, ObjectChange::Modified { .. }) {
                fields.insert(MEMBERSHIP_FIELD.to_string());
            }
            fields.extend(change.changed_fields());
        }
        if !touched {
            return Delivery::Skipped;
        }

        let event = RawChangeEvent::updated(Snapshot::Collection(collection(entity_type)), fields);
        if sub.try_send(event) {
            Delivery::Sent
        } else {
            Delivery::Failed
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
