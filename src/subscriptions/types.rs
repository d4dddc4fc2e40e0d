//! Raw subscription types delivered by the engine.

use crate::error::StoreError;
use crate::event::ChangeEvent;
use crate::types::{EntityId, FieldSet, Object};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::Duration;

use super::manager::SubscriptionManager;

pub const KIND_INITIAL: &str = "initial";
pub const KIND_UPDATED: &str = "updated";
pub const KIND_DELETED: &str = "deleted";

/// Changed-field name a collection update carries when objects joined or
/// left the collection.
pub const MEMBERSHIP_FIELD: &str = "@membership";

/// Materialized value of a watched object or collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Snapshot {
    Object(Object),
    /// Members ordered by id.
    Collection(Vec<Object>),
}

impl Snapshot {
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Snapshot::Object(obj) => Some(obj),
            Snapshot::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&[Object]> {
        match self {
            Snapshot::Object(_) => None,
            Snapshot::Collection(items) => Some(items),
        }
    }

    pub fn into_object(self) -> Option<Object> {
        match self {
            Snapshot::Object(obj) => Some(obj),
            Snapshot::Collection(_) => None,
        }
    }

    pub fn into_collection(self) -> Option<Vec<Object>> {
        match self {
            Snapshot::Object(_) => None,
            Snapshot::Collection(items) => Some(items),
        }
    }
}

/// What a live query watches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Object { entity_type: String, id: EntityId },
    Collection { entity_type: String },
}

impl WatchTarget {
    pub fn entity_type(&self) -> &str {
        match self {
            WatchTarget::Object { entity_type, .. } | WatchTarget::Collection { entity_type } => {
                entity_type
            }
        }
    }
}

/// Change notification in the engine's native, runtime-tagged shape.
///
/// `kind` is free text; only `"initial"`, `"updated"` and `"deleted"` are
/// understood. Everything else classifies as [`ChangeEvent::Unknown`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawChangeEvent<T> {
    pub kind: String,
    pub snapshot: Option<T>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

impl<T> RawChangeEvent<T> {
    pub fn initial(snapshot: T) -> Self {
        Self {
            kind: KIND_INITIAL.to_string(),
            snapshot: Some(snapshot),
            changed_fields: Vec::new(),
        }
    }

    pub fn updated<I, S>(snapshot: T, changed_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: KIND_UPDATED.to_string(),
            snapshot: Some(snapshot),
            changed_fields: changed_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn deleted(last_known_value: Option<T>) -> Self {
        Self {
            kind: KIND_DELETED.to_string(),
            snapshot: last_known_value,
            changed_fields: Vec::new(),
        }
    }

    /// Classify into a [`ChangeEvent`], or explain why it can't be.
    pub fn decode(self) -> Result<ChangeEvent<T>, StoreError> {
        match (self.kind.as_str(), self.snapshot) {
            (KIND_INITIAL, Some(snapshot)) => Ok(ChangeEvent::Initial { snapshot }),
            (KIND_UPDATED, Some(snapshot)) => Ok(ChangeEvent::Updated {
                snapshot,
                changed_fields: self.changed_fields.into_iter().collect::<FieldSet>(),
            }),
            (KIND_DELETED, last_known_value) => Ok(ChangeEvent::Deleted { last_known_value }),
            (KIND_INITIAL, None) | (KIND_UPDATED, None) => Err(StoreError::SubscriptionDecode(
                format!("'{}' notification without a snapshot", self.kind),
            )),
            (other, _) => Err(StoreError::SubscriptionDecode(format!(
                "unrecognized change kind '{}'",
                other
            ))),
        }
    }

    /// Classify, mapping undecodable notifications to `Unknown`.
    pub fn classify(self) -> ChangeEvent<T> {
        self.decode().unwrap_or(ChangeEvent::Unknown)
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to a live-query subscription.
///
/// Dropping the handle, or calling [`RawSubscription::unsubscribe`], tears
/// down the engine-side subscription. The stream ends (`recv` returns an
/// error) once the engine closes the subscription.
pub struct RawSubscription<T = Snapshot> {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: Receiver<RawChangeEvent<T>>,
    manager: Option<Weak<SubscriptionManager>>,
}

impl<T> RawSubscription<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        receiver: Receiver<RawChangeEvent<T>>,
        manager: Weak<SubscriptionManager>,
    ) -> Self {
        Self {
            id,
            receiver,
            manager: Some(manager),
        }
    }

    /// Wrap a bare channel as a subscription with no engine behind it.
    pub fn from_receiver(receiver: Receiver<RawChangeEvent<T>>) -> Self {
        Self {
            id: SubscriptionId(0),
            receiver,
            manager: None,
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<RawChangeEvent<T>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<RawChangeEvent<T>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<RawChangeEvent<T>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Blocking iterator that ends when the subscription closes.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, RawChangeEvent<T>> {
        self.receiver.iter()
    }

    /// Stop receiving and release the engine-side subscription.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(manager) = self.manager.take().and_then(|weak| weak.upgrade()) {
            manager.unsubscribe(self.id);
        }
    }
}

impl<T> Drop for RawSubscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<'a, T> IntoIterator for &'a RawSubscription<T> {
    type Item = RawChangeEvent<T>;
    type IntoIter = crossbeam_channel::Iter<'a, RawChangeEvent<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.receiver.iter()
    }
}
