//! Classified change notifications.

use crate::types::FieldSet;
use serde::{Deserialize, Serialize};

/// What happened to a watched object or collection.
///
/// Consumers must match every variant; there is no catch-all kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent<T> {
    /// Baseline snapshot, delivered at most once and always first.
    Initial { snapshot: T },

    /// Fields of the watched object changed, or the watched collection's
    /// membership or order changed.
    Updated { snapshot: T, changed_fields: FieldSet },

    /// The watched object was removed. Collections never emit this; they
    /// emit `Updated` with an empty result instead.
    Deleted { last_known_value: Option<T> },

    /// The raw notification could not be classified.
    Unknown,
}

impl<T> ChangeEvent<T> {
    /// True when no further event can follow on the same subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeEvent::Deleted { .. })
    }

    /// Changed field names. Empty for everything but `Updated`.
    pub fn changed_field_names(&self) -> FieldSet {
        match self {
            ChangeEvent::Updated { changed_fields, .. } => changed_fields.clone(),
            ChangeEvent::Initial { .. } | ChangeEvent::Deleted { .. } | ChangeEvent::Unknown => {
                FieldSet::new()
            }
        }
    }

    /// The current value carried by the event, `None` after deletion.
    pub fn snapshot(&self) -> Option<&T> {
        match self {
            ChangeEvent::Initial { snapshot } | ChangeEvent::Updated { snapshot, .. } => {
                Some(snapshot)
            }
            ChangeEvent::Deleted { .. } | ChangeEvent::Unknown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Initial { .. } => "initial",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Deleted { .. } => "deleted",
            ChangeEvent::Unknown => "unknown",
        }
    }

    /// Transform the carried snapshots, keeping the event kind.
    pub fn map<U, F>(self, mut f: F) -> ChangeEvent<U>
    where
        F: FnMut(T) -> U,
    {
        match self {
            ChangeEvent::Initial { snapshot } => ChangeEvent::Initial {
                snapshot: f(snapshot),
            },
            ChangeEvent::Updated {
                snapshot,
                changed_fields,
            } => ChangeEvent::Updated {
                snapshot: f(snapshot),
                changed_fields,
            },
            ChangeEvent::Deleted { last_known_value } => ChangeEvent::Deleted {
                last_known_value: last_known_value.map(f),
            },
            ChangeEvent::Unknown => ChangeEvent::Unknown,
        }
    }
}
