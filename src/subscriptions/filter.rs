//! Filtering of raw change notifications.
//!
//! The admission predicate ([`FilterConfig::admits`]) is pure. The stateful
//! [`SubscriptionFilter`] adds the per-subscription ordering rules on top:
//! an `Initial` is only valid as the very first notification, and nothing is
//! delivered after a `Deleted`.

use crate::event::ChangeEvent;
use crate::types::FieldSet;
use std::marker::PhantomData;
use tracing::{trace, warn};

use super::types::RawChangeEvent;

/// Which field changes admit an `Updated` event.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum WatchedFields {
    /// Any non-empty change.
    #[default]
    All,
    /// Changes touching at least one of these fields. An empty set admits
    /// nothing.
    Only(FieldSet),
}

impl WatchedFields {
    pub fn only<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WatchedFields::Only(fields.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, changed: &FieldSet) -> bool {
        match self {
            WatchedFields::All => !changed.is_empty(),
            WatchedFields::Only(watched) => !watched.is_disjoint(changed),
        }
    }
}

/// Filter criteria for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FilterConfig {
    /// Admit the baseline snapshot. Default: false
    pub emit_initial: bool,

    pub watched_fields: WatchedFields,

    /// Label attached to diagnostics only.
    pub tag: String,
}

impl FilterConfig {
    /// Admit every kind of change, including the baseline snapshot.
    pub fn all() -> Self {
        Self {
            emit_initial: true,
            ..Default::default()
        }
    }

    pub fn with_initial(mut self, emit: bool) -> Self {
        self.emit_initial = emit;
        self
    }

    pub fn watching<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watched_fields = WatchedFields::only(fields);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Pure admission predicate.
    pub fn admits<T>(&self, event: &ChangeEvent<T>) -> bool {
        match event {
            ChangeEvent::Initial { .. } => self.emit_initial,
            ChangeEvent::Updated { changed_fields, .. } => {
                self.watched_fields.matches(changed_fields)
            }
            ChangeEvent::Deleted { .. } => true,
            ChangeEvent::Unknown => false,
        }
    }
}

/// Per-subscription filter state.
#[derive(Debug)]
pub struct SubscriptionFilter<T> {
    config: FilterConfig,
    seen_any: bool,
    terminated: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SubscriptionFilter<T> {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            seen_any: false,
            terminated: false,
            _marker: PhantomData,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// True once a `Deleted` was admitted.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Classify one raw notification and decide whether it passes.
    pub fn admit(&mut self, raw: RawChangeEvent<T>) -> Option<ChangeEvent<T>> {
        if self.terminated {
            trace!(tag = %self.config.tag, kind = %raw.kind, "event after terminal dropped");
            return None;
        }

        let first = !self.seen_any;
        self.seen_any = true;

        let event = match raw.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(tag = %self.config.tag, error = %e, "dropping undecodable change notification");
                return None;
            }
        };

        if matches!(event, ChangeEvent::Initial { .. }) && !first {
            warn!(tag = %self.config.tag, "dropping out-of-order initial notification");
            return None;
        }

        if !self.config.admits(&event) {
            trace!(tag = %self.config.tag, kind = event.kind(), "change filtered out");
            return None;
        }

        if event.is_terminal() {
            self.terminated = true;
        }
        Some(event)
    }
}

/// Iterator adapter produced by [`filter`].
pub struct Filtered<I, T> {
    inner: I,
    filter: SubscriptionFilter<T>,
}

impl<I, T> Filtered<I, T> {
    pub fn filter_state(&self) -> &SubscriptionFilter<T> {
        &self.filter
    }
}

impl<I, T> Iterator for Filtered<I, T>
where
    I: Iterator<Item = RawChangeEvent<T>>,
{
    type Item = ChangeEvent<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.filter.is_terminated() {
            let raw = self.inner.next()?;
            if let Some(event) = self.filter.admit(raw) {
                return Some(event);
            }
        }
        None
    }
}

/// Filter a stream of raw notifications, one event at a time, in order.
pub fn filter<I, T>(events: I, config: FilterConfig) -> Filtered<I::IntoIter, T>
where
    I: IntoIterator<Item = RawChangeEvent<T>>,
{
    Filtered {
        inner: events.into_iter(),
        filter: SubscriptionFilter::new(config),
    }
}
