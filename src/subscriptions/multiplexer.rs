//! Fan-out of one live-query subscription into several consumer shapes.
//!
//! A [`ChangeMultiplexer`] owns exactly one [`RawSubscription`] and derives
//! every output from its filtered event sequence:
//!
//! - `filtered`: the admitted [`ChangeEvent`]s,
//! - `latest`: the current value after each admitted event (`None` once
//!   deleted),
//! - `on_event`: a callback run for each admitted event before it is
//!   published anywhere.
//!
//! The multiplexer owns no thread. The caller drives it with
//! [`ChangeMultiplexer::poll`] or [`ChangeMultiplexer::run`] from a thread of
//! its choosing. Once every handed-out [`Output`] (and all its clones) is
//! dropped, the multiplexer closes and releases the store subscription.

use crate::event::ChangeEvent;
use crate::types::FieldSet;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error};

use super::filter::{FilterConfig, SubscriptionFilter};
use super::types::{RawChangeEvent, RawSubscription};

/// How often a blocked [`ChangeMultiplexer::run`] rechecks its consumers.
const CONSUMER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Error type callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Side-effect hook: `(snapshot, changed_fields)`. The snapshot is `None`
/// for deletions.
pub type EventCallback<T> =
    Box<dyn FnMut(Option<&T>, &FieldSet) -> Result<(), CallbackError> + Send>;

/// Result of a non-blocking [`ChangeMultiplexer::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Still attached; this many raw events were processed.
    Open(usize),
    /// All outputs are closed.
    Closed,
}

/// Why the multiplexer closed its outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The underlying subscription ended (store closed or subscriber dropped).
    SourceClosed,
    /// The watched object was deleted.
    Terminal,
    /// Every output receiver was dropped.
    Unsubscribed,
    /// [`ChangeMultiplexer::close`] was called.
    Closed,
}

/// Receiving end of one multiplexer output.
///
/// Derefs to a [`Receiver`]. Clones count as the same consumer.
#[derive(Debug)]
pub struct Output<U> {
    receiver: Receiver<U>,
    _alive: Arc<()>,
}

impl<U> Clone for Output<U> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            _alive: Arc::clone(&self._alive),
        }
    }
}

impl<U> Deref for Output<U> {
    type Target = Receiver<U>;

    fn deref(&self) -> &Receiver<U> {
        &self.receiver
    }
}

impl<'a, U> IntoIterator for &'a Output<U> {
    type Item = U;
    type IntoIter = crossbeam_channel::Iter<'a, U>;

    fn into_iter(self) -> Self::IntoIter {
        self.receiver.iter()
    }
}

/// Sending side of one output, with a handle on whether anyone still listens.
struct Outlet<U> {
    sender: Sender<U>,
    alive: Weak<()>,
}

impl<U> Outlet<U> {
    fn open() -> (Self, Output<U>) {
        let (sender, receiver) = unbounded();
        let token = Arc::new(());
        let outlet = Outlet {
            sender,
            alive: Arc::downgrade(&token),
        };
        (
            outlet,
            Output {
                receiver,
                _alive: token,
            },
        )
    }

    fn is_listening(&self) -> bool {
        self.alive.strong_count() > 0
    }

    fn send(&self, value: U) -> bool {
        self.is_listening() && self.sender.send(value).is_ok()
    }
}

pub struct ChangeMultiplexer<T> {
    source: Option<RawSubscription<T>>,
    filter: SubscriptionFilter<T>,
    filtered_outlets: Vec<Outlet<ChangeEvent<T>>>,
    latest_outlets: Vec<Outlet<Option<T>>>,
    /// Set once any output was handed out.
    has_outputs: bool,
    on_event: Option<EventCallback<T>>,
    latest: Option<T>,
    close_reason: Option<CloseReason>,
}

impl<T: Clone> ChangeMultiplexer<T> {
    /// Wrap one subscription. No additional subscriptions are ever created.
    pub fn attach(subscription: RawSubscription<T>, config: FilterConfig) -> Self {
        Self {
            source: Some(subscription),
            filter: SubscriptionFilter::new(config),
            filtered_outlets: Vec::new(),
            latest_outlets: Vec::new(),
            has_outputs: false,
            on_event: None,
            latest: None,
            close_reason: None,
        }
    }

    /// Install the per-event callback.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Option<&T>, &FieldSet) -> Result<(), CallbackError> + Send + 'static,
    {
        self.on_event = Some(Box::new(callback));
        self
    }

    /// A new receiver of admitted events. Every receiver sees every event.
    pub fn filtered(&mut self) -> Output<ChangeEvent<T>> {
        let (outlet, output) = Outlet::open();
        if self.close_reason.is_none() {
            self.filtered_outlets.push(outlet);
            self.has_outputs = true;
        }
        output
    }

    /// A new receiver of latest values.
    pub fn latest(&mut self) -> Output<Option<T>> {
        let (outlet, output) = Outlet::open();
        if self.close_reason.is_none() {
            self.latest_outlets.push(outlet);
            self.has_outputs = true;
        }
        output
    }

    /// Value after the most recent admitted event.
    pub fn latest_value(&self) -> Option<&T> {
        self.latest.as_ref()
    }

    pub fn config(&self) -> &FilterConfig {
        self.filter.config()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Process every raw event available right now without blocking.
    pub fn poll(&mut self) -> PollStatus {
        let mut processed = 0;
        loop {
            self.release_if_abandoned();
            if self.is_closed() {
                return PollStatus::Closed;
            }
            let next = match &self.source {
                Some(source) => source.try_recv(),
                None => Err(TryRecvError::Disconnected),
            };
            match next {
                Ok(raw) => {
                    processed += 1;
                    self.process(raw);
                }
                Err(TryRecvError::Empty) => return PollStatus::Open(processed),
                Err(TryRecvError::Disconnected) => {
                    self.shutdown(CloseReason::SourceClosed);
                    return PollStatus::Closed;
                }
            }
        }
    }

    /// Block, processing events until the outputs close.
    pub fn run(&mut self) -> CloseReason {
        loop {
            self.release_if_abandoned();
            if self.is_closed() {
                break;
            }
            let next = match &self.source {
                Some(source) => source.recv_timeout(CONSUMER_CHECK_INTERVAL),
                None => Err(RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(raw) => self.process(raw),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.shutdown(CloseReason::SourceClosed),
            }
        }
        self.close_reason.unwrap_or(CloseReason::Closed)
    }

    /// Close every output and release the underlying subscription.
    pub fn close(&mut self) {
        self.shutdown(CloseReason::Closed);
    }

    fn process(&mut self, raw: RawChangeEvent<T>) {
        let Some(event) = self.filter.admit(raw) else {
            return;
        };

        let snapshot = event.snapshot().cloned();
        let changed_fields = event.changed_field_names();

        if let Some(callback) = self.on_event.as_mut() {
            let tag = &self.filter.config().tag;
            match catch_unwind(AssertUnwindSafe(|| callback(snapshot.as_ref(), &changed_fields))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(tag = %tag, error = %e, "change callback failed"),
                Err(_) => error!(tag = %tag, "change callback panicked"),
            }
        }

        let terminal = event.is_terminal();
        self.latest = snapshot.clone();
        self.filtered_outlets.retain(|out| out.send(event.clone()));
        self.latest_outlets.retain(|out| out.send(snapshot.clone()));

        if terminal {
            self.shutdown(CloseReason::Terminal);
        }
    }

    /// Close once outputs were handed out and every one has been dropped.
    fn release_if_abandoned(&mut self) {
        if !self.has_outputs || self.is_closed() {
            return;
        }
        self.filtered_outlets.retain(Outlet::is_listening);
        self.latest_outlets.retain(Outlet::is_listening);
        if self.filtered_outlets.is_empty() && self.latest_outlets.is_empty() {
            self.shutdown(CloseReason::Unsubscribed);
        }
    }

    fn shutdown(&mut self, reason: CloseReason) {
        if self.close_reason.is_some() {
            return;
        }
        debug!(tag = %self.filter.config().tag, ?reason, "multiplexer closed");
        self.close_reason = Some(reason);
        self.filtered_outlets.clear();
        self.latest_outlets.clear();
        if let Some(source) = self.source.take() {
            source.unsubscribe();
        }
    }
}
