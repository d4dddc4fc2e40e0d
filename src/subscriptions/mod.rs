//! Live-query subscriptions and the layers that shape them.
//!
//! - The engine hands out [`RawSubscription`]s carrying [`RawChangeEvent`]s
//!   in its native, runtime-tagged shape.
//! - [`filter`] classifies those into [`ChangeEvent`](crate::ChangeEvent)s
//!   and drops what the [`FilterConfig`] does not want.
//! - [`ChangeMultiplexer`] fans one subscription out into a filtered event
//!   stream, a latest-value stream and a per-event callback.
//!
//! # Example
//!
//! ```ignore
//! let person = handle.insert(ObjectInput::new("Person").with_field("name", "Ada"))?;
//!
//! let mut mux = handle.watch_object(&person, FilterConfig::default().watching(["name"]))?;
//! let latest = mux.latest();
//! std::thread::spawn(move || mux.run());
//!
//! for value in latest.iter() {
//!     match value {
//!         Some(snapshot) => println!("now: {:?}", snapshot),
//!         None => println!("deleted"),
//!     }
//! }
//! ```

pub mod filter;
mod manager;
mod multiplexer;
mod types;

pub use filter::{filter, FilterConfig, Filtered, SubscriptionFilter, WatchedFields};
pub use manager::SubscriptionManager;
pub use multiplexer::{
    CallbackError, ChangeMultiplexer, CloseReason, EventCallback, Output, PollStatus,
};
pub use types::{
    RawChangeEvent, RawSubscription, Snapshot, SubscriptionId, WatchTarget, KIND_DELETED,
    KIND_INITIAL, KIND_UPDATED, MEMBERSHIP_FIELD,
};
