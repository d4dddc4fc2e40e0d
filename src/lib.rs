//! # Livestore
//!
//! Live-query observation and lifecycle management over an embedded object
//! store.
//!
//! ## Core Concepts
//!
//! - **Store handle**: Owns one connection; initialize, reset, clear, close
//! - **Change events**: Closed classification of what happened to a watched value
//! - **Filters**: Drop events whose changed fields nobody cares about
//! - **Multiplexer**: One live query fanned out to several consumers
//!
//! ## Example
//!
//! ```ignore
//! use livestore::{EntityType, FilterConfig, ObjectInput, Schema, StoreConfig, StoreHandle};
//!
//! let schema = Schema::of([EntityType::new("Person").with_fields(["name", "age"])]);
//! let handle = StoreHandle::open(schema, Some(StoreConfig::at_path("./people")))?;
//!
//! let ada = handle.insert(ObjectInput::new("Person").with_field("name", "Ada"))?;
//!
//! // Only hear about renames
//! let mut mux = handle.watch_object(&ada, FilterConfig::default().watching(["name"]))?;
//! let events = mux.filtered();
//! std::thread::spawn(move || mux.run());
//!
//! // Wipe everything once other resets are done
//! let outcome = handle.reset(None, None).await;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod handle;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{MigrationPolicy, StoreConfig, ENCRYPTION_KEY_LEN};
pub use engine::{Database, ObjectChange, Transaction};
pub use error::{Result, StoreError};
pub use event::ChangeEvent;
pub use handle::{HandleState, ResetGuard, ResetOutcome, ResetPermit, StoreHandle};
pub use subscriptions::{
    filter, CallbackError, ChangeMultiplexer, CloseReason, EventCallback, FilterConfig, Filtered,
    Output, PollStatus, RawChangeEvent, RawSubscription, Snapshot, SubscriptionFilter,
    SubscriptionId, SubscriptionManager, WatchTarget, WatchedFields, MEMBERSHIP_FIELD,
};
pub use types::*;
