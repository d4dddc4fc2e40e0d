//! Store lifecycle: initialize, reset, clear, close.
//!
//! A [`StoreHandle`] owns at most one open [`Database`] at a time and moves
//! through `Uninitialized -> Initialized -> Closed`. Resets and clears are
//! serialized against each other by a [`ResetGuard`]; ordinary reads and
//! writes only go through the engine's own transaction discipline.

use crate::config::StoreConfig;
use crate::engine::{Database, Transaction};
use crate::error::{Result, StoreError};
use crate::subscriptions::{ChangeMultiplexer, FilterConfig, RawSubscription, Snapshot};
use crate::types::{EntityId, Fields, Object, ObjectInput, Schema};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, error, info};

/// Lifecycle state of a [`StoreHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Uninitialized,
    Initialized,
    /// Terminal.
    Closed,
}

enum Connection {
    Uninitialized,
    Open(Arc<Database>),
    Closed,
}

/// Mutual exclusion for reset and clear.
#[derive(Default)]
pub struct ResetGuard {
    lock: AsyncMutex<()>,
}

/// Proof of holding the [`ResetGuard`]. Released on drop.
pub struct ResetPermit<'a> {
    _guard: AsyncMutexGuard<'a, ()>,
}

impl ResetGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait, without blocking the thread, until the guard is free.
    pub async fn acquire(&self) -> ResetPermit<'_> {
        ResetPermit {
            _guard: self.lock.lock().await,
        }
    }

    pub fn try_acquire(&self) -> Option<ResetPermit<'_>> {
        self.lock
            .try_lock()
            .ok()
            .map(|guard| ResetPermit { _guard: guard })
    }

    /// Block the current thread until the guard is free.
    ///
    /// Must not be called from inside an async runtime.
    fn blocking_acquire(&self) -> ResetPermit<'_> {
        ResetPermit {
            _guard: self.lock.blocking_lock(),
        }
    }
}

/// Result of a reset: `(success, removed_count, error)`.
#[derive(Debug)]
pub struct ResetOutcome {
    pub success: bool,
    pub removed_count: usize,
    pub error: Option<StoreError>,
}

impl ResetOutcome {
    pub fn succeeded(removed_count: usize) -> Self {
        Self {
            success: true,
            removed_count,
            error: None,
        }
    }

    pub fn failed(error: StoreError) -> Self {
        Self {
            success: false,
            removed_count: 0,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<usize> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.removed_count),
        }
    }
}

/// Owner of one store connection and its active schema.
pub struct StoreHandle {
    connection: RwLock<Connection>,
    reset_guard: ResetGuard,
}

impl StoreHandle {
    /// A handle with no connection yet.
    pub fn new() -> Self {
        Self {
            connection: RwLock::new(Connection::Uninitialized),
            reset_guard: ResetGuard::new(),
        }
    }

    /// Create a handle and initialize it in one step.
    pub fn open(schema: Schema, config: Option<StoreConfig>) -> Result<Self> {
        let handle = Self::new();
        handle.initialize(schema, config)?;
        Ok(handle)
    }

    pub fn state(&self) -> HandleState {
        match &*self.connection.read() {
            Connection::Uninitialized => HandleState::Uninitialized,
            Connection::Open(_) => HandleState::Initialized,
            Connection::Closed => HandleState::Closed,
        }
    }

    /// Open a connection for `schema`, replacing (and first closing) any
    /// current one. `None` uses the default in-memory configuration.
    ///
    /// If opening fails after an old connection was closed, the handle is
    /// left uninitialized.
    pub fn initialize(&self, schema: Schema, config: Option<StoreConfig>) -> Result<()> {
        let mut connection = self.connection.write();
        match &*connection {
            Connection::Closed => return Err(StoreError::Closed),
            Connection::Open(old) => {
                info!(instance = old.instance().0, "replacing open connection");
                old.close();
                *connection = Connection::Uninitialized;
            }
            Connection::Uninitialized => {}
        }

        let config = config.unwrap_or_default();
        let db = Database::open(config, schema).map_err(|e| {
            error!(error = %e, "failed to initialize store");
            e
        })?;
        info!(
            instance = db.instance().0,
            entity_types = db.schema().len(),
            "store initialized"
        );
        *connection = Connection::Open(Arc::new(db));
        Ok(())
    }

    /// The open connection.
    pub fn database(&self) -> Result<Arc<Database>> {
        match &*self.connection.read() {
            Connection::Open(db) => Ok(Arc::clone(db)),
            Connection::Uninitialized => Err(StoreError::NotInitialized),
            Connection::Closed => Err(StoreError::Closed),
        }
    }

    pub fn schema(&self) -> Result<Schema> {
        Ok(self.database()?.schema().clone())
    }

    pub fn config(&self) -> Result<StoreConfig> {
        Ok(self.database()?.config().clone())
    }

    /// Hold off every reset and clear until the permit is dropped.
    pub async fn lock_resets(&self) -> ResetPermit<'_> {
        self.reset_guard.acquire().await
    }

    /// Delete every object of the target entity types in one transaction.
    ///
    /// Waits for concurrent resets to finish first. `target` defaults to the
    /// active schema; an empty target succeeds without touching the store.
    /// A `config_override` pointing at the active connection's location
    /// resets the active connection and must otherwise equal the active
    /// configuration, or the reset fails with `Configuration`. Any other
    /// location is opened, reset and closed again.
    pub async fn reset(
        &self,
        target: Option<&Schema>,
        config_override: Option<StoreConfig>,
    ) -> ResetOutcome {
        let _permit = self.reset_guard.acquire().await;

        if target.map(Schema::is_empty).unwrap_or(false) {
            debug!("empty reset target, nothing to do");
            return ResetOutcome::succeeded(0);
        }

        let db = match self.database() {
            Ok(db) => db,
            Err(e) => return ResetOutcome::failed(e),
        };
        let target = target.cloned().unwrap_or_else(|| db.schema().clone());

        let result = match config_override {
            Some(config) if config.location() != db.config().location() => {
                drop(db);
                Self::reset_elsewhere(config, &target)
            }
            Some(config) if config != *db.config() => Err(StoreError::Configuration(
                "override at the active location differs from the active configuration".into(),
            )),
            _ => Self::delete_all_of(&db, &target),
        };

        match result {
            Ok(removed) => {
                info!(removed, entity_types = target.len(), "store reset");
                ResetOutcome::succeeded(removed)
            }
            Err(e) => {
                error!(error = %e, "store reset failed");
                ResetOutcome::failed(e)
            }
        }
    }

    /// Reset the whole active schema on the active connection.
    ///
    /// Meant for teardown: failures are logged, never propagated. Returns
    /// whether the clear happened. A failed clear deletes nothing.
    ///
    /// Inside an async runtime this does not wait for a running reset; it
    /// logs and gives up instead.
    pub fn clear(&self) -> bool {
        let _permit = if tokio::runtime::Handle::try_current().is_ok() {
            match self.reset_guard.try_acquire() {
                Some(permit) => permit,
                None => {
                    error!("clear skipped: a reset is in progress");
                    return false;
                }
            }
        } else {
            self.reset_guard.blocking_acquire()
        };

        let db = match self.database() {
            Ok(db) => db,
            Err(e) => {
                error!(error = %e, "clear failed");
                return false;
            }
        };

        let schema = db.schema().clone();
        match Self::delete_all_of(&db, &schema) {
            Ok(removed) => {
                debug!(removed, "store cleared");
                true
            }
            Err(e) => {
                error!(error = %e, "clear failed");
                false
            }
        }
    }

    /// Close the connection. Idempotent; the handle stays closed.
    pub fn close(&self) {
        let mut connection = self.connection.write();
        match std::mem::replace(&mut *connection, Connection::Closed) {
            Connection::Open(db) => {
                db.close();
                info!(instance = db.instance().0, "store closed");
            }
            Connection::Uninitialized => info!("store closed before initialization"),
            Connection::Closed => {}
        }
    }

    // --- CRUD helpers ---

    pub fn write<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.database()?.write(body)
    }

    pub fn insert(&self, input: ObjectInput) -> Result<Object> {
        self.write(|txn| txn.insert(input))
    }

    /// Insert several objects in one transaction.
    pub fn insert_all<I>(&self, inputs: I) -> Result<Vec<Object>>
    where
        I: IntoIterator<Item = ObjectInput>,
    {
        self.write(|txn| inputs.into_iter().map(|input| txn.insert(input)).collect())
    }

    pub fn get(&self, entity_type: &str, id: EntityId) -> Result<Option<Object>> {
        self.database()?.get(entity_type, id)
    }

    pub fn query(&self, entity_type: &str) -> Result<Vec<Object>> {
        self.database()?.query(entity_type)
    }

    pub fn query_where<P>(&self, entity_type: &str, predicate: P) -> Result<Vec<Object>>
    where
        P: Fn(&Object) -> bool,
    {
        self.database()?.query_where(entity_type, predicate)
    }

    pub fn find_first<P>(&self, entity_type: &str, predicate: P) -> Result<Option<Object>>
    where
        P: Fn(&Object) -> bool,
    {
        Ok(self.query_where(entity_type, predicate)?.into_iter().next())
    }

    pub fn count(&self, entity_type: &str) -> Result<usize> {
        self.database()?.count(entity_type)
    }

    /// Modify one managed object. Failures are logged; returns success.
    pub fn update<F>(&self, object: &Object, f: F) -> bool
    where
        F: FnOnce(&mut Fields),
    {
        match self.write(|txn| txn.update_object(object, f)) {
            Ok(_) => true,
            Err(e) => {
                error!(entity_type = %object.entity_type, id = %object.id, error = %e, "update failed");
                false
            }
        }
    }

    /// Modify every object of a type in one transaction. Failures are
    /// logged; returns success.
    pub fn update_all<F>(&self, entity_type: &str, mut f: F) -> bool
    where
        F: FnMut(&mut Fields),
    {
        let result = self.write(|txn| {
            for object in txn.query(entity_type)? {
                txn.update(entity_type, object.id, &mut f)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(entity_type, error = %e, "update_all failed");
                false
            }
        }
    }

    /// Remove one managed object. Returns false if it was already gone.
    pub fn delete(&self, object: &Object) -> Result<bool> {
        self.write(|txn| txn.delete_object(object))
    }

    pub fn delete_all(&self, entity_type: &str) -> Result<usize> {
        self.write(|txn| txn.delete_all(entity_type))
    }

    // --- Observation ---

    pub fn subscribe_object(&self, object: &Object) -> Result<RawSubscription> {
        self.database()?.subscribe_object(object)
    }

    pub fn subscribe_collection(&self, entity_type: &str) -> Result<RawSubscription> {
        self.database()?.subscribe_collection(entity_type)
    }

    /// Watch one object through a filter and multiplexer.
    pub fn watch_object(
        &self,
        object: &Object,
        config: FilterConfig,
    ) -> Result<ChangeMultiplexer<Snapshot>> {
        Ok(ChangeMultiplexer::attach(self.subscribe_object(object)?, config))
    }

    /// Watch every object of a type through a filter and multiplexer.
    pub fn watch_collection(
        &self,
        entity_type: &str,
        config: FilterConfig,
    ) -> Result<ChangeMultiplexer<Snapshot>> {
        Ok(ChangeMultiplexer::attach(
            self.subscribe_collection(entity_type)?,
            config,
        ))
    }

    // --- Private Helpers ---

    fn delete_all_of(db: &Database, target: &Schema) -> Result<usize> {
        db.write(|txn| {
            let mut removed = 0;
            for entity_type in target.iter() {
                removed += txn.delete_all(&entity_type.name)?;
            }
            Ok(removed)
        })
    }

    fn reset_elsewhere(config: StoreConfig, target: &Schema) -> Result<usize> {
        debug!(path = ?config.location(), "resetting a store other than the active one");
        let db = Database::open(config, target.clone())?;
        let removed = Self::delete_all_of(&db, target);
        db.close();
        removed
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityType;

    fn schema() -> Schema {
        Schema::of([EntityType::new("Person"), EntityType::new("Dog")])
    }

    #[test]
    fn test_state_transitions() {
        let handle = StoreHandle::new();
        assert_eq!(handle.state(), HandleState::Uninitialized);
        assert!(matches!(handle.database(), Err(StoreError::NotInitialized)));

        handle.initialize(schema(), None).unwrap();
        assert_eq!(handle.state(), HandleState::Initialized);

        handle.close();
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(matches!(
            handle.initialize(schema(), None),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn test_reinitialize_closes_previous() {
        let handle = StoreHandle::open(schema(), None).unwrap();
        let first = handle.database().unwrap();
        handle.insert(ObjectInput::new("Dog")).unwrap();

        handle.initialize(schema(), None).unwrap();
        assert!(first.is_closed());
        assert_eq!(handle.count("Dog").unwrap(), 0);
    }

    #[test]
    fn test_failed_initialize_leaves_uninitialized() {
        let handle = StoreHandle::open(schema(), None).unwrap();
        let result = handle.initialize(Schema::new(), None);
        assert!(matches!(result, Err(StoreError::Configuration(_))));
        assert_eq!(handle.state(), HandleState::Uninitialized);
    }

    #[test]
    fn test_clear_removes_everything() {
        let handle = StoreHandle::open(schema(), None).unwrap();
        handle
            .insert_all(vec![ObjectInput::new("Dog"), ObjectInput::new("Person")])
            .unwrap();

        assert!(handle.clear());
        assert_eq!(handle.count("Dog").unwrap(), 0);
        assert_eq!(handle.count("Person").unwrap(), 0);
    }

    #[test]
    fn test_clear_on_uninitialized_is_logged_not_raised() {
        let handle = StoreHandle::new();
        assert!(!handle.clear());
    }

    #[test]
    fn test_update_helpers_report_success() {
        let handle = StoreHandle::open(schema(), None).unwrap();
        let dog = handle.insert(ObjectInput::new("Dog").with_field("name", "Rex")).unwrap();

        assert!(handle.update(&dog, |fields| {
            fields.insert("name".into(), "Max".into());
        }));
        assert_eq!(
            handle.get("Dog", dog.id).unwrap().unwrap().get("name"),
            Some(&serde_json::json!("Max"))
        );

        handle.delete(&dog).unwrap();
        assert!(!handle.update(&dog, |_| {}));
    }

    #[test]
    fn test_update_all_is_atomic() {
        let handle = StoreHandle::open(
            Schema::of([EntityType::new("Person").with_fields(["name"])]),
            None,
        )
        .unwrap();
        handle
            .insert_all(vec![
                ObjectInput::new("Person").with_field("name", "Ada"),
                ObjectInput::new("Person").with_field("name", "Alan"),
            ])
            .unwrap();

        // "age" is undeclared: the whole update is rejected.
        assert!(!handle.update_all("Person", |fields| {
            fields.insert("age".into(), 1.into());
        }));
        assert!(handle
            .query("Person")
            .unwrap()
            .iter()
            .all(|p| p.get("age").is_none()));

        assert!(handle.update_all("Person", |fields| {
            fields.insert("name".into(), "anon".into());
        }));
        assert_eq!(
            handle
                .query_where("Person", |p| p.get("name") == Some(&"anon".into()))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_find_first() {
        let handle = StoreHandle::open(schema(), None).unwrap();
        handle
            .insert_all(vec![
                ObjectInput::new("Dog").with_field("name", "Rex"),
                ObjectInput::new("Dog").with_field("name", "Max"),
            ])
            .unwrap();

        let max = handle
            .find_first("Dog", |d| d.get("name") == Some(&"Max".into()))
            .unwrap()
            .unwrap();
        assert_eq!(max.get("name"), Some(&serde_json::json!("Max")));
        assert!(handle
            .find_first("Dog", |d| d.get("name").is_none())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reset_outcome_into_result() {
        assert_eq!(ResetOutcome::succeeded(3).into_result().unwrap(), 3);
        assert!(ResetOutcome::failed(StoreError::Closed).into_result().is_err());
    }
}
