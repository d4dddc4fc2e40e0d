//! Embedded object engine.
//!
//! [`Database`] is one open connection: a schema, the committed objects of
//! that schema, serialized write transactions, and the live-query
//! subscriptions fed by each commit. Path-backed connections persist every
//! commit; in-memory connections vanish on close.

mod persist;
mod transaction;

pub use transaction::{ObjectChange, Transaction};

use crate::config::{MigrationPolicy, StoreConfig};
use crate::error::{Result, StoreError};
use crate::subscriptions::{
    RawChangeEvent, RawSubscription, Snapshot, SubscriptionManager, WatchTarget,
};
use crate::types::{EntityId, EntityType, InstanceId, Object, Schema};
use parking_lot::{Mutex, RwLock};
use persist::{DataFile, Manifest, StoreFiles};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use transaction::Tables;

/// One open connection to the object engine.
pub struct Database {
    instance: InstanceId,
    config: StoreConfig,
    schema: Schema,

    /// Committed state. Replaced wholesale on commit.
    state: RwLock<Tables>,

    /// Serializes write transactions and subscription registration.
    write_lock: Mutex<()>,

    subscriptions: Arc<SubscriptionManager>,

    /// `None` for in-memory connections and after close.
    files: Mutex<Option<StoreFiles>>,

    closed: AtomicBool,
}

impl Database {
    /// Open a connection for `schema` under `config`.
    ///
    /// Fails with [`StoreError::Configuration`] for an empty schema, an
    /// invalid config, or an encryption key that does not match the stored
    /// one, and with [`StoreError::Migration`] when the stored schema
    /// version differs and the config does not allow migrating.
    pub fn open(config: StoreConfig, schema: Schema) -> Result<Self> {
        config.validate()?;
        if schema.is_empty() {
            return Err(StoreError::Configuration(
                "schema must contain at least one entity type".into(),
            ));
        }

        let instance = InstanceId::next();
        let (files, data) = match config.location() {
            None => (None, DataFile::default()),
            Some(dir) => {
                let files = StoreFiles::open(dir)?;
                let data = Self::prepare_files(&files, &config, &schema)?;
                (Some(files), data)
            }
        };

        let mut state = Tables {
            next_id: data.next_id,
            ..Default::default()
        };
        for object in data.objects {
            let table = state.tables.entry(object.entity_type.clone()).or_default();
            Arc::make_mut(table).insert(object.id, object.bound_to(instance));
        }

        info!(
            instance = instance.0,
            path = ?config.location(),
            schema_version = config.schema_version,
            objects = state.object_count(),
            "connection opened"
        );

        Ok(Self {
            instance,
            subscriptions: Arc::new(SubscriptionManager::with_buffer_size(
                config.subscription_buffer,
            )),
            config,
            schema,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            files: Mutex::new(files),
            closed: AtomicBool::new(false),
        })
    }

    /// Verify the manifest against `config`, apply the migration policy and
    /// load committed data.
    fn prepare_files(files: &StoreFiles, config: &StoreConfig, schema: &Schema) -> Result<DataFile> {
        let manifest = files.read_manifest()?;
        let mut data = files.read_data()?.unwrap_or_default();
        let mut rewrite_data = false;

        match &manifest {
            None if !data.objects.is_empty() => {
                return Err(StoreError::Corruption("data file without manifest".into()));
            }
            None => {}
            Some(stored) => {
                if stored.key_fingerprint != config.key_fingerprint() {
                    return Err(StoreError::Configuration(
                        "encryption key does not match the stored file".into(),
                    ));
                }

                if stored.schema_version != config.schema_version {
                    let mismatch = StoreError::Migration {
                        stored: stored.schema_version,
                        requested: config.schema_version,
                    };
                    match config.migration {
                        MigrationPolicy::Reject => return Err(mismatch),
                        MigrationPolicy::Migrate if config.schema_version < stored.schema_version => {
                            return Err(mismatch);
                        }
                        MigrationPolicy::Migrate => {
                            let stored_schema =
                                Schema::of(stored.entity_types.iter().map(EntityType::new));
                            let removed_types = stored_schema.missing_from(schema);
                            let before = data.objects.len();
                            data.objects.retain(|o| schema.contains(&o.entity_type));
                            info!(
                                from = stored.schema_version,
                                to = config.schema_version,
                                removed_types = ?removed_types,
                                dropped = before - data.objects.len(),
                                "migrated schema"
                            );
                        }
                        MigrationPolicy::DeleteIfNeeded => {
                            warn!(
                                from = stored.schema_version,
                                to = config.schema_version,
                                "schema version changed, deleting stored data"
                            );
                            data = DataFile::default();
                        }
                    }
                    rewrite_data = true;
                }
            }
        }

        let new_manifest = Manifest {
            schema_version: config.schema_version,
            key_fingerprint: config.key_fingerprint(),
            entity_types: schema.names().map(str::to_string).collect(),
        };
        if manifest.as_ref() != Some(&new_manifest) {
            files.write_manifest(&new_manifest)?;
        }
        if rewrite_data {
            files.write_data(&data, config.max_file_size)?;
        }
        Ok(data)
    }

    /// Close the connection. Idempotent.
    ///
    /// Waits for an in-flight write, then ends every subscription and
    /// releases the store lock.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _lock = self.write_lock.lock();
        self.subscriptions.close_all();
        self.files.lock().take();
        info!(instance = self.instance.0, "connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Store directory, if path-backed.
    pub fn path(&self) -> Option<&Path> {
        self.config.location()
    }

    // --- Writes ---

    /// Run `body` as one atomic transaction.
    ///
    /// `Ok` commits every change, persists it and notifies subscribers;
    /// `Err` discards every change. Transactions are serialized; do not open
    /// a subscription or a nested transaction from inside `body`.
    pub fn write<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.ensure_open()?;
        let _lock = self.write_lock.lock();
        self.ensure_open()?;

        let base = self.state.read().clone();
        let mut txn = Transaction::new(&self.schema, self.instance, base.clone());
        let value = match body(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "transaction rolled back");
                return Err(e);
            }
        };

        let (next, changes) = txn.finish(&base);
        if changes.is_empty() && next.next_id == base.next_id {
            return Ok(value);
        }

        if let Some(files) = self.files.lock().as_ref() {
            files
                .write_data(&Self::data_file(&next), self.config.max_file_size)
                .map_err(|e| match e {
                    StoreError::Transaction(_) => e,
                    other => StoreError::Transaction(format!("commit failed: {}", other)),
                })?;
        }

        *self.state.write() = next;
        debug!(changes = changes.len(), "transaction committed");

        let state = self.state.read();
        self.subscriptions
            .broadcast_commit(&changes, |entity_type| state.collection(entity_type));
        Ok(value)
    }

    // --- Reads ---

    pub fn get(&self, entity_type: &str, id: EntityId) -> Result<Option<Object>> {
        self.check_readable(entity_type)?;
        Ok(self
            .state
            .read()
            .table(entity_type)
            .and_then(|t| t.get(&id))
            .cloned())
    }

    /// Every object of a type, ordered by id.
    pub fn query(&self, entity_type: &str) -> Result<Vec<Object>> {
        self.check_readable(entity_type)?;
        Ok(self.state.read().collection(entity_type))
    }

    pub fn query_where<P>(&self, entity_type: &str, predicate: P) -> Result<Vec<Object>>
    where
        P: Fn(&Object) -> bool,
    {
        self.check_readable(entity_type)?;
        let state = self.state.read();
        Ok(state
            .table(entity_type)
            .map(|t| t.values().filter(|o| predicate(o)).cloned().collect())
            .unwrap_or_default())
    }

    pub fn count(&self, entity_type: &str) -> Result<usize> {
        self.check_readable(entity_type)?;
        Ok(self
            .state
            .read()
            .table(entity_type)
            .map(|t| t.len())
            .unwrap_or(0))
    }

    // --- Live queries ---

    /// Watch one managed object. The first event is `initial`, or `deleted`
    /// if the object no longer exists.
    pub fn subscribe_object(&self, object: &Object) -> Result<RawSubscription> {
        if object.instance != self.instance {
            return Err(StoreError::ForeignObject);
        }
        self.check_readable(&object.entity_type)?;

        let _lock = self.write_lock.lock();
        self.ensure_open()?;
        let first = match self
            .state
            .read()
            .table(&object.entity_type)
            .and_then(|t| t.get(&object.id))
        {
            Some(current) => RawChangeEvent::initial(Snapshot::Object(current.clone())),
            None => RawChangeEvent::deleted(None),
        };

        let target = WatchTarget::Object {
            entity_type: object.entity_type.clone(),
            id: object.id,
        };
        Ok(self.subscriptions.subscribe(target, first))
    }

    /// Watch every object of a type.
    pub fn subscribe_collection(&self, entity_type: &str) -> Result<RawSubscription> {
        self.check_readable(entity_type)?;

        let _lock = self.write_lock.lock();
        self.ensure_open()?;
        let members = self.state.read().collection(entity_type);
        let target = WatchTarget::Collection {
            entity_type: entity_type.to_string(),
        };
        Ok(self
            .subscriptions
            .subscribe(target, RawChangeEvent::initial(Snapshot::Collection(members))))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    // --- Private Helpers ---

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_readable(&self, entity_type: &str) -> Result<()> {
        self.ensure_open()?;
        if self.schema.contains(entity_type) {
            Ok(())
        } else {
            Err(StoreError::UnknownEntityType(entity_type.to_string()))
        }
    }

    fn data_file(state: &Tables) -> DataFile {
        DataFile {
            next_id: state.next_id,
            objects: state
                .tables
                .values()
                .flat_map(|t| t.values().cloned())
                .collect(),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityType, ObjectInput};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::of([EntityType::new("Person"), EntityType::new("Dog")])
    }

    fn open_memory() -> Database {
        Database::open(StoreConfig::in_memory(), schema()).unwrap()
    }

    #[test]
    fn test_empty_schema_rejected() {
        let result = Database::open(StoreConfig::in_memory(), Schema::new());
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[test]
    fn test_write_and_read() {
        let db = open_memory();
        let ada = db
            .write(|txn| txn.insert(ObjectInput::new("Person").with_field("name", "Ada")))
            .unwrap();

        assert_eq!(db.get("Person", ada.id).unwrap(), Some(ada.clone()));
        assert_eq!(db.count("Person").unwrap(), 1);
        assert_eq!(db.query("Dog").unwrap(), Vec::new());
        assert!(matches!(db.query("Cat"), Err(StoreError::UnknownEntityType(_))));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = open_memory();
        let result: Result<()> = db.write(|txn| {
            txn.insert(ObjectInput::new("Person"))?;
            txn.insert(ObjectInput::new("Cat"))?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::UnknownEntityType(_))));
        assert_eq!(db.count("Person").unwrap(), 0);
    }

    #[test]
    fn test_object_subscription_sees_updates() {
        let db = open_memory();
        let ada = db
            .write(|txn| txn.insert(ObjectInput::new("Person").with_field("name", "Ada")))
            .unwrap();
        let sub = db.subscribe_object(&ada).unwrap();
        assert_eq!(sub.recv().unwrap().kind, "initial");

        db.write(|txn| txn.set_field(&ada, "name", "Ada Lovelace")).unwrap();
        let event = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event.kind, "updated");
        assert_eq!(event.changed_fields, vec!["name".to_string()]);

        db.write(|txn| txn.delete_object(&ada)).unwrap();
        assert_eq!(sub.recv().unwrap().kind, "deleted");
        assert!(sub.recv().is_err());
    }

    #[test]
    fn test_collection_subscription() {
        let db = open_memory();
        let sub = db.subscribe_collection("Dog").unwrap();
        let first = sub.recv().unwrap();
        assert_eq!(first.snapshot, Some(Snapshot::Collection(Vec::new())));

        db.write(|txn| txn.insert(ObjectInput::new("Dog").with_field("name", "Rex")))
            .unwrap();
        // Writes to other types are not delivered.
        db.write(|txn| txn.insert(ObjectInput::new("Person"))).unwrap();

        let event = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        let members = event.snapshot.and_then(Snapshot::into_collection).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].get("name"), Some(&json!("Rex")));
        assert!(sub.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_ends_subscriptions() {
        let db = open_memory();
        let sub = db.subscribe_collection("Dog").unwrap();
        db.close();
        db.close();

        assert!(db.is_closed());
        assert_eq!(sub.recv().unwrap().kind, "initial");
        assert!(sub.recv().is_err());
        assert!(matches!(db.count("Dog"), Err(StoreError::Closed)));
    }

    #[test]
    fn test_foreign_object_subscription_rejected() {
        let a = open_memory();
        let b = open_memory();
        let dog = a.write(|txn| txn.insert(ObjectInput::new("Dog"))).unwrap();
        assert!(matches!(b.subscribe_object(&dog), Err(StoreError::ForeignObject)));
    }

    #[test]
    fn test_persistence_across_connections() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at_path(dir.path().join("store"));

        {
            let db = Database::open(config.clone(), schema()).unwrap();
            db.write(|txn| txn.insert(ObjectInput::new("Dog").with_field("name", "Rex")))
                .unwrap();
            db.close();
        }

        let db = Database::open(config, schema()).unwrap();
        let dogs = db.query("Dog").unwrap();
        assert_eq!(dogs.len(), 1);
        assert_eq!(dogs[0].instance, db.instance());

        // Ids continue after the persisted counter.
        let next = db.write(|txn| txn.insert(ObjectInput::new("Dog"))).unwrap();
        assert!(next.id > dogs[0].id);
    }
}
