//! Copy-on-write write scope.

use crate::error::{Result, StoreError};
use crate::types::{EntityId, FieldSet, Fields, InstanceId, Object, ObjectInput, Schema, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Objects of one entity type, ordered by id.
pub(crate) type Table = BTreeMap<EntityId, Object>;

/// Committed state of a connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct Tables {
    pub tables: BTreeMap<String, Arc<Table>>,
    pub next_id: u64,
}

impl Tables {
    pub fn table(&self, entity_type: &str) -> Option<&Table> {
        self.tables.get(entity_type).map(Arc::as_ref)
    }

    pub fn collection(&self, entity_type: &str) -> Vec<Object> {
        self.table(entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }
}

/// Net effect of a committed transaction on one object.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectChange {
    Inserted(Object),
    Modified {
        before: Object,
        after: Object,
        fields: FieldSet,
    },
    Deleted(Object),
}

impl ObjectChange {
    pub fn entity_type(&self) -> &str {
        match self {
            ObjectChange::Inserted(obj) | ObjectChange::Deleted(obj) => &obj.entity_type,
            ObjectChange::Modified { after, .. } => &after.entity_type,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            ObjectChange::Inserted(obj) | ObjectChange::Deleted(obj) => obj.id,
            ObjectChange::Modified { after, .. } => after.id,
        }
    }

    /// Fields affected. Membership changes affect every field of the object.
    pub fn changed_fields(&self) -> FieldSet {
        match self {
            ObjectChange::Inserted(obj) | ObjectChange::Deleted(obj) => {
                obj.fields.keys().cloned().collect()
            }
            ObjectChange::Modified { fields, .. } => fields.clone(),
        }
    }
}

/// A write scope. Nothing is visible to readers until the enclosing
/// [`Database::write`](super::Database::write) returns `Ok`.
pub struct Transaction<'a> {
    schema: &'a Schema,
    instance: InstanceId,
    state: Tables,
    touched: BTreeSet<(String, EntityId)>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(schema: &'a Schema, instance: InstanceId, base: Tables) -> Self {
        Self {
            schema,
            instance,
            state: base,
            touched: BTreeSet::new(),
        }
    }

    /// Write an unmanaged object, returning its managed copy.
    pub fn insert(&mut self, input: ObjectInput) -> Result<Object> {
        self.check_type(&input.entity_type)?;
        self.check_fields(&input.entity_type, &input.fields)?;

        self.state.next_id += 1;
        let id = EntityId(self.state.next_id);
        let now = Timestamp::now();
        let object = Object {
            id,
            entity_type: input.entity_type,
            instance: self.instance,
            fields: input.fields,
            created: now,
            updated: now,
        };

        self.touched.insert((object.entity_type.clone(), id));
        self.table_mut(&object.entity_type)
            .insert(id, object.clone());
        Ok(object)
    }

    pub fn get(&self, entity_type: &str, id: EntityId) -> Result<Option<Object>> {
        self.check_type(entity_type)?;
        Ok(self
            .state
            .table(entity_type)
            .and_then(|t| t.get(&id))
            .cloned())
    }

    /// Modify an object's fields in place.
    pub fn update<F>(&mut self, entity_type: &str, id: EntityId, f: F) -> Result<Object>
    where
        F: FnOnce(&mut Fields),
    {
        self.check_type(entity_type)?;
        let mut object = self.get(entity_type, id)?.ok_or_else(|| StoreError::ObjectNotFound {
            entity_type: entity_type.to_string(),
            id,
        })?;

        f(&mut object.fields);
        self.check_fields(entity_type, &object.fields)?;
        object.updated = Timestamp::now();

        self.touched.insert((entity_type.to_string(), id));
        self.table_mut(entity_type).insert(id, object.clone());
        Ok(object)
    }

    /// Modify a managed object.
    pub fn update_object<F>(&mut self, object: &Object, f: F) -> Result<Object>
    where
        F: FnOnce(&mut Fields),
    {
        self.check_managed(object)?;
        self.update(&object.entity_type, object.id, f)
    }

    pub fn set_field(
        &mut self,
        object: &Object,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Result<Object> {
        let (name, value) = (name.into(), value.into());
        self.update_object(object, move |fields| {
            fields.insert(name, value);
        })
    }

    /// Remove an object. Returns false if it did not exist.
    pub fn delete(&mut self, entity_type: &str, id: EntityId) -> Result<bool> {
        self.check_type(entity_type)?;
        let exists = self
            .state
            .table(entity_type)
            .map(|t| t.contains_key(&id))
            .unwrap_or(false);
        if !exists {
            return Ok(false);
        }
        self.touched.insert((entity_type.to_string(), id));
        self.table_mut(entity_type).remove(&id);
        Ok(true)
    }

    pub fn delete_object(&mut self, object: &Object) -> Result<bool> {
        self.check_managed(object)?;
        self.delete(&object.entity_type, object.id)
    }

    /// Remove every object of a type. Returns how many were removed.
    pub fn delete_all(&mut self, entity_type: &str) -> Result<usize> {
        self.check_type(entity_type)?;
        let ids: Vec<EntityId> = match self.state.table(entity_type) {
            Some(table) => table.keys().copied().collect(),
            None => return Ok(0),
        };
        for id in &ids {
            self.touched.insert((entity_type.to_string(), *id));
        }
        self.table_mut(entity_type).clear();
        Ok(ids.len())
    }

    pub fn query(&self, entity_type: &str) -> Result<Vec<Object>> {
        self.check_type(entity_type)?;
        Ok(self.state.collection(entity_type))
    }

    pub fn count(&self, entity_type: &str) -> Result<usize> {
        self.check_type(entity_type)?;
        Ok(self.state.table(entity_type).map(|t| t.len()).unwrap_or(0))
    }

    /// Consume the scope, returning the new state and its net changes
    /// relative to `base`.
    pub(crate) fn finish(self, base: &Tables) -> (Tables, Vec<ObjectChange>) {
        let mut changes = Vec::new();
        for (entity_type, id) in &self.touched {
            let before = base.table(entity_type).and_then(|t| t.get(id));
            let after = self.state.table(entity_type).and_then(|t| t.get(id));
            match (before, after) {
                (None, Some(after)) => changes.push(ObjectChange::Inserted(after.clone())),
                (Some(before), None) => changes.push(ObjectChange::Deleted(before.clone())),
                (Some(before), Some(after)) => {
                    let fields = after.changed_fields(before);
                    if !fields.is_empty() {
                        changes.push(ObjectChange::Modified {
                            before: before.clone(),
                            after: after.clone(),
                            fields,
                        });
                    }
                }
                (None, None) => {}
            }
        }
        (self.state, changes)
    }

    fn table_mut(&mut self, entity_type: &str) -> &mut Table {
        let table = self
            .state
            .tables
            .entry(entity_type.to_string())
            .or_default();
        Arc::make_mut(table)
    }

    fn check_type(&self, entity_type: &str) -> Result<()> {
        if self.schema.contains(entity_type) {
            Ok(())
        } else {
            Err(StoreError::UnknownEntityType(entity_type.to_string()))
        }
    }

    fn check_fields(&self, entity_type: &str, fields: &Fields) -> Result<()> {
        if let Some(descriptor) = self.schema.get(entity_type) {
            if let Some(bad) = fields.keys().find(|f| !descriptor.accepts_field(f)) {
                return Err(StoreError::InvalidOperation(format!(
                    "field '{}' is not declared on {}",
                    bad, entity_type
                )));
            }
        }
        Ok(())
    }

    fn check_managed(&self, object: &Object) -> Result<()> {
        if object.instance != self.instance {
            return Err(StoreError::ForeignObject);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityType;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::of([
            EntityType::new("Person").with_fields(["name", "age"]),
            EntityType::new("Dog"),
        ])
    }

    #[test]
    fn test_insert_assigns_ids() {
        let schema = schema();
        let mut txn = Transaction::new(&schema, InstanceId(1), Tables::default());
        let a = txn.insert(ObjectInput::new("Person").with_field("name", "Ada")).unwrap();
        let b = txn.insert(ObjectInput::new("Dog")).unwrap();
        assert_eq!(a.id, EntityId(1));
        assert_eq!(b.id, EntityId(2));
        assert_eq!(a.instance, InstanceId(1));
        assert_eq!(txn.count("Person").unwrap(), 1);
    }

    #[test]
    fn test_unknown_type_and_undeclared_field() {
        let schema = schema();
        let mut txn = Transaction::new(&schema, InstanceId(1), Tables::default());
        assert!(matches!(
            txn.insert(ObjectInput::new("Cat")),
            Err(StoreError::UnknownEntityType(_))
        ));
        assert!(matches!(
            txn.insert(ObjectInput::new("Person").with_field("email", "a@b")),
            Err(StoreError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_finish_reports_net_changes() {
        let schema = schema();
        let mut seed = Transaction::new(&schema, InstanceId(1), Tables::default());
        let ada = seed
            .insert(ObjectInput::new("Person").with_field("name", "Ada"))
            .unwrap();
        let rex = seed.insert(ObjectInput::new("Dog").with_field("name", "Rex")).unwrap();
        let (base, _) = seed.finish(&Tables::default());

        let mut txn = Transaction::new(&schema, InstanceId(1), base.clone());
        txn.set_field(&ada, "age", 36).unwrap();
        txn.delete_object(&rex).unwrap();
        // Insert then delete nets to nothing.
        let tmp = txn.insert(ObjectInput::new("Dog")).unwrap();
        txn.delete_object(&tmp).unwrap();
        // Rewriting the same value is not a change.
        txn.set_field(&ada, "name", "Ada").unwrap();

        let (after, changes) = txn.finish(&base);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| matches!(
            c,
            ObjectChange::Modified { fields, .. } if fields.contains("age")
        )));
        assert!(changes.iter().any(|c| matches!(c, ObjectChange::Deleted(o) if o.id == rex.id)));
        assert_eq!(after.object_count(), 1);
        // The base snapshot is untouched.
        assert_eq!(base.object_count(), 2);
        assert_eq!(base.collection("Person")[0].get("age"), None);
        assert_eq!(after.collection("Person")[0].get("age"), Some(&json!(36)));
    }

    #[test]
    fn test_delete_all_counts() {
        let schema = schema();
        let mut txn = Transaction::new(&schema, InstanceId(1), Tables::default());
        for _ in 0..3 {
            txn.insert(ObjectInput::new("Dog")).unwrap();
        }
        assert_eq!(txn.delete_all("Dog").unwrap(), 3);
        assert_eq!(txn.delete_all("Dog").unwrap(), 0);
        assert_eq!(txn.delete_all("Person").unwrap(), 0);
    }

    #[test]
    fn test_foreign_object_rejected() {
        let schema = schema();
        let mut txn = Transaction::new(&schema, InstanceId(1), Tables::default());
        let mut dog = txn.insert(ObjectInput::new("Dog")).unwrap();
        dog.instance = InstanceId(99);
        assert!(matches!(txn.delete_object(&dog), Err(StoreError::ForeignObject)));
    }

    #[test]
    fn test_update_missing_object() {
        let schema = schema();
        let mut txn = Transaction::new(&schema, InstanceId(1), Tables::default());
        let result = txn.update("Dog", EntityId(5), |_| {});
        assert!(matches!(result, Err(StoreError::ObjectNotFound { .. })));
    }
}
