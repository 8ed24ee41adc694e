//! Workflow-scoped key/value state that survives across script invocations.
//!
//! The [`StaticDataArena`] owns one store per execution. Guests never touch
//! a store directly: they get a snapshot, mutate their copy, and the
//! backend writes back only the keys that changed. Two concurrent
//! invocations that touch different keys therefore both land; two that
//! touch the same key resolve last-write-wins.

use std::sync::Arc;

use dashmap::DashMap;
use nebula_core::ExecutionId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Contents of one static-data store.
pub type StaticData = Map<String, Value>;

/// Static-data stores keyed by execution.
#[derive(Debug, Clone, Default)]
pub struct StaticDataArena {
    stores: Arc<DashMap<ExecutionId, Arc<RwLock<StaticData>>>>,
}

impl StaticDataArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the store for `execution_id`, creating it on first use.
    pub fn handle(&self, execution_id: ExecutionId) -> StaticDataHandle {
        let store = self
            .stores
            .entry(execution_id)
            .or_insert_with(|| Arc::new(RwLock::new(StaticData::new())))
            .clone();
        StaticDataHandle { store }
    }

    /// Drops the store for a finished execution and returns its contents.
    pub fn release(&self, execution_id: ExecutionId) -> Option<StaticData> {
        self.stores
            .remove(&execution_id)
            .map(|(_, store)| store.read().clone())
    }

    /// Number of live stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns `true` if no execution holds a store.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Shared handle to one execution's store.
#[derive(Debug, Clone)]
pub struct StaticDataHandle {
    store: Arc<RwLock<StaticData>>,
}

impl StaticDataHandle {
    /// Store not registered in any arena; used by workers, which receive a
    /// snapshot and report changes back.
    pub fn detached(initial: StaticData) -> Self {
        Self {
            store: Arc::new(RwLock::new(initial)),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> StaticData {
        self.store.read().clone()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.read().get(key).cloned()
    }

    /// Stores `value` under `key`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.store.write().insert(key.into(), value);
    }

    /// Writes back a guest's changes.
    pub fn apply(&self, changes: &StaticDataChanges) {
        if changes.is_empty() {
            return;
        }
        let mut store = self.store.write();
        for (key, value) in &changes.set {
            store.insert(key.clone(), value.clone());
        }
        for key in &changes.removed {
            store.remove(key);
        }
    }
}

/// Keys a guest added, changed or deleted relative to its snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticDataChanges {
    /// Added or modified keys with their new values.
    pub set: StaticData,
    /// Deleted keys.
    pub removed: Vec<String>,
}

impl StaticDataChanges {
    /// Computes what changed between `before` and `after`.
    pub fn diff(before: &StaticData, after: &StaticData) -> Self {
        let set = after
            .iter()
            .filter(|(key, value)| before.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let removed = before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned()
            .collect();
        Self { set, removed }
    }

    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn map(value: Value) -> StaticData {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn handles_for_the_same_execution_share_a_store() {
        let arena = StaticDataArena::new();
        let id = ExecutionId::v4();
        arena.handle(id).set("count", json!(1));
        assert_eq!(arena.handle(id).get("count"), Some(json!(1)));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn executions_are_isolated() {
        let arena = StaticDataArena::new();
        arena.handle(ExecutionId::v4()).set("k", json!("a"));
        assert_eq!(arena.handle(ExecutionId::v4()).get("k"), None);
    }

    #[test]
    fn release_returns_contents_and_forgets_store() {
        let arena = StaticDataArena::new();
        let id = ExecutionId::v4();
        arena.handle(id).set("k", json!(true));
        assert_eq!(arena.release(id), Some(map(json!({ "k": true }))));
        assert!(arena.is_empty());
        assert_eq!(arena.release(id), None);
    }

    #[test]
    fn diff_reports_changed_added_and_removed_keys() {
        let before = map(json!({ "same": 1, "changed": 1, "gone": 1 }));
        let after = map(json!({ "same": 1, "changed": 2, "new": 3 }));
        let changes = StaticDataChanges::diff(&before, &after);
        assert_eq!(changes.set, map(json!({ "changed": 2, "new": 3 })));
        assert_eq!(changes.removed, vec!["gone".to_owned()]);
    }

    #[test]
    fn concurrent_writers_to_different_keys_both_land() {
        let handle = StaticDataHandle::detached(map(json!({ "a": 0, "b": 0 })));
        let snapshot_one = handle.snapshot();
        let snapshot_two = handle.snapshot();

        let mut after_one = snapshot_one.clone();
        after_one.insert("a".into(), json!(1));
        let mut after_two = snapshot_two.clone();
        after_two.insert("b".into(), json!(2));

        handle.apply(&StaticDataChanges::diff(&snapshot_one, &after_one));
        handle.apply(&StaticDataChanges::diff(&snapshot_two, &after_two));

        assert_eq!(handle.snapshot(), map(json!({ "a": 1, "b": 2 })));
    }

    #[test]
    fn same_key_is_last_write_wins() {
        let handle = StaticDataHandle::detached(StaticData::new());
        let base = handle.snapshot();
        for value in [1, 2] {
            let mut after = base.clone();
            after.insert("k".into(), json!(value));
            handle.apply(&StaticDataChanges::diff(&base, &after));
        }
        assert_eq!(handle.get("k"), Some(json!(2)));
    }
}
