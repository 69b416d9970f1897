//! Local state for tsnode: which logical VPN nodes this installation knows about.
//!
//! The whole state is one [`StateContainer`] document (`state.json`). Every
//! [`StateStore`] entry point is a complete load → mutate → save unit under the
//! document's exclusive lock; nothing is cached between calls.
//!
//! # Capacity
//! Ids come from a counter that wraps at [`ID_SPACE`]. After 1000 allocations
//! the counter hands out ids that may still belong to live records, and the
//! new record replaces the old one. The store logs a warning when that
//! happens but does not refuse the allocation: 1000 concurrently tracked nodes
//! is the documented capacity of one installation.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tsnode_persist::{JsonDocument, PersistError};

/// Number of distinct node ids before the allocator wraps around.
pub const ID_SPACE: u16 = 1000;

/// Logical node id.
pub type NodeId = u16;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No record with this id.
    #[error("node {0} does not exist in local state")]
    NotFound(NodeId),

    /// The snapshot exists but does not describe a valid state.
    #[error("local state at {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Filesystem or lock failure.
    #[error(transparent)]
    Io(PersistError),
}

impl From<PersistError> for StateError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::Decode { path, source } => StateError::Corrupt {
                path,
                reason: source.to_string(),
            },
            other => StateError::Io(other),
        }
    }
}

pub type StateResult<T> = Result<T, StateError>;

// ─── Node record ─────────────────────────────────────────────────────────────

/// Derived name: zero-padded id, region and instance type.
///
/// The name is the only key shared with remote resources (instance tag,
/// key-pair name, security-group name, local key-file stem).
pub fn node_name(id: NodeId, region: &str, instance_type: &str) -> String {
    format!("{id:03}-{region}-{instance_type}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Immutable once assigned; see [`node_name`].
    pub name: String,
    pub region: String,
    pub instance_type: String,
    pub image_id: String,
    pub created_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(
        id: NodeId,
        region: impl Into<String>,
        instance_type: impl Into<String>,
        image_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let region = region.into();
        let instance_type = instance_type.into();
        Self {
            id,
            name: node_name(id, &region, &instance_type),
            region,
            instance_type,
            image_id: image_id.into(),
            created_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

// ─── State container ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateContainer {
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    /// Next id [`StateContainer::allocate`] hands out.
    #[serde(default)]
    pub last_id: NodeId,
}

impl StateContainer {
    /// Hand out `last_id` and advance the counter modulo [`ID_SPACE`].
    ///
    /// The returned id is not checked against live records.
    pub fn allocate(&mut self) -> NodeId {
        let id = self.last_id;
        self.last_id = (self.last_id + 1) % ID_SPACE;
        id
    }

    pub fn get(&self, id: NodeId) -> StateResult<&NodeRecord> {
        self.nodes.get(&id).ok_or(StateError::NotFound(id))
    }

    /// Insert a record under its own id, returning any record it replaced.
    pub fn insert(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        self.nodes.insert(record.id, record)
    }

    /// Remove a record. Absent ids are a no-op.
    pub fn remove(&mut self, id: NodeId) -> Option<NodeRecord> {
        self.nodes.remove(&id)
    }

    /// Records in id order.
    pub fn list(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn validate(&self) -> Result<(), String> {
        if self.last_id >= ID_SPACE {
            return Err(format!("last_id {} outside 0..{ID_SPACE}", self.last_id));
        }
        for (key, record) in &self.nodes {
            if *key != record.id {
                return Err(format!("entry {key} holds record with id {}", record.id));
            }
        }
        Ok(())
    }
}

// ─── StateStore ──────────────────────────────────────────────────────────────

/// Lock-guarded access to the state snapshot.
#[derive(Debug, Clone)]
pub struct StateStore {
    doc: JsonDocument<StateContainer>,
}

impl StateStore {
    /// Store backed by the snapshot file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            doc: JsonDocument::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.doc.path()
    }

    /// Current snapshot, or an empty container when none exists yet.
    pub fn load(&self) -> StateResult<StateContainer> {
        let _guard = self.doc.lock()?;
        self.read_validated()
    }

    /// Overwrite the snapshot.
    pub fn save(&self, container: &StateContainer) -> StateResult<()> {
        let _guard = self.doc.lock()?;
        self.doc.write(container)?;
        Ok(())
    }

    /// Allocate an id, derive the name and persist a new record.
    pub fn add_node(
        &self,
        region: &str,
        instance_type: &str,
        image_id: &str,
    ) -> StateResult<NodeRecord> {
        self.update(|state| {
            let id = state.allocate();
            let record = NodeRecord::new(id, region, instance_type, image_id, Utc::now());
            if let Some(replaced) = state.insert(record.clone()) {
                warn!(
                    id,
                    replaced = %replaced.name,
                    capacity = ID_SPACE,
                    "node id space wrapped around; replaced a live record"
                );
            }
            info!(id, name = %record.name, "node record allocated");
            Ok(record)
        })
    }

    pub fn get_node(&self, id: NodeId) -> StateResult<NodeRecord> {
        self.load()?.get(id).cloned()
    }

    /// Remove a record. Returns the removed record, `None` if it was absent.
    pub fn remove_node(&self, id: NodeId) -> StateResult<Option<NodeRecord>> {
        self.update(|state| {
            let removed = state.remove(id);
            match &removed {
                Some(record) => info!(id, name = %record.name, "node record removed"),
                None => debug!(id, "node record already absent"),
            }
            Ok(removed)
        })
    }

    fn update<R>(
        &self,
        f: impl FnOnce(&mut StateContainer) -> StateResult<R>,
    ) -> StateResult<R> {
        let _guard = self.doc.lock()?;
        let mut state = self.read_validated()?;
        let out = f(&mut state)?;
        self.doc.write(&state)?;
        Ok(out)
    }

    fn read_validated(&self) -> StateResult<StateContainer> {
        let state = self.doc.read()?.unwrap_or_default();
        state.validate().map_err(|reason| StateError::Corrupt {
            path: self.doc.path().to_path_buf(),
            reason,
        })?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        (dir, store)
    }

    #[test]
    fn test_node_name_padding() {
        assert_eq!(node_name(5, "eu-central-1", "t2.micro"), "005-eu-central-1-t2.micro");
        assert_eq!(node_name(42, "eu-central-1", "t2.micro"), "042-eu-central-1-t2.micro");
        assert_eq!(node_name(123, "eu-central-1", "t2.micro"), "123-eu-central-1-t2.micro");
    }

    #[test]
    fn test_allocate_sequence_within_window() {
        let mut state = StateContainer::default();
        let ids: Vec<NodeId> = (0..999).map(|_| state.allocate()).collect();
        let expected: Vec<NodeId> = (0..999).collect();
        assert_eq!(ids, expected);
        assert_eq!(state.last_id, 999);
    }

    #[test]
    fn test_allocate_wraps_onto_live_id() {
        let mut state = StateContainer::default();
        for _ in 0..ID_SPACE {
            let id = state.allocate();
            state.insert(NodeRecord::new(id, "eu-west-1", "t2.micro", "ami-1", Utc::now()));
        }
        assert_eq!(state.len(), usize::from(ID_SPACE));

        // 1001st allocation collides with the live record 0.
        let id = state.allocate();
        assert_eq!(id, 0);
        assert!(state.get(id).is_ok());
    }

    #[test]
    fn test_remove_then_get_is_not_found() {
        let mut state = StateContainer::default();
        let id = state.allocate();
        state.insert(NodeRecord::new(id, "eu-west-1", "t2.micro", "ami-1", Utc::now()));

        assert!(state.remove(id).is_some());
        assert!(matches!(state.get(id), Err(StateError::NotFound(0))));
        assert!(state.remove(id).is_none());
    }

    #[test]
    fn test_empty_store_loads_empty_container() {
        let (_dir, store) = store();
        let state = store.load().expect("load");
        assert!(state.is_empty());
        assert_eq!(state.last_id, 0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (_dir, store) = store();
        let mut state = StateContainer::default();
        let now = Utc::now();
        state.insert(NodeRecord::new(0, "eu-west-1", "t2.micro", "ami-0a", now));
        state.insert(NodeRecord::new(2, "us-east-1", "t3.small", "ami-0b", now));
        state.last_id = 3;

        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), state);
    }

    #[test]
    fn test_add_get_remove_node() {
        let (_dir, store) = store();
        let first = store.add_node("eu-west-1", "t2.micro", "ami-1").expect("add");
        let second = store.add_node("eu-west-1", "t2.micro", "ami-1").expect("add");
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(second.name, "001-eu-west-1-t2.micro");

        assert_eq!(store.get_node(1).expect("get"), second);

        assert!(store.remove_node(1).expect("remove").is_some());
        assert!(store.remove_node(1).expect("remove again").is_none());
        assert!(matches!(store.get_node(1), Err(StateError::NotFound(1))));

        let state = store.load().expect("load");
        assert_eq!(state.len(), 1);
        assert_eq!(state.last_id, 2);
    }

    #[test]
    fn test_undecodable_snapshot_is_corrupt() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "{\"nodes\": [").expect("write");
        assert!(matches!(store.load(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_key_mismatch_is_corrupt() {
        let (_dir, store) = store();
        let now = Utc::now();
        let record = serde_json::to_value(NodeRecord::new(4, "eu-west-1", "t2.micro", "ami", now))
            .expect("encode");
        let doc = serde_json::json!({ "nodes": { "7": record }, "last_id": 8 });
        std::fs::write(store.path(), doc.to_string()).expect("write");

        assert!(matches!(store.load(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_corrupt_snapshot_is_left_untouched() {
        let (_dir, store) = store();
        std::fs::write(store.path(), "garbage").expect("write");
        assert!(store.add_node("eu-west-1", "t2.micro", "ami").is_err());
        assert_eq!(std::fs::read_to_string(store.path()).expect("read"), "garbage");
    }
}
