//! Fjall-based store adapter for tessera.
//!
//! One LSM database holds every region hosted by the daemon: object
//! records, forward index entries, and client-op ack markers live in
//! separate keyspaces. A write batches the object record, its version
//! bump, and the index delta atomically.
//!
//! All multi-byte integers are big-endian encoded for correct
//! lexicographic ordering.

use std::path::Path;
use std::sync::Arc;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, OwnedWriteBatch, PersistMode};
use tracing::warn;

use tessera_core::{
    AttrNum, DataStore, DataType, IndexRange, ObjectEntry, RegionId, Space, StoreError, Version,
};
use tessera_types::document;

pub mod keys;

/// Default cache size in MB
const DEFAULT_CACHE_SIZE_MB: usize = 256;

/// Keyspace names
mod keyspace_names {
    pub const OBJECTS: &str = "objects";
    pub const INDEX: &str = "index";
    pub const ACKED: &str = "acked";
    pub const META: &str = "meta";
}

/// Key for the installed-configuration marker
const CONFIG_VERSION_KEY: &[u8] = &[0u8];

/// Error type for fjall store operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        match error {
            Error::Codec(msg) => StoreError::BadEncoding(msg),
            other => StoreError::internal(other),
        }
    }
}

#[derive(Clone)]
pub struct FjallStore {
    db: Arc<Database>,
    objects: Keyspace,
    index: Keyspace,
    acked: Keyspace,
    meta: Keyspace,
}

impl FjallStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, cache_size_mb: Option<usize>) -> Result<Self, Error> {
        let cache_size = cache_size_mb.unwrap_or(DEFAULT_CACHE_SIZE_MB);
        let cache_bytes = (cache_size * 1024 * 1024) as u64;

        let db = Database::builder(path.as_ref())
            .cache_size(cache_bytes)
            .open()?;

        let opts = KeyspaceCreateOptions::default;

        let objects = db.keyspace(keyspace_names::OBJECTS, opts)?;
        let index = db.keyspace(keyspace_names::INDEX, opts)?;
        let acked = db.keyspace(keyspace_names::ACKED, opts)?;
        let meta = db.keyspace(keyspace_names::META, opts)?;

        Ok(Self {
            db: Arc::new(db),
            objects,
            index,
            acked,
            meta,
        })
    }

    /// The configuration version most recently installed by the daemon.
    pub fn applied_config_version(&self) -> Result<Option<u64>, Error> {
        match self.meta.get(CONFIG_VERSION_KEY)? {
            Some(raw) => {
                let version: u64 =
                    bincode::deserialize(&raw).map_err(|e| Error::Codec(e.to_string()))?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    pub fn set_applied_config_version(&self, version: u64) -> Result<(), Error> {
        let raw = bincode::serialize(&version).map_err(|e| Error::Codec(e.to_string()))?;
        self.meta.insert(CONFIG_VERSION_KEY, raw)?;
        Ok(())
    }

    fn read_object(
        &self,
        region: &RegionId,
        key: &[u8],
    ) -> Result<Option<(Vec<Vec<u8>>, Version)>, Error> {
        let stored = keys::object_key(region, key);

        match self.objects.get(&stored)? {
            Some(raw) => keys::decode_value(&raw)
                .map(Some)
                .ok_or_else(|| Error::Codec("undecodable object record".into())),
            None => Ok(None),
        }
    }

    /// Queue the index delta for one object transition into `batch`.
    fn index_delta(
        &self,
        batch: &mut OwnedWriteBatch,
        region: &RegionId,
        space: &Space,
        key: &[u8],
        old_value: Option<&[Vec<u8>]>,
        new_value: Option<&[Vec<u8>]>,
    ) {
        let Some(su) = space.subspaces.get(region.subspace as usize) else {
            return;
        };

        for &attr in &su.attrs {
            if attr == 0 {
                continue;
            }

            let Some(datatype) = space.attr_type(attr) else {
                continue;
            };

            let slot = (attr - 1) as usize;
            let old_attr = old_value.and_then(|v| v.get(slot));
            let new_attr = new_value.and_then(|v| v.get(slot));

            if old_attr == new_attr {
                continue;
            }

            if let Some(old_attr) = old_attr {
                if let Some(entry) = keys::index_key(region, attr, datatype, old_attr, key) {
                    batch.remove(&self.index, entry);
                }
            }

            if let Some(new_attr) = new_attr {
                if let Some(entry) = keys::index_key(region, attr, datatype, new_attr, key) {
                    batch.insert(&self.index, entry, []);
                }
            }
        }

        // Document path indexes live with the object's home region in
        // subspace 0.
        if region.subspace == 0 {
            for di in &space.doc_indexes {
                let slot = (di.attr - 1) as usize;
                let old_attr = old_value.and_then(|v| v.get(slot));
                let new_attr = new_value.and_then(|v| v.get(slot));

                if old_attr == new_attr {
                    continue;
                }

                if let Some(entry) = old_attr.and_then(|v| doc_entry(region, di.attr, &di.path, v, key))
                {
                    batch.remove(&self.index, entry);
                }

                if let Some(entry) = new_attr.and_then(|v| doc_entry(region, di.attr, &di.path, v, key))
                {
                    batch.insert(&self.index, entry, []);
                }
            }
        }
    }

    fn collect_region(&self, region: &RegionId) -> Result<Vec<ObjectEntry>, Error> {
        let prefix = keys::object_prefix(region);
        let mut out = Vec::new();

        for guard in self.objects.prefix(&prefix) {
            let (stored, raw) = guard.into_inner().map_err(Error::Fjall)?;

            let Some(key) = keys::decode_object_key(&stored, region) else {
                continue;
            };

            let Some((attrs, version)) = keys::decode_value(&raw) else {
                warn!(region = %region, "skipping undecodable object record");
                continue;
            };

            out.push(ObjectEntry {
                key: key.to_vec(),
                version,
                value: Some(attrs),
            });
        }

        Ok(out)
    }
}

/// Index entry for a document attribute at a configured path, if the
/// path currently holds an indexable primitive.
fn doc_entry(
    region: &RegionId,
    attr: AttrNum,
    path: &str,
    doc: &[u8],
    key: &[u8],
) -> Option<Vec<u8>> {
    let tx = document::Transformer::new(doc).ok()?;
    let value = tx.extract(path)?;

    if let Some(s) = value.as_str() {
        return Some(keys::doc_index_key(
            region,
            attr,
            path,
            Some(s.as_bytes()),
            None,
            key,
        ));
    }

    let n = value.as_f64()?;
    Some(keys::doc_index_key(region, attr, path, None, Some(n), key))
}

pub struct RegionSnapshot {
    entries: std::vec::IntoIter<ObjectEntry>,
}

impl Iterator for RegionSnapshot {
    type Item = ObjectEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

impl DataStore for FjallStore {
    type Snapshot = RegionSnapshot;

    fn get(
        &self,
        region: &RegionId,
        key: &[u8],
    ) -> Result<Option<(Vec<Vec<u8>>, Version)>, StoreError> {
        self.read_object(region, key).map_err(StoreError::from)
    }

    fn put(
        &self,
        region: &RegionId,
        space: &Space,
        key: &[u8],
        value: &[Vec<u8>],
        version: Version,
    ) -> Result<(), StoreError> {
        let old = self.read_object(region, key)?;
        let mut batch = self.db.batch();

        self.index_delta(
            &mut batch,
            region,
            space,
            key,
            old.as_ref().map(|(attrs, _)| attrs.as_slice()),
            Some(value),
        );

        batch.insert(
            &self.objects,
            keys::object_key(region, key),
            keys::encode_value(value, version),
        );

        batch
            .durability(Some(PersistMode::Buffer))
            .commit()
            .map_err(Error::Fjall)?;
        Ok(())
    }

    fn del(&self, region: &RegionId, space: &Space, key: &[u8]) -> Result<(), StoreError> {
        let Some((old, _)) = self.read_object(region, key)? else {
            return Ok(());
        };

        let mut batch = self.db.batch();
        self.index_delta(&mut batch, region, space, key, Some(&old), None);
        batch.remove(&self.objects, keys::object_key(region, key));

        batch
            .durability(Some(PersistMode::Buffer))
            .commit()
            .map_err(Error::Fjall)?;
        Ok(())
    }

    fn snapshot(&self, region: &RegionId) -> Result<Self::Snapshot, StoreError> {
        let entries = self.collect_region(region).map_err(StoreError::from)?;

        Ok(RegionSnapshot {
            entries: entries.into_iter(),
        })
    }

    fn scan_objects(&self, region: &RegionId) -> Result<Vec<ObjectEntry>, StoreError> {
        self.collect_region(region).map_err(StoreError::from)
    }

    fn scan_index(
        &self,
        region: &RegionId,
        space: &Space,
        attr: AttrNum,
        range: &IndexRange,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let Some(datatype) = space.attr_type(attr) else {
            return Ok(Vec::new());
        };

        let prefix = keys::index_prefix(region, attr);
        let mut out = Vec::new();

        for guard in self.index.prefix(&prefix) {
            let (entry, _) = guard.into_inner().map_err(Error::Fjall)?;

            let Some(image) = keys::parse_index_image(datatype, &entry) else {
                continue;
            };

            if let Some(lower) = &range.lower {
                if image < lower.as_slice() {
                    continue;
                }
            }

            if let Some(upper) = &range.upper {
                if image > upper.as_slice() {
                    continue;
                }
            }

            if let Some(key) = keys::parse_index_key(datatype, &entry) {
                out.push(key);
            }
        }

        Ok(out)
    }

    fn mark_acked(
        &self,
        region: &RegionId,
        leader: &RegionId,
        seq: u64,
    ) -> Result<(), StoreError> {
        self.acked
            .insert(keys::acked_key(region, leader, seq), [])
            .map_err(Error::Fjall)?;
        Ok(())
    }

    fn is_acked(&self, region: &RegionId, leader: &RegionId, seq: u64) -> Result<bool, StoreError> {
        let found = self
            .acked
            .get(keys::acked_key(region, leader, seq))
            .map_err(Error::Fjall)?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Attribute, SpaceId, Subspace};
    use tessera_types::int64;

    fn users() -> Space {
        Space {
            id: SpaceId(1),
            name: "users".into(),
            attrs: vec![
                Attribute::new("username", DataType::String),
                Attribute::new("name", DataType::String),
                Attribute::new("age", DataType::Int64),
            ],
            subspaces: vec![Subspace::new(vec![0]), Subspace::new(vec![1, 2])],
            doc_indexes: vec![],
        }
    }

    fn store() -> (tempfile::TempDir, FjallStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path(), Some(8)).unwrap();
        (dir, store)
    }

    fn region(subspace: u16) -> RegionId {
        RegionId::new(SpaceId(1), subspace, 0, 0)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (_dir, store) = store();
        let r = region(0);
        let value = vec![b"Alice".to_vec(), int64::pack(30)];

        store.put(&r, &users(), b"alice", &value, 1).unwrap();

        let (read, version) = store.get(&r, b"alice").unwrap().unwrap();
        assert_eq!(read, value);
        assert_eq!(version, 1);
    }

    #[test]
    fn del_removes_the_object() {
        let (_dir, store) = store();
        let r = region(0);
        let value = vec![b"Alice".to_vec(), int64::pack(30)];

        store.put(&r, &users(), b"alice", &value, 1).unwrap();
        store.del(&r, &users(), b"alice").unwrap();
        assert!(store.get(&r, b"alice").unwrap().is_none());

        // Deleting a missing key is quiet.
        store.del(&r, &users(), b"alice").unwrap();
    }

    #[test]
    fn index_scan_returns_keys_in_value_order() {
        let (_dir, store) = store();
        let space = users();
        let r = region(1);

        for (key, age) in [("c", 3i64), ("a", 1), ("b", 2), ("d", -7)] {
            let value = vec![key.as_bytes().to_vec(), int64::pack(age)];
            store.put(&r, &space, key.as_bytes(), &value, 1).unwrap();
        }

        let everything = store
            .scan_index(&r, &space, 2, &IndexRange::default())
            .unwrap();
        assert_eq!(everything, vec![b"d".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let range = IndexRange {
            lower: Some(keys::index_image(DataType::Int64, &int64::pack(1)).unwrap()),
            upper: Some(keys::index_image(DataType::Int64, &int64::pack(2)).unwrap()),
        };
        let bounded = store.scan_index(&r, &space, 2, &range).unwrap();
        assert_eq!(bounded, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn updates_replace_index_entries() {
        let (_dir, store) = store();
        let space = users();
        let r = region(1);

        let v1 = vec![b"Bob".to_vec(), int64::pack(5)];
        let v2 = vec![b"Bob".to_vec(), int64::pack(50)];
        store.put(&r, &space, b"bob", &v1, 1).unwrap();
        store.put(&r, &space, b"bob", &v2, 2).unwrap();

        let range = IndexRange {
            lower: None,
            upper: Some(keys::index_image(DataType::Int64, &int64::pack(10)).unwrap()),
        };
        assert!(store.scan_index(&r, &space, 2, &range).unwrap().is_empty());

        let all = store.scan_index(&r, &space, 2, &IndexRange::default()).unwrap();
        assert_eq!(all, vec![b"bob".to_vec()]);
    }

    #[test]
    fn snapshots_see_a_point_in_time() {
        let (_dir, store) = store();
        let space = users();
        let r = region(0);

        let value = vec![b"A".to_vec(), int64::pack(1)];
        store.put(&r, &space, b"a", &value, 1).unwrap();

        let snap = store.snapshot(&r).unwrap();

        let late = vec![b"B".to_vec(), int64::pack(2)];
        store.put(&r, &space, b"b", &late, 1).unwrap();

        let entries: Vec<_> = snap.collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"a");
        assert_eq!(entries[0].version, 1);
    }

    #[test]
    fn acked_markers_survive() {
        let (_dir, store) = store();
        let r = region(0);
        let leader = region(0);

        assert!(!store.is_acked(&r, &leader, 9).unwrap());
        store.mark_acked(&r, &leader, 9).unwrap();
        assert!(store.is_acked(&r, &leader, 9).unwrap());
        assert!(!store.is_acked(&r, &leader, 10).unwrap());
    }

    #[test]
    fn config_version_marker_roundtrips() {
        let (_dir, store) = store();
        assert_eq!(store.applied_config_version().unwrap(), None);
        store.set_applied_config_version(12).unwrap();
        assert_eq!(store.applied_config_version().unwrap(), Some(12));
    }

    #[test]
    fn document_paths_are_indexed_at_home_regions() {
        let (_dir, store) = store();
        let space = Space {
            id: SpaceId(2),
            name: "profiles".into(),
            attrs: vec![
                Attribute::new("id", DataType::String),
                Attribute::new("profile", DataType::Document),
            ],
            subspaces: vec![Subspace::new(vec![0])],
            doc_indexes: vec![tessera_core::DocIndex {
                attr: 1,
                path: "user.views".into(),
            }],
        };
        let r = RegionId::new(SpaceId(2), 0, 0, 0);

        let doc = br#"{"user": {"views": 10}}"#.to_vec();
        store.put(&r, &space, b"p1", &[doc], 1).unwrap();

        // One index entry landed for the configured path.
        let prefix = keys::index_prefix(&r, 1);
        let found = store.index.prefix(&prefix).count();
        assert_eq!(found, 1);
    }
}
