// Typed record collections over a `StorageBackend`
//
// Layout:
//   rec/<collection>/<hex id>                       -> JSON record
//   idx/<collection>/ts/<20-digit timestamp>/<hex id> -> empty
//   idx/<collection>/<field>/<hex value>/<hex id>      -> empty
//
// Index values and ids are hex encoded so arbitrary peer ids never collide
// with the separator. Timestamps are zero padded so prefix scans come back
// in chronological order.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::backend::{StorageBackend, StoreError};

/// A value persisted in its own collection with secondary indexes.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn record_id(&self) -> String;

    /// Timestamp used for newest-first listing and retention sweeps.
    fn timestamp(&self) -> u64;

    /// Secondary index entries as `(field, value)` pairs.
    fn index_entries(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
}

fn record_key(collection: &str, id: &str) -> Vec<u8> {
    format!("rec/{}/{}", collection, hex::encode(id)).into_bytes()
}

fn record_prefix(collection: &str) -> Vec<u8> {
    format!("rec/{}/", collection).into_bytes()
}

fn ts_prefix(collection: &str) -> Vec<u8> {
    format!("idx/{}/ts/", collection).into_bytes()
}

fn ts_key(collection: &str, timestamp: u64, id: &str) -> Vec<u8> {
    format!("idx/{}/ts/{:020}/{}", collection, timestamp, hex::encode(id)).into_bytes()
}

fn field_prefix(collection: &str, field: &str, value: &str) -> Vec<u8> {
    format!("idx/{}/{}/{}/", collection, field, hex::encode(value)).into_bytes()
}

fn field_key(collection: &str, field: &str, value: &str, id: &str) -> Vec<u8> {
    let mut key = field_prefix(collection, field, value);
    key.extend_from_slice(hex::encode(id).as_bytes());
    key
}

/// Trailing hex id segment of an index key.
fn id_from_index_key(key: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(key).ok()?;
    let hex_id = text.rsplit('/').next()?;
    let raw = hex::decode(hex_id).ok()?;
    String::from_utf8(raw).ok()
}

fn timestamp_from_index_key(key: &[u8], prefix_len: usize) -> Option<u64> {
    let rest = key.get(prefix_len..)?;
    let text = std::str::from_utf8(rest).ok()?;
    text.split('/').next()?.parse().ok()
}

fn decode<R: Record>(bytes: &[u8]) -> Result<R, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

impl RecordStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Insert or replace a record, keeping its index entries in sync.
    pub async fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let id = record.record_id();
        if let Some(previous) = self.get::<R>(&id).await? {
            self.remove_indexes(&previous).await?;
        }

        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.backend.put(&record_key(R::COLLECTION, &id), &bytes).await?;
        self.backend
            .put(&ts_key(R::COLLECTION, record.timestamp(), &id), &[])
            .await?;
        for (field, value) in record.index_entries() {
            self.backend
                .put(&field_key(R::COLLECTION, field, &value, &id), &[])
                .await?;
        }
        Ok(())
    }

    pub async fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        match self.backend.get(&record_key(R::COLLECTION, id)).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Remove a record and its index entries. Returns whether it existed.
    pub async fn remove<R: Record>(&self, id: &str) -> Result<bool, StoreError> {
        let Some(existing) = self.get::<R>(id).await? else {
            return Ok(false);
        };
        self.remove_indexes(&existing).await?;
        self.backend.remove(&record_key(R::COLLECTION, id)).await?;
        Ok(true)
    }

    async fn remove_indexes<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let id = record.record_id();
        self.backend
            .remove(&ts_key(R::COLLECTION, record.timestamp(), &id))
            .await?;
        for (field, value) in record.index_entries() {
            self.backend
                .remove(&field_key(R::COLLECTION, field, &value, &id))
                .await?;
        }
        Ok(())
    }

    /// All records, newest first, optionally bounded.
    pub async fn all<R: Record>(&self, limit: Option<usize>) -> Result<Vec<R>, StoreError> {
        let mut records = Vec::new();
        for (_, bytes) in self.backend.scan_prefix(&record_prefix(R::COLLECTION)).await? {
            records.push(decode::<R>(&bytes)?);
        }
        records.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Records whose `field` index equals `value`, newest first.
    pub async fn find_by<R: Record>(&self, field: &str, value: &str) -> Result<Vec<R>, StoreError> {
        let mut records = Vec::new();
        let entries = self
            .backend
            .scan_prefix(&field_prefix(R::COLLECTION, field, value))
            .await?;
        for (key, _) in entries {
            let Some(id) = id_from_index_key(&key) else {
                continue;
            };
            // Dangling index entries are skipped rather than reported.
            if let Some(record) = self.get::<R>(&id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Ok(records)
    }

    /// Ids of records with a timestamp strictly older than `cutoff`.
    pub async fn ids_older_than<R: Record>(&self, cutoff: u64) -> Result<Vec<String>, StoreError> {
        let prefix = ts_prefix(R::COLLECTION);
        let mut ids = Vec::new();
        for (key, _) in self.backend.scan_prefix(&prefix).await? {
            match timestamp_from_index_key(&key, prefix.len()) {
                Some(ts) if ts < cutoff => {
                    if let Some(id) = id_from_index_key(&key) {
                        ids.push(id);
                    }
                }
                Some(_) => break,
                None => continue,
            }
        }
        Ok(ids)
    }

    /// Delete every record older than `cutoff`, oldest first.
    pub async fn purge_older_than<R: Record>(&self, cutoff: u64) -> Result<usize, StoreError> {
        let mut purged = 0;
        for id in self.ids_older_than::<R>(cutoff).await? {
            if self.remove::<R>(&id).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub async fn count<R: Record>(&self) -> Result<usize, StoreError> {
        Ok(self
            .backend
            .scan_prefix(&record_prefix(R::COLLECTION))
            .await?
            .len())
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        owner: String,
        at: u64,
    }

    impl Record for Note {
        const COLLECTION: &'static str = "notes";

        fn record_id(&self) -> String {
            self.id.clone()
        }

        fn timestamp(&self) -> u64 {
            self.at
        }

        fn index_entries(&self) -> Vec<(&'static str, String)> {
            vec![("owner", self.owner.clone())]
        }
    }

    fn note(id: &str, owner: &str, at: u64) -> Note {
        Note {
            id: id.to_string(),
            owner: owner.to_string(),
            at,
        }
    }

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_all_is_newest_first_and_bounded() {
        let store = store();
        store.put(&note("a", "x", 10)).await.unwrap();
        store.put(&note("b", "x", 30)).await.unwrap();
        store.put(&note("c", "y", 20)).await.unwrap();

        let ids: Vec<_> = store
            .all::<Note>(Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_reindex_on_replace() {
        let store = store();
        store.put(&note("a", "x", 10)).await.unwrap();
        store.put(&note("a", "y", 50)).await.unwrap();

        assert!(store.find_by::<Note>("owner", "x").await.unwrap().is_empty());
        assert_eq!(store.find_by::<Note>("owner", "y").await.unwrap().len(), 1);
        assert!(store.ids_older_than::<Note>(20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_with_separators_round_trip() {
        let store = store();
        store.put(&note("peer/with/slashes", "own/er", 5)).await.unwrap();

        let found = store.find_by::<Note>("owner", "own/er").await.unwrap();
        assert_eq!(found, vec![note("peer/with/slashes", "own/er", 5)]);
    }

    #[tokio::test]
    async fn test_purge_older_than_keeps_recent() {
        let store = store();
        store.put(&note("old", "x", 100)).await.unwrap();
        store.put(&note("new", "x", 900)).await.unwrap();

        assert_eq!(store.purge_older_than::<Note>(500).await.unwrap(), 1);
        assert!(store.get::<Note>("old").await.unwrap().is_none());
        assert!(store.get::<Note>("new").await.unwrap().is_some());
        assert_eq!(store.count::<Note>().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_is_false() {
        let store = store();
        assert!(!store.remove::<Note>("nope").await.unwrap());
    }
}
