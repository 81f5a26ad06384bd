use async_trait::async_trait;
use pkg_constants::state::{SEQUENCE_CAS_ATTEMPTS, SEQUENCES_PREFIX};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Ordered key/value persistence used by the ledger and the cluster registry.
///
/// Single-key writes are atomic. Read-modify-write across processes goes
/// through `compare_and_put`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a value under the given key.
    async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    /// Retrieve the value for a key, or `None` if it does not exist.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// List all key-value pairs whose keys start with `prefix`, in key order.
    async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    /// Write `value` only if the key currently holds `expected` (`None`: the
    /// key is absent). Returns `false` and writes nothing when another writer
    /// got there first. The check and the write are one atomic step in the
    /// backing store.
    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> anyhow::Result<bool>;

    /// Insert `value` unless the key already exists.
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> anyhow::Result<bool> {
        self.compare_and_put(key, None, value).await
    }
}

/// A stored value that no longer decodes. Retrying cannot fix it.
#[derive(Debug, thiserror::Error)]
#[error("Corrupt record at {key}: {source}")]
pub struct CorruptRecord {
    pub key: String,
    #[source]
    pub source: serde_json::Error,
}

fn decode<T: DeserializeOwned>(key: &str, data: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(data).map_err(|source| {
        CorruptRecord {
            key: key.to_string(),
            source,
        }
        .into()
    })
}

/// Fetch and decode a JSON value.
pub async fn get_json<T, S>(store: &S, key: &str) -> anyhow::Result<Option<T>>
where
    T: DeserializeOwned,
    S: KvStore + ?Sized,
{
    match store.get(key).await? {
        Some(data) => Ok(Some(decode(key, &data)?)),
        None => Ok(None),
    }
}

/// Encode and store a JSON value.
pub async fn put_json<T, S>(store: &S, key: &str, value: &T) -> anyhow::Result<()>
where
    T: Serialize,
    S: KvStore + ?Sized,
{
    let data = serde_json::to_vec(value)?;
    store.put(key, &data).await
}

/// Fetch and decode a JSON value together with the bytes it was stored as,
/// for a later `compare_and_put_json`.
pub async fn get_json_versioned<T, S>(store: &S, key: &str) -> anyhow::Result<Option<(T, Vec<u8>)>>
where
    T: DeserializeOwned,
    S: KvStore + ?Sized,
{
    match store.get(key).await? {
        Some(data) => Ok(Some((decode(key, &data)?, data))),
        None => Ok(None),
    }
}

/// Encode `value` and store it only if the key still holds `expected`.
pub async fn compare_and_put_json<T, S>(
    store: &S,
    key: &str,
    expected: Option<&[u8]>,
    value: &T,
) -> anyhow::Result<bool>
where
    T: Serialize,
    S: KvStore + ?Sized,
{
    let data = serde_json::to_vec(value)?;
    store.compare_and_put(key, expected, &data).await
}

/// Decode every JSON value under `prefix`, returning `(key, value)` pairs.
pub async fn list_json<T, S>(store: &S, prefix: &str) -> anyhow::Result<Vec<(String, T)>>
where
    T: DeserializeOwned,
    S: KvStore + ?Sized,
{
    let entries = store.list_prefix(prefix).await?;
    let mut results = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let decoded = decode(&key, &value)?;
        results.push((key, decoded));
    }
    Ok(results)
}

/// Allocate the next id of a named sequence, starting at 1.
///
/// The counter advances with `compare_and_put`, so concurrent allocators on
/// the same store never hand out the same id.
pub async fn next_sequence<S>(store: &S, kind: &str) -> anyhow::Result<i64>
where
    S: KvStore + ?Sized,
{
    let key = format!("{}{}", SEQUENCES_PREFIX, kind);
    for _ in 0..SEQUENCE_CAS_ATTEMPTS {
        let raw = store.get(&key).await?;
        let current: i64 = match &raw {
            Some(data) => decode(&key, data)?,
            None => 0,
        };
        let next = current + 1;
        let data = serde_json::to_vec(&next)?;
        if store.compare_and_put(&key, raw.as_deref(), &data).await? {
            return Ok(next);
        }
        debug!("Sequence {} moved under us, retrying", kind);
    }
    anyhow::bail!(
        "Sequence {} still contended after {} attempts",
        kind,
        SEQUENCE_CAS_ATTEMPTS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sequences_are_independent() {
        let store = MemoryStore::new();
        assert_eq!(next_sequence(&store, "clusters").await.unwrap(), 1);
        assert_eq!(next_sequence(&store, "clusters").await.unwrap(), 2);
        assert_eq!(next_sequence(&store, "services").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let store = MemoryStore::new();
        store.put("/registry/x", b"not json").await.unwrap();
        let res: anyhow::Result<Option<i64>> = get_json(&store, "/registry/x").await;
        let err = res.unwrap_err();
        let corrupt = err.downcast_ref::<CorruptRecord>().unwrap();
        assert_eq!(corrupt.key, "/registry/x");
    }

    #[tokio::test]
    async fn test_concurrent_sequences_are_distinct() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                next_sequence(store.as_ref(), "services").await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort();
        assert_eq!(ids, (1..=20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_first_value() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("/k", b"one").await.unwrap());
        assert!(!store.put_if_absent("/k", b"two").await.unwrap());
        assert_eq!(store.get("/k").await.unwrap().unwrap(), b"one");

        assert!(!store.compare_and_put("/k", Some(&b"two"[..]), b"three").await.unwrap());
        assert!(store.compare_and_put("/k", Some(&b"one"[..]), b"three").await.unwrap());
        assert_eq!(store.get("/k").await.unwrap().unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_list_json_in_key_order() {
        let store = MemoryStore::new();
        put_json(&store, "/a/2", &2).await.unwrap();
        put_json(&store, "/a/1", &1).await.unwrap();
        put_json(&store, "/b/1", &9).await.unwrap();
        let values: Vec<(String, i64)> = list_json(&store, "/a/").await.unwrap();
        assert_eq!(
            values,
            vec![("/a/1".to_string(), 1), ("/a/2".to_string(), 2)]
        );
    }
}
