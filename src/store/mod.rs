// src/store/mod.rs
//! Generic tabular record store contract.
//!
//! The pipeline only relies on create / read / update / filter over named
//! tables of JSON fields; vendor metadata beyond the record `id` is ignored.
//! Batched writes are capped at [`MAX_BATCH`] rows per call, so callers go
//! through [`create_chunked`] / [`update_chunked`].

pub mod http;
pub mod memory;
pub mod repo;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;

pub use http::HttpRecordStore;
pub use memory::MemoryStore;
pub use repo::{Repository, Stored};

/// Largest batch a single create/update call accepts.
pub const MAX_BATCH: usize = 10;

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            PipelineError::Malformed(format!("record {} does not decode: {e}", self.id))
        })
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Equality conjunction plus an optional row cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub equals: Vec<(String, Value)>,
    pub max_records: Option<usize>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.equals.push((field.to_string(), value.into()));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.max_records = Some(n);
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| fields.get(k).unwrap_or(&Value::Null) == v)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_records(&self, table: &str, filter: &Filter) -> Result<Vec<Record>>;

    async fn create_record(&self, table: &str, fields: Fields) -> Result<Record>;

    async fn update_record(&self, table: &str, id: &str, fields: Fields) -> Result<Record>;

    /// At most [`MAX_BATCH`] rows.
    async fn create_records(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<Record>>;

    /// At most [`MAX_BATCH`] rows.
    async fn update_records(&self, table: &str, rows: Vec<(String, Fields)>)
        -> Result<Vec<Record>>;

    fn name(&self) -> &'static str;
}

/// Serialize a domain value into a field map.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(PipelineError::InvalidInput(format!(
            "expected an object to store, got {other}"
        ))),
    }
}

/// Create any number of rows, [`MAX_BATCH`] at a time, in order.
/// See [`create_keyed`] for how a retried chunk avoids duplicates.
pub async fn create_chunked(
    store: &dyn RecordStore,
    retry: &RetryPolicy,
    table: &str,
    key: &[&str],
    rows: Vec<Fields>,
) -> Result<Vec<Record>> {
    let mut out = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(MAX_BATCH) {
        out.extend(create_keyed(store, retry, table, key, chunk).await?);
    }
    Ok(out)
}

/// Create up to [`MAX_BATCH`] rows under `retry`.
///
/// A failed attempt may still have been committed by the store, so every
/// re-send first looks each row up by its `key` fields and only sends the
/// rows that are missing. Rows found that way are returned as created.
pub async fn create_keyed(
    store: &dyn RecordStore,
    retry: &RetryPolicy,
    table: &str,
    key: &[&str],
    rows: &[Fields],
) -> Result<Vec<Record>> {
    let resend = AtomicBool::new(false);
    retry
        .run("store.create_records", || {
            let resend = &resend;
            async move {
                let mut found: Vec<Option<Record>> = vec![None; rows.len()];
                if resend.swap(true, Ordering::SeqCst) {
                    for (slot, row) in found.iter_mut().zip(rows) {
                        *slot = find_by_key(store, table, key, row).await?;
                    }
                }
                let missing: Vec<Fields> = rows
                    .iter()
                    .zip(&found)
                    .filter(|(_, f)| f.is_none())
                    .map(|(r, _)| r.clone())
                    .collect();
                let mut created = if missing.is_empty() {
                    Vec::new().into_iter()
                } else {
                    store.create_records(table, missing).await?.into_iter()
                };
                let out: Result<Vec<Record>> = found
                    .into_iter()
                    .map(|f| {
                        f.or_else(|| created.next()).ok_or_else(|| {
                            PipelineError::Malformed(format!("{table}: store returned fewer rows than sent"))
                        })
                    })
                    .collect();
                out
            }
        })
        .await
}

/// The stored row whose `key` fields equal those of `row`, if any.
async fn find_by_key(store: &dyn RecordStore, table: &str, key: &[&str], row: &Fields) -> Result<Option<Record>> {
    if key.is_empty() {
        return Ok(None);
    }
    let filter = key.iter().fold(Filter::all().limit(1), |f, k| {
        f.eq(k, row.get(*k).cloned().unwrap_or(Value::Null))
    });
    Ok(store.list_records(table, &filter).await?.into_iter().next())
}

/// Update any number of rows, [`MAX_BATCH`] at a time, in order.
pub async fn update_chunked(
    store: &dyn RecordStore,
    retry: &RetryPolicy,
    table: &str,
    rows: Vec<(String, Fields)>,
) -> Result<Vec<Record>> {
    let mut out = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(MAX_BATCH) {
        let updated = retry
            .run("store.update_records", || {
                store.update_records(table, chunk.to_vec())
            })
            .await?;
        out.extend(updated);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_on_all_pairs() {
        let mut f = Fields::new();
        f.insert("issue_id".into(), json!("2026-10-17"));
        f.insert("slot".into(), json!(2));

        assert!(Filter::all().matches(&f));
        assert!(Filter::all().eq("issue_id", "2026-10-17").matches(&f));
        assert!(!Filter::all()
            .eq("issue_id", "2026-10-17")
            .eq("slot", 3)
            .matches(&f));
        assert!(!Filter::all().eq("missing", true).matches(&f));
    }

    #[tokio::test]
    async fn chunked_create_respects_batch_cap() {
        let store = MemoryStore::new();
        let rows: Vec<Fields> = (0..23)
            .map(|i| to_fields(&json!({ "n": i })).unwrap())
            .collect();
        let created = create_chunked(&store, &RetryPolicy::default(), "t", &["n"], rows)
            .await
            .unwrap();
        assert_eq!(created.len(), 23);
        assert_eq!(store.batch_calls("t"), vec![10, 10, 3]);

        let listed = store.list_records("t", &Filter::all()).await.unwrap();
        let ns: Vec<i64> = listed
            .iter()
            .map(|r| r.fields["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, (0..23).collect::<Vec<_>>());
    }

    /// Commits every write, then reports the first `drops` of them as a
    /// dropped connection.
    struct CommitThenDrop {
        inner: MemoryStore,
        drops: std::sync::atomic::AtomicU32,
    }

    impl CommitThenDrop {
        fn dropped<T>(&self, ok: T) -> Result<T> {
            let left = self.drops.load(Ordering::SeqCst);
            if left > 0 {
                self.drops.store(left - 1, Ordering::SeqCst);
                return Err(PipelineError::Transient("connection reset after commit".into()));
            }
            Ok(ok)
        }
    }

    #[async_trait]
    impl RecordStore for CommitThenDrop {
        async fn list_records(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
            self.inner.list_records(table, filter).await
        }

        async fn create_record(&self, table: &str, fields: Fields) -> Result<Record> {
            let rec = self.inner.create_record(table, fields).await?;
            self.dropped(rec)
        }

        async fn update_record(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
            self.inner.update_record(table, id, fields).await
        }

        async fn create_records(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<Record>> {
            let recs = self.inner.create_records(table, rows).await?;
            self.dropped(recs)
        }

        async fn update_records(&self, table: &str, rows: Vec<(String, Fields)>) -> Result<Vec<Record>> {
            self.inner.update_records(table, rows).await
        }

        fn name(&self) -> &'static str {
            "commit-then-drop"
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default().with_base_delay(std::time::Duration::from_millis(1))
    }

    #[tokio::test]
    async fn resent_chunk_after_committed_failure_is_not_duplicated() {
        let store = CommitThenDrop {
            inner: MemoryStore::new(),
            drops: 1.into(),
        };
        let rows = vec![
            to_fields(&json!({ "fingerprint": "p_abc", "title": "a" })).unwrap(),
            to_fields(&json!({ "fingerprint": "p_def", "title": "b" })).unwrap(),
        ];
        let created = create_chunked(&store, &fast_retry(), "candidates", &["fingerprint"], rows)
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].str_field("fingerprint"), Some("p_abc"));

        let stored = store.inner.rows("candidates");
        assert_eq!(stored.len(), 2);
        let abc = stored.iter().filter(|r| r.str_field("fingerprint") == Some("p_abc")).count();
        assert_eq!(abc, 1);
        // The re-send found everything and sent nothing.
        assert_eq!(store.inner.batch_calls("candidates"), vec![2]);
    }

    #[tokio::test]
    async fn key_lookup_matches_every_key_field() {
        let store = CommitThenDrop {
            inner: MemoryStore::new(),
            drops: 0.into(),
        };
        let slot_one = to_fields(&json!({ "issue_id": "i", "slot": 1, "fingerprint": "p_1" })).unwrap();
        create_keyed(&store, &fast_retry(), "selected_slots", &["issue_id", "slot"], &[slot_one])
            .await
            .unwrap();

        store.drops.store(1, Ordering::SeqCst);
        let slot_two = to_fields(&json!({ "issue_id": "i", "slot": 2, "fingerprint": "p_2" })).unwrap();
        let created = create_keyed(&store, &fast_retry(), "selected_slots", &["issue_id", "slot"], &[slot_two])
            .await
            .unwrap();
        assert_eq!(created[0].str_field("fingerprint"), Some("p_2"));

        let slots: Vec<u64> = store
            .inner
            .rows("selected_slots")
            .iter()
            .filter_map(|r| r.fields["slot"].as_u64())
            .collect();
        assert_eq!(slots, vec![1, 2]);
    }
}
