// src/store/memory.rs
//! In-process record store. Used by tests and by local runs without `STORE_URL`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{Fields, Filter, Record, RecordStore, MAX_BATCH};
use crate::error::{PipelineError, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Record>>>,
    batch_sizes: Mutex<HashMap<String, Vec<usize>>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a dropped connection: every call fails as transient I/O.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Sizes of every batched create/update issued against `table`.
    pub fn batch_calls(&self, table: &str) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Every row of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn check_up(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Transient("memory store unavailable".into()));
        }
        Ok(())
    }

    fn record_batch(&self, table: &str, n: usize) -> Result<()> {
        if n > MAX_BATCH {
            return Err(PipelineError::InvalidInput(format!(
                "batch of {n} exceeds limit of {MAX_BATCH}"
            )));
        }
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .push(n);
        Ok(())
    }

    fn insert(&self, table: &str, fields: Fields) -> Record {
        let id = format!("rec{:06}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let rec = Record { id, fields };
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(table.to_string())
            .or_default()
            .push(rec.clone());
        rec
    }

    fn patch(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| PipelineError::NotFound(format!("{table}/{id}")))?;
        let rec = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("{table}/{id}")))?;
        for (k, v) in fields {
            rec.fields.insert(k, v);
        }
        Ok(rec.clone())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_records(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.check_up()?;
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = tables.get(table).map(Vec::as_slice).unwrap_or_default();
        let it = rows.iter().filter(|r| filter.matches(&r.fields)).cloned();
        Ok(match filter.max_records {
            Some(n) => it.take(n).collect(),
            None => it.collect(),
        })
    }

    async fn create_record(&self, table: &str, fields: Fields) -> Result<Record> {
        self.check_up()?;
        Ok(self.insert(table, fields))
    }

    async fn update_record(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        self.check_up()?;
        self.patch(table, id, fields)
    }

    async fn create_records(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<Record>> {
        self.check_up()?;
        self.record_batch(table, rows.len())?;
        Ok(rows.into_iter().map(|f| self.insert(table, f)).collect())
    }

    async fn update_records(
        &self,
        table: &str,
        rows: Vec<(String, Fields)>,
    ) -> Result<Vec<Record>> {
        self.check_up()?;
        self.record_batch(table, rows.len())?;
        rows.into_iter()
            .map(|(id, f)| self.patch(table, &id, f))
            .collect()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
