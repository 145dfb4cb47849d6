// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Raw item as a provider hands it over, before fingerprinting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FetchedItem {
    pub title: Option<String>,
    pub url: Option<String>,
    pub source: String, // e.g. "Reuters", "The Verge"
    /// Missing dates are stamped with the ingestion time.
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<FetchedItem>>;
    fn name(&self) -> &str;
}
