// src/store/http.rs
//! Record store over an HTTP JSON API (`{records:[{id, fields}]}` envelope,
//! `offset` pagination, formula filters).
//!
//! Idle cloud connections get dropped silently, so the client keeps TCP
//! keep-alive on, recycles idle pooled connections early, and refuses
//! anything but TLS unless explicitly told the store is local.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Fields, Filter, Record, RecordStore, MAX_BATCH};
use crate::config::StoreConfig;
use crate::error::{PipelineError, Result};

pub struct HttpRecordStore {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Deserialize)]
struct RecordsEnvelope {
    #[serde(default)]
    records: Vec<Record>,
}

#[derive(Serialize)]
struct NewRow {
    fields: Fields,
}

#[derive(Serialize)]
struct PatchRow {
    id: String,
    fields: Fields,
}

impl HttpRecordStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("issue-pipeline/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(45))
            .connect_timeout(Duration::from_secs(5))
            .timeout(cfg.request_timeout)
            .https_only(!cfg.allow_insecure)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .build()
            .map_err(|e| PipelineError::Config(format!("store http client: {e}")))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, table))
            .bearer_auth(&self.token)
    }

    async fn send<T: for<'de> Deserialize<'de>>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| String::from("unknown error"));
            return Err(PipelineError::Store {
                status: status.as_u16(),
                message,
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::Malformed(format!("store response: {e}")))
    }
}

/// Equality conjunction rendered as a store formula: `AND({a}='x',{b}=2)`.
pub fn filter_formula(filter: &Filter) -> Option<String> {
    if filter.equals.is_empty() {
        return None;
    }
    let terms: Vec<String> = filter
        .equals
        .iter()
        .map(|(field, value)| {
            let rhs = match value {
                Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
                Value::Bool(true) => "TRUE()".to_string(),
                Value::Bool(false) => "FALSE()".to_string(),
                Value::Null => "BLANK()".to_string(),
                other => other.to_string(),
            };
            format!("{{{field}}}={rhs}")
        })
        .collect();
    Some(if terms.len() == 1 {
        terms.into_iter().next().unwrap_or_default()
    } else {
        format!("AND({})", terms.join(","))
    })
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn list_records(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        let formula = filter_formula(filter);
        let mut out = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(f) = &formula {
                query.push(("filterByFormula", f.clone()));
            }
            if let Some(n) = filter.max_records {
                query.push(("maxRecords", n.to_string()));
            }
            if let Some(o) = &offset {
                query.push(("offset", o.clone()));
            }
            let page: ListPage = self
                .send(self.request(Method::GET, table).query(&query))
                .await?;
            out.extend(page.records);
            match page.offset {
                Some(next) if filter.max_records.is_none_or(|n| out.len() < n) => {
                    offset = Some(next)
                }
                _ => break,
            }
        }
        if let Some(n) = filter.max_records {
            out.truncate(n);
        }
        Ok(out)
    }

    async fn create_record(&self, table: &str, fields: Fields) -> Result<Record> {
        let mut created = self.create_records(table, vec![fields]).await?;
        created
            .pop()
            .ok_or_else(|| PipelineError::Malformed("store created no record".into()))
    }

    async fn update_record(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        let mut updated = self
            .update_records(table, vec![(id.to_string(), fields)])
            .await?;
        updated
            .pop()
            .ok_or_else(|| PipelineError::Malformed("store updated no record".into()))
    }

    async fn create_records(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<Record>> {
        if rows.len() > MAX_BATCH {
            return Err(PipelineError::InvalidInput(format!(
                "batch of {} exceeds limit of {MAX_BATCH}",
                rows.len()
            )));
        }
        let body = serde_json::json!({
            "records": rows.into_iter().map(|fields| NewRow { fields }).collect::<Vec<_>>(),
        });
        let env: RecordsEnvelope = self
            .send(self.request(Method::POST, table).json(&body))
            .await?;
        Ok(env.records)
    }

    async fn update_records(
        &self,
        table: &str,
        rows: Vec<(String, Fields)>,
    ) -> Result<Vec<Record>> {
        if rows.len() > MAX_BATCH {
            return Err(PipelineError::InvalidInput(format!(
                "batch of {} exceeds limit of {MAX_BATCH}",
                rows.len()
            )));
        }
        let body = serde_json::json!({
            "records": rows
                .into_iter()
                .map(|(id, fields)| PatchRow { id, fields })
                .collect::<Vec<_>>(),
        });
        let env: RecordsEnvelope = self
            .send(self.request(Method::PATCH, table).json(&body))
            .await?;
        Ok(env.records)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_quotes_strings_and_joins_terms() {
        assert_eq!(filter_formula(&Filter::all()), None);
        assert_eq!(
            filter_formula(&Filter::all().eq("issue_id", "it's")).as_deref(),
            Some(r"{issue_id}='it\'s'")
        );
        assert_eq!(
            filter_formula(&Filter::all().eq("slot", 2).eq("eligible", true)).as_deref(),
            Some("AND({slot}=2,{eligible}=TRUE())")
        );
    }

    #[test]
    fn insecure_base_url_is_refused_by_default() {
        let cfg = StoreConfig {
            base_url: "http://store.example".into(),
            token: "t".into(),
            request_timeout: Duration::from_secs(5),
            allow_insecure: false,
        };
        // Building succeeds; the https-only policy is enforced per request.
        assert!(HttpRecordStore::new(&cfg).is_ok());
    }
}
