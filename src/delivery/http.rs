// src/delivery/http.rs
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::Serialize;

use super::{DeliveryReceipt, DeliveryService};
use crate::ai::sanitize_line;
use crate::compile::Artifact;
use crate::error::{PipelineError, Result};

/// Posts the artifact to a delivery API that answers with a receipt.
pub struct HttpDeliveryClient {
    url: String,
    token: String,
    client: Client,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    issue_id: &'a str,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

impl HttpDeliveryClient {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(PipelineError::Config("DELIVERY_URL is not set".into()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("delivery http client: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            token: token.to_string(),
            client,
        })
    }
}

#[async_trait]
impl DeliveryService for HttpDeliveryClient {
    async fn send(&self, artifact: &Artifact) -> Result<DeliveryReceipt> {
        let body = SendRequest {
            issue_id: &artifact.issue_id,
            subject: &artifact.subject,
            html: &artifact.html,
            text: &artifact.text,
        };
        let mut req = self.client.post(&self.url).json(&body);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("delivery returned {status}: {}", sanitize_line(&text, 200));
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                PipelineError::Transient(msg)
            } else {
                PipelineError::Fatal(msg)
            });
        }
        let receipt: DeliveryReceipt = resp
            .json()
            .await
            .map_err(|e| PipelineError::Malformed(format!("delivery receipt: {e}")))?;

        counter!("delivery_recipients_total", "outcome" => "delivered").increment(receipt.delivered);
        counter!("delivery_recipients_total", "outcome" => "failed").increment(receipt.failed);
        tracing::info!(
            target: "delivery",
            issue_id = %artifact.issue_id,
            delivered = receipt.delivered,
            failed = receipt.failed,
            "delivery api answered"
        );
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use chrono::NaiveDate;

    async fn serve(receipt: serde_json::Value) -> String {
        let app = Router::new().route(
            "/send",
            post(move |Json(body): Json<serde_json::Value>| {
                let receipt = receipt.clone();
                async move {
                    assert_eq!(body["issue_id"], "2026-10-17");
                    Json(receipt)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/send")
    }

    fn artifact() -> Artifact {
        Artifact {
            issue_id: "2026-10-17".into(),
            date: NaiveDate::from_ymd_opt(2026, 10, 17).unwrap(),
            subject: "Daily".into(),
            html: "<p>x</p>".into(),
            text: "x".into(),
            stories: 1,
        }
    }

    #[tokio::test]
    async fn receipt_is_passed_through() {
        let url = serve(serde_json::json!({"delivered": 0, "failed": 500})).await;
        let client = HttpDeliveryClient::new(&url, "t", Duration::from_secs(5)).unwrap();
        let r = client.send(&artifact()).await.unwrap();
        assert_eq!(r, DeliveryReceipt { delivered: 0, failed: 500 });
        assert!(!r.is_complete());
    }

    #[test]
    fn url_is_required() {
        assert!(HttpDeliveryClient::new(" ", "t", Duration::from_secs(1)).is_err());
    }
}
