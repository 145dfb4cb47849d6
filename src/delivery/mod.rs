// src/delivery/mod.rs
//! Hand a compiled issue to subscribers and report how many were reached.
//!
//! An issue counts as sent only when at least one recipient got it and none
//! failed; anything else is partial delivery.

pub mod http;
pub mod smtp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::compile::Artifact;
use crate::config::DeliveryConfig;
use crate::error::{PipelineError, Result};

pub use http::HttpDeliveryClient;
pub use smtp::SmtpDelivery;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryReceipt {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.delivered > 0
    }
}

#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn send(&self, artifact: &Artifact) -> Result<DeliveryReceipt>;

    fn name(&self) -> &'static str;
}

/// No delivery configured.
pub struct DisabledDelivery;

#[async_trait]
impl DeliveryService for DisabledDelivery {
    async fn send(&self, _artifact: &Artifact) -> Result<DeliveryReceipt> {
        Err(PipelineError::Config("DELIVERY_MODE is not set".into()))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

pub fn from_config(cfg: &DeliveryConfig, timeout: Duration) -> Result<Arc<dyn DeliveryService>> {
    Ok(match cfg {
        DeliveryConfig::Disabled => Arc::new(DisabledDelivery),
        DeliveryConfig::Http { url, token } => Arc::new(HttpDeliveryClient::new(url, token, timeout)?),
        DeliveryConfig::Smtp(smtp) => Arc::new(SmtpDelivery::new(smtp)?),
    })
}
