// src/delivery/smtp.rs
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::AsyncSmtpTransport;
use lettre::{AsyncTransport, Message, Tokio1Executor};
use metrics::counter;

use super::{DeliveryReceipt, DeliveryService};
use crate::compile::Artifact;
use crate::config::SmtpConfig;
use crate::error::{PipelineError, Result};
use crate::telemetry::anon_hash;

/// One message per recipient; the receipt tallies each send.
pub struct SmtpDelivery {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl SmtpDelivery {
    pub fn new(cfg: &SmtpConfig) -> Result<Self> {
        let builder = if cfg.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
        }
        .map_err(|e| PipelineError::Config(format!("SMTP_HOST {}: {e}", cfg.host)))?
        .port(cfg.port);
        let builder = match (&cfg.username, &cfg.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => builder,
        };

        let from: Mailbox = cfg
            .from
            .parse()
            .map_err(|e| PipelineError::Config(format!("SMTP_FROM: {e}")))?;
        let recipients = cfg
            .recipients
            .iter()
            .map(|r| {
                r.parse::<Mailbox>()
                    .map_err(|e| PipelineError::Config(format!("recipient {}: {e}", anon_hash(r))))
            })
            .collect::<Result<Vec<_>>>()?;
        if recipients.is_empty() {
            return Err(PipelineError::Config("DELIVERY_RECIPIENTS is empty".into()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            recipients,
        })
    }

    fn message(&self, to: &Mailbox, artifact: &Artifact) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(to.clone())
            .subject(artifact.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                artifact.text.clone(),
                artifact.html.clone(),
            ))
            .map_err(|e| PipelineError::InvalidInput(format!("build email: {e}")))
    }
}

#[async_trait]
impl DeliveryService for SmtpDelivery {
    async fn send(&self, artifact: &Artifact) -> Result<DeliveryReceipt> {
        let mut receipt = DeliveryReceipt::default();
        for to in &self.recipients {
            let sent = match self.message(to, artifact) {
                Ok(msg) => self.mailer.send(msg).await.map(|_| ()).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match sent {
                Ok(()) => receipt.delivered += 1,
                Err(e) => {
                    receipt.failed += 1;
                    tracing::warn!(
                        target: "delivery",
                        recipient = %anon_hash(&to.email.to_string()),
                        error = %e,
                        "smtp send failed"
                    );
                }
            }
        }
        counter!("delivery_recipients_total", "outcome" => "delivered").increment(receipt.delivered);
        counter!("delivery_recipients_total", "outcome" => "failed").increment(receipt.failed);
        tracing::info!(
            target: "delivery",
            issue_id = %artifact.issue_id,
            delivered = receipt.delivered,
            failed = receipt.failed,
            "smtp delivery finished"
        );
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}
