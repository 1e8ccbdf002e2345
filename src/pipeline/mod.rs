//! The routing-and-enrichment pipeline applied to one incoming message.
//!
//! ```text
//! Received -> Decoded -> Validated -> Normalized -> Archived? -> Classified?
//!          -> (Dropped | Notified -> Routed -> Forwarded)
//! ```
//!
//! Archival and classification are optional and best-effort: their outcome is
//! recorded as a [`StepOutcome`] and never aborts the run. Every other failure
//! is returned as a [`PipelineError`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Utc};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::archive::{self, ArchiveSink, S3Archive};
use crate::classifier::{self, Classifier, OpenAiClassifier};
use crate::config::Config;
use crate::error::{ConfigError, PipelineError};
use crate::forward::{MailTransport, RelaySettings, SmtpRelay};
use crate::http::HttpClient;
use crate::mail::{self, IncomingMessage, ParsedEmail};
use crate::notify::{ChatChannel, NotificationMessage, Notifier, TelegramNotifier};
use crate::routing::RoutingTable;

/// Options read on every invocation.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Serialized [`RoutingTable`]. Required.
    pub routing_table_json: Option<String>,
    /// Chat credential. Required.
    pub notification_token: Option<String>,
    /// Chat the notification goes to. Required.
    pub notification_channel: Option<String>,
    /// Enables classification.
    pub classifier_api_key: Option<String>,
    /// Enables archival.
    pub archive_bucket: Option<String>,
    pub blocked_senders: Vec<String>,
    /// Refuse messages that decode to zero attachments.
    pub require_attachments: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalAction {
    Forwarded(String),
    Dropped,
    Rejected(String),
}

/// Result of an optional step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Completed(T),
    Skipped,
    Failed(String),
}

impl<T> StepOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingReport {
    pub action: TerminalAction,
    /// Keys written to the archive.
    pub archival: StepOutcome<Vec<String>>,
    /// Raw classifier output.
    pub classification: StepOutcome<String>,
}

impl ProcessingReport {
    fn rejected(reason: &str) -> Self {
        Self {
            action: TerminalAction::Rejected(reason.to_string()),
            archival: StepOutcome::Skipped,
            classification: StepOutcome::Skipped,
        }
    }
}

/// Configuration that passed the up-front checks.
struct Preconditions {
    table: RoutingTable,
    channel: ChatChannel,
}

fn check_preconditions(config: &PipelineConfig) -> Result<Preconditions, ConfigError> {
    let raw_table = config
        .routing_table_json
        .as_deref()
        .filter(|raw| !raw.trim().is_empty())
        .ok_or(ConfigError::Missing("routing table"))?;
    let table = RoutingTable::from_json(raw_table)?;

    let token = non_empty(&config.notification_token).ok_or(ConfigError::Missing("notification token"))?;
    let chat_id =
        non_empty(&config.notification_channel).ok_or(ConfigError::Missing("notification channel"))?;

    Ok(Preconditions {
        table,
        channel: ChatChannel {
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        },
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// The external collaborators one invocation talks to.
pub struct Pipeline {
    archive: Arc<dyn ArchiveSink>,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn MailTransport>,
}

impl Pipeline {
    pub fn new(
        archive: Arc<dyn ArchiveSink>,
        classifier: Arc<dyn Classifier>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            archive,
            classifier,
            notifier,
            transport,
        }
    }

    /// Wires the production collaborators described by `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let http = Arc::new(HttpClient::new(Duration::from_secs(config.http_timeout_secs))?);
        let archive = S3Archive::from_env(config.s3_endpoint.as_deref()).await;
        let classifier = OpenAiClassifier::new(http.clone(), &config.openai_base_url, &config.openai_model);
        let notifier = TelegramNotifier::new(http, &config.telegram_api_url);
        let transport = SmtpRelay::new(&RelaySettings {
            host: config.relay_host.clone(),
            port: config.relay_port,
            username: config.relay_username.clone(),
            password: config.relay_password.clone(),
            tls: config.relay_tls,
        })?;

        Ok(Self::new(
            Arc::new(archive),
            Arc::new(classifier),
            Arc::new(notifier),
            Arc::new(transport),
        ))
    }

    /// Drives `message` to a terminal action.
    pub async fn process_message(
        &self,
        message: &IncomingMessage,
        config: &PipelineConfig,
    ) -> Result<ProcessingReport, PipelineError> {
        let span = info_span!(
            "invocation",
            id = %Uuid::new_v4(),
            sender = %message.sender,
            recipient = %message.recipient
        );
        self.run(message, config).instrument(span).await
    }

    async fn run(
        &self,
        message: &IncomingMessage,
        config: &PipelineConfig,
    ) -> Result<ProcessingReport, PipelineError> {
        let Preconditions { table, channel } = check_preconditions(config)?;

        if config.blocked_senders.iter().any(|blocked| blocked == &message.sender) {
            info!("Sender is blocked, rejecting");
            return Ok(ProcessingReport::rejected("blocked sender"));
        }

        let parsed = mail::decode(&message.raw)?;
        if config.require_attachments && parsed.attachments.is_empty() {
            warn!(subject = %message.subject, "Message has no attachments, refusing");
            return Err(PipelineError::Validation("no attachments".to_string()));
        }

        let body = mail::normalize_body(&parsed);
        let archival = self.archive_step(config, message, &parsed).await;
        let classification = self.classification_step(config, body.as_deref()).await;

        let notification = match &classification {
            StepOutcome::Completed(summary) => {
                NotificationMessage::new(&message.sender, &message.subject).with_summary(summary)
            }
            _ => NotificationMessage::new(&message.sender, &message.subject),
        };

        if matches!(&classification, StepOutcome::Completed(text) if classifier::is_spam(text)) {
            info!(subject = %message.subject, "Classifier flagged message as spam, dropping");
            return Ok(ProcessingReport {
                action: TerminalAction::Dropped,
                archival,
                classification,
            });
        }

        self.notifier
            .send(&channel, notification.as_str())
            .await
            .map_err(|e| PipelineError::Notification(format!("{:#}", e)))?;

        let destination = table.resolve_destination(&message.sender).to_string();
        info!(destination = %destination, "Forwarding message");
        self.transport
            .forward(message, &destination)
            .await
            .map_err(|e| PipelineError::Forward {
                destination: destination.clone(),
                reason: format!("{:#}", e),
            })?;

        Ok(ProcessingReport {
            action: TerminalAction::Forwarded(destination),
            archival,
            classification,
        })
    }

    async fn archive_step(
        &self,
        config: &PipelineConfig,
        message: &IncomingMessage,
        parsed: &ParsedEmail,
    ) -> StepOutcome<Vec<String>> {
        let Some(bucket) = config.archive_bucket.as_deref() else {
            return StepOutcome::Skipped;
        };

        let year = Utc::now().year();
        match archive::store_email(
            self.archive.as_ref(),
            bucket,
            year,
            &message.sender,
            &message.subject,
            parsed,
        )
        .await
        {
            Ok(keys) => {
                info!(bucket, objects = keys.len(), "Archived message");
                StepOutcome::Completed(keys)
            }
            Err(e) => {
                warn!(bucket, "Archival failed, continuing without it: {:#}", e);
                StepOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn classification_step(&self, config: &PipelineConfig, body: Option<&str>) -> StepOutcome<String> {
        let Some(api_key) = config.classifier_api_key.as_deref() else {
            return StepOutcome::Skipped;
        };
        let Some(body) = body.filter(|b| !b.trim().is_empty()) else {
            info!("No text to classify, skipping summary");
            return StepOutcome::Skipped;
        };

        match self.classifier.classify(api_key, body).await {
            Ok(text) => {
                info!("Summary created");
                StepOutcome::Completed(text)
            }
            Err(e) => {
                warn!("Classification failed, continuing without summary: {:#}", e);
                StepOutcome::Failed(format!("{:#}", e))
            }
        }
    }
}
