//! Delivery of accepted messages to their routed destination over an SMTP relay.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{info, warn};

use crate::mail::IncomingMessage;

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Delivers `message` unchanged to `destination`.
    async fn forward(&self, message: &IncomingMessage, destination: &str) -> Result<()>;
}

/// Relay settings for [`SmtpRelay`].
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
}

pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    pub fn new(settings: &RelaySettings) -> Result<Self> {
        let mut builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .with_context(|| format!("Invalid relay host '{}'", settings.host))?
        } else {
            warn!("Relaying to {} without TLS", settings.host);
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };
        builder = builder.port(settings.port);

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

/// Envelope for a forward: the original sender (when it is a valid address)
/// to the routed destination.
fn envelope(sender: &str, destination: &str) -> Result<Envelope> {
    let to: Address = destination
        .parse()
        .with_context(|| format!("Invalid destination address '{}'", destination))?;
    let from = match sender.parse::<Address>() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!(sender, "Sender is not a valid envelope address, using null sender: {}", e);
            None
        }
    };
    Envelope::new(from, vec![to]).context("Failed to build forward envelope")
}

#[async_trait]
impl MailTransport for SmtpRelay {
    async fn forward(&self, message: &IncomingMessage, destination: &str) -> Result<()> {
        let envelope = envelope(&message.sender, destination)?;
        let response = self
            .transport
            .send_raw(&envelope, &message.raw)
            .await
            .with_context(|| format!("Relay refused message for {}", destination))?;

        info!(
            destination,
            code = %response.code(),
            "Message relayed"
        );
        Ok(())
    }
}
