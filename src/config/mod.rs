use std::env;
use anyhow::{Result, anyhow};
use serde::{Serialize, Deserialize};

use crate::pipeline::PipelineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The email addresses to accept mail for
    pub target_emails: Vec<String>,

    /// The address to bind the SMTP server to
    pub smtp_bind_address: String,

    /// The port to bind the SMTP server to
    pub smtp_port: u16,

    /// The address to bind the health check server to
    pub health_check_bind_address: String,

    /// The port to bind the health check server to
    pub health_check_port: u16,

    /// SMTP relay used to deliver forwarded mail
    pub relay_host: String,
    pub relay_port: u16,
    pub relay_username: Option<String>,
    pub relay_password: Option<String>,
    pub relay_tls: bool,

    /// Serialized routing table. Validated per message, not here.
    pub routing_table_json: Option<String>,

    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_api_url: String,

    /// Enables summaries and spam classification when set
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,

    /// Enables archival when set
    pub archive_bucket: Option<String>,
    /// Custom S3 endpoint (R2, MinIO, ...)
    pub s3_endpoint: Option<String>,

    pub blocked_senders: Vec<String>,
    pub require_attachments: bool,

    /// Per-request timeout for the classifier and notifier calls
    pub http_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let target_emails = parse_list(&required("MAIL_COURIER_TARGET_EMAILS")?);
        if target_emails.is_empty() {
            let err_msg = "MAIL_COURIER_TARGET_EMAILS must contain at least one address";
            log::error!("{}", err_msg);
            return Err(anyhow!(err_msg));
        }
        log::info!("Config: Using target_emails: {:?}", target_emails);

        let smtp_bind_address = with_default("MAIL_COURIER_BIND_ADDRESS", "0.0.0.0");
        let smtp_port = parse_var("MAIL_COURIER_PORT", "2525")?;
        let health_check_bind_address = with_default("MAIL_COURIER_HEALTH_BIND_ADDRESS", "0.0.0.0");
        let health_check_port = parse_var("MAIL_COURIER_HEALTH_PORT", "8080")?;

        let relay_host = required("MAIL_COURIER_RELAY_HOST")?;
        log::info!("Config: Using relay_host: {}", relay_host);
        let relay_port = parse_var("MAIL_COURIER_RELAY_PORT", "587")?;
        let relay_username = optional("MAIL_COURIER_RELAY_USERNAME");
        let relay_password = optional("MAIL_COURIER_RELAY_PASSWORD");
        let relay_tls = parse_bool("MAIL_COURIER_RELAY_TLS", true)?;

        let routing_table_json = optional("MAIL_COURIER_ROUTING_TABLE");
        if routing_table_json.is_none() {
            log::warn!("Config: MAIL_COURIER_ROUTING_TABLE is not set, every message will be refused");
        }

        let telegram_token = optional("MAIL_COURIER_TELEGRAM_TOKEN");
        if telegram_token.is_none() {
            log::warn!("Config: MAIL_COURIER_TELEGRAM_TOKEN is not set, every message will be refused");
        }
        let telegram_chat_id = optional("MAIL_COURIER_TELEGRAM_CHAT_ID");
        let telegram_api_url = with_default("MAIL_COURIER_TELEGRAM_API_URL", "https://api.telegram.org");

        let openai_api_key = optional("MAIL_COURIER_OPENAI_API_KEY");
        log::info!("Config: Classification enabled: {}", openai_api_key.is_some());
        let openai_model = with_default("MAIL_COURIER_OPENAI_MODEL", "gpt-4");
        let openai_base_url = with_default("MAIL_COURIER_OPENAI_BASE_URL", "https://api.openai.com/v1");

        let archive_bucket = optional("MAIL_COURIER_ARCHIVE_BUCKET");
        log::info!("Config: Archival bucket: {}", archive_bucket.as_deref().unwrap_or("disabled"));
        let s3_endpoint = optional("MAIL_COURIER_S3_ENDPOINT");

        let blocked_senders = optional("MAIL_COURIER_BLOCKED_SENDERS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();
        let require_attachments = parse_bool("MAIL_COURIER_REQUIRE_ATTACHMENTS", true)?;
        let http_timeout_secs = parse_var("MAIL_COURIER_HTTP_TIMEOUT_SECS", "30")?;

        Ok(Config {
            target_emails,
            smtp_bind_address,
            smtp_port,
            health_check_bind_address,
            health_check_port,
            relay_host,
            relay_port,
            relay_username,
            relay_password,
            relay_tls,
            routing_table_json,
            telegram_token,
            telegram_chat_id,
            telegram_api_url,
            openai_api_key,
            openai_model,
            openai_base_url,
            archive_bucket,
            s3_endpoint,
            blocked_senders,
            require_attachments,
            http_timeout_secs,
        })
    }

    /// The per-invocation options the pipeline validates and acts on.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            routing_table_json: self.routing_table_json.clone(),
            notification_token: self.telegram_token.clone(),
            notification_channel: self.telegram_chat_id.clone(),
            classifier_api_key: self.openai_api_key.clone(),
            archive_bucket: self.archive_bucket.clone(),
            blocked_senders: self.blocked_senders.clone(),
            require_attachments: self.require_attachments,
        }
    }
}

fn required(key: &str) -> Result<String> {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        Ok(_) => {
            let err_msg = format!("{} environment variable must not be empty", key);
            log::error!("{}", err_msg);
            Err(anyhow!(err_msg))
        }
        Err(e) => {
            let err_msg = format!("{} environment variable must be set", key);
            log::error!("{}: {}", err_msg, e);
            Err(anyhow!(e).context(err_msg))
        }
    }
}

/// Unset and blank values are both treated as absent.
fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.trim().is_empty())
}

fn with_default(key: &str, default: &str) -> String {
    env::var(key)
        .map(|val| {
            log::info!("Config: Using {} from env: {}", key, val);
            val
        })
        .unwrap_or_else(|_| {
            log::info!("Config: Using default {}: {}", key, default);
            default.to_string()
        })
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    match raw.trim().parse::<T>() {
        Ok(val) => Ok(val),
        Err(e) => {
            let err_msg = format!("{} ('{}') must be a valid number", key, raw);
            log::error!("{}: {}", err_msg, e);
            Err(anyhow!(e).context(err_msg))
        }
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => {
                let err_msg = format!("{} ('{}') must be a boolean", key, raw);
                log::error!("{}", err_msg);
                Err(anyhow!(err_msg))
            }
        },
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
