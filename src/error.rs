//! Error taxonomy for a single pipeline invocation.
//!
//! Only the variants of [`PipelineError`] ever escape `Pipeline::process_message`.
//! Archival and classification failures never do; they are folded into the
//! report as `StepOutcome::Failed`.

/// Required pipeline configuration is missing or malformed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid routing table: {0}")]
    InvalidRoutingTable(String),
}

/// The raw message bytes could not be turned into a `ParsedEmail`.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message is empty")]
    Empty,

    #[error("malformed MIME structure: {0}")]
    Mime(#[from] mailparse::MailParseError),
}

/// Fatal outcomes of one invocation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("forward to {destination} failed: {reason}")]
    Forward { destination: String, reason: String },
}

impl PipelineError {
    /// Whether retrying the same message later could succeed.
    ///
    /// Used by the SMTP ingress to choose between a 4xx and a 5xx reply.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::Notification(_)
                | PipelineError::Forward { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::Notification("boom".into()).is_transient());
        assert!(PipelineError::Configuration(ConfigError::Missing("token")).is_transient());
        assert!(PipelineError::Forward {
            destination: "d@y.com".into(),
            reason: "relay down".into()
        }
        .is_transient());
        assert!(!PipelineError::Validation("no attachments".into()).is_transient());
        assert!(!PipelineError::Decode(DecodeError::Empty).is_transient());
    }

    #[test]
    fn test_error_messages_name_the_cause() {
        let err = PipelineError::from(ConfigError::Missing("MAIL_COURIER_TELEGRAM_TOKEN"));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required configuration: MAIL_COURIER_TELEGRAM_TOKEN"
        );

        let err = PipelineError::Forward {
            destination: "d@y.com".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "forward to d@y.com failed: connection refused");
    }
}
