//! Message types shared by the ingress, the decoder and the pipeline.

mod decoder;

pub use decoder::{decode, normalize_body};

use mailparse::MailHeaderMap;

/// Subject used when the message carries none.
pub const NO_SUBJECT: &str = "no-subject";

/// One raw message as handed over by the ingress.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub raw: Vec<u8>,
}

impl IncomingMessage {
    /// Builds a message, reading the subject from the raw header block.
    pub fn new(sender: impl Into<String>, recipient: impl Into<String>, raw: Vec<u8>) -> Self {
        let subject = mailparse::parse_headers(&raw)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("Subject"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| NO_SUBJECT.to_string());

        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            subject,
            raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Attachment,
    Inline,
    None,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub disposition: Disposition,
    pub content_id: Option<String>,
    pub content: Vec<u8>,
}

/// Structured view of a decoded message.
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}
