//! Best-effort archival of message bodies and attachments to S3-compatible
//! object storage.
//!
//! Keys:
//! - body: `mail/<year>/-<sender, first '@' as '.'>-<sanitized subject>.html`
//! - attachments: `mail/<year>/attachment/<filename>`

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::mail::ParsedEmail;

/// Durable key/value sink for archived mail.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, content_type: &str, body: Vec<u8>) -> Result<()>;
}

pub struct S3Archive {
    client: aws_sdk_s3::Client,
}

impl S3Archive {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Builds a client from the ambient AWS configuration.
    ///
    /// With a custom `endpoint` (R2, MinIO) path-style addressing is forced.
    pub async fn from_env(endpoint: Option<&str>) -> Self {
        let sdk_config = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(url) = endpoint {
            info!(endpoint = url, "Using custom S3 endpoint");
            builder = builder.endpoint_url(url).force_path_style(true);
        }
        Self::new(aws_sdk_s3::Client::from_conf(builder.build()))
    }
}

#[async_trait]
impl ArchiveSink for S3Archive {
    async fn put(&self, bucket: &str, key: &str, content_type: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| format!("upload s3://{}/{}", bucket, key))?;
        Ok(())
    }
}

/// Applies, in order: trim, replace every char outside `[a-zA-Z0-9/_-]` with
/// `-`, collapse runs of `/`, strip leading and trailing `-`.
pub fn sanitize_subject(subject: &str) -> String {
    let replaced = subject.trim().chars().map(|c| {
        if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-') {
            c
        } else {
            '-'
        }
    });

    let mut collapsed = String::with_capacity(subject.len());
    for c in replaced {
        if c == '/' && collapsed.ends_with('/') {
            continue;
        }
        collapsed.push(c);
    }

    collapsed.trim_matches('-').to_string()
}

pub fn mail_key(year: i32, sender: &str, subject: &str) -> String {
    format!(
        "mail/{}/-{}-{}.html",
        year,
        sender.replacen('@', ".", 1),
        sanitize_subject(subject)
    )
}

/// Only the last path component of `filename` is kept, so a key never
/// leaves `mail/<year>/attachment/`.
pub fn attachment_key(year: i32, filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or("attachment");
    format!("mail/{}/attachment/{}", year, name)
}

/// Stores the body and every non-empty attachment; returns the keys written.
///
/// Stops at the first failed write.
pub async fn store_email(
    sink: &dyn ArchiveSink,
    bucket: &str,
    year: i32,
    sender: &str,
    subject: &str,
    parsed: &ParsedEmail,
) -> Result<Vec<String>> {
    let mut written = Vec::with_capacity(parsed.attachments.len() + 1);

    let (content_type, body) = match (&parsed.html, &parsed.text) {
        (Some(html), _) => ("text/html; charset=utf-8", html.as_bytes().to_vec()),
        (None, Some(text)) => ("text/plain; charset=utf-8", text.as_bytes().to_vec()),
        (None, None) => ("text/plain; charset=utf-8", Vec::new()),
    };
    let key = mail_key(year, sender, subject);
    sink.put(bucket, &key, content_type, body).await?;
    debug!(key = %key, "Archived message body");
    written.push(key);

    for attachment in parsed.attachments.iter().filter(|a| !a.content.is_empty()) {
        let key = attachment_key(year, &attachment.filename);
        sink.put(bucket, &key, &attachment.mime_type, attachment.content.clone())
            .await?;
        debug!(key = %key, "Archived attachment");
        written.push(key);
    }

    Ok(written)
}
