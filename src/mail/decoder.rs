//! Turns raw message bytes into a [`ParsedEmail`] and reduces HTML bodies to
//! plain text for the steps that consume text.

use log::{debug, warn};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};

use super::{Attachment, Disposition, ParsedEmail};
use crate::error::DecodeError;

/// Column width handed to `html2text`.
const TEXT_WIDTH: usize = 80;

/// Decodes a raw RFC 5322 message.
///
/// Walks the MIME tree depth-first. The first `text/html` and the first
/// `text/plain` leaf that are not marked as attachments become the bodies;
/// every other leaf is collected as an [`Attachment`] in document order.
///
/// A leaf counts as an attachment when it has `Content-Disposition:
/// attachment`, carries a filename (`filename=` or the content-type `name=`
/// parameter), or is not a text body at all (images referenced by
/// `Content-ID`, PDFs, ...).
///
/// # Errors
///
/// [`DecodeError::Empty`] for blank input and [`DecodeError::Mime`] when
/// `mailparse` rejects the structure or a part's transfer encoding.
pub fn decode(raw: &[u8]) -> Result<ParsedEmail, DecodeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    let mail = parse_mail(raw)?;
    let mut parsed = ParsedEmail::default();
    collect_parts(&mail, &mut parsed)?;

    debug!(
        "Decoded message: html={}, text={}, attachments={}",
        parsed.html.is_some(),
        parsed.text.is_some(),
        parsed.attachments.len()
    );
    Ok(parsed)
}

fn collect_parts(part: &ParsedMail<'_>, out: &mut ParsedEmail) -> Result<(), DecodeError> {
    if !part.subparts.is_empty() {
        for child in &part.subparts {
            collect_parts(child, out)?;
        }
        return Ok(());
    }

    let mime = part.ctype.mimetype.to_ascii_lowercase();
    let content_disposition = part.get_content_disposition();
    let disposition = if part.headers.get_first_value("Content-Disposition").is_none() {
        Disposition::None
    } else if matches!(content_disposition.disposition, DispositionType::Attachment) {
        Disposition::Attachment
    } else {
        Disposition::Inline
    };
    let filename = content_disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    let is_text_body = matches!(mime.as_str(), "text/plain" | "text/html")
        && disposition != Disposition::Attachment
        && filename.is_none();

    if is_text_body {
        let body = part.get_body()?;
        let slot = if mime == "text/html" { &mut out.html } else { &mut out.text };
        if slot.is_none() {
            *slot = Some(body);
        } else {
            debug!("Ignoring additional {} body part", mime);
        }
        return Ok(());
    }

    let content_id = part
        .headers
        .get_first_value("Content-ID")
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string());
    let filename = filename.unwrap_or_else(|| format!("attachment-{}", out.attachments.len() + 1));

    out.attachments.push(Attachment {
        filename,
        mime_type: mime,
        disposition,
        content_id,
        content: part.get_body_raw()?,
    });
    Ok(())
}

/// Plain-text rendering of the body for downstream consumers.
///
/// The HTML body wins when present; otherwise the plain body is returned
/// as-is. If `html2text` cannot render the HTML, the raw markup is used.
pub fn normalize_body(parsed: &ParsedEmail) -> Option<String> {
    match (&parsed.html, &parsed.text) {
        (Some(html), _) => match html2text::from_read(html.as_bytes(), TEXT_WIDTH) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Failed to render HTML body, falling back to raw markup: {}", e);
                Some(html.clone())
            }
        },
        (None, Some(text)) => Some(text.clone()),
        (None, None) => None,
    }
}
