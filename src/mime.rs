//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`, extracts body text/HTML and
//! attachment metadata, and normalizes dates and addresses for the thread
//! cache. HTML is sanitized with `ammonia`; when a message has no plain-text
//! part, text is rendered from the HTML with `html2text`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use mailparse::{DispositionType, MailAddr, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::upstream::{AttachmentInfo, Sender};

/// Upper bound on body characters kept per message
pub const BODY_MAX_CHARS: usize = 100_000;

/// Parsed message representation before provider-specific ids and labels
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: Sender,
    pub to: Vec<Sender>,
    pub cc: Vec<Sender>,
    /// Only present on messages that kept the header (drafts)
    pub bcc: Vec<Sender>,
    pub in_reply_to: Option<String>,
    /// RFC 3339 UTC timestamp, `None` when the Date header is missing or bad
    pub date: Option<String>,
    pub body_text: Option<String>,
    pub body_html_sanitized: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Parse RFC822 message into structured representation
///
/// # Errors
///
/// - `Internal` if `mailparse` fails
pub fn parse_message(raw: &[u8], body_max_chars: usize) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let headers = to_header_map(&to_tuples(&parsed.headers));
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();

    walk_parts(
        &parsed,
        "1".to_owned(),
        &mut body_text,
        &mut body_html,
        &mut attachments,
    )?;

    if body_text.is_none()
        && let Some(html) = &body_html
    {
        body_text = html2text::from_read(html.as_bytes(), 100).ok();
    }

    let sender = headers
        .get("from")
        .and_then(|v| parse_addresses(v).into_iter().next())
        .unwrap_or_else(|| Sender {
            name: None,
            email: String::new(),
        });

    Ok(ParsedMessage {
        message_id: headers.get("message-id").map(|v| v.trim().to_owned()),
        subject: headers.get("subject").cloned().unwrap_or_default(),
        sender,
        to: headers.get("to").map(|v| parse_addresses(v)).unwrap_or_default(),
        cc: headers.get("cc").map(|v| parse_addresses(v)).unwrap_or_default(),
        bcc: headers.get("bcc").map(|v| parse_addresses(v)).unwrap_or_default(),
        in_reply_to: headers.get("in-reply-to").map(|v| v.trim().to_owned()),
        date: headers.get("date").and_then(|v| normalize_date(v)),
        body_text: body_text.map(|t| truncate_chars(t, body_max_chars)),
        body_html_sanitized: body_html.map(|h| truncate_chars(h, body_max_chars)),
        attachments,
    })
}

/// Walk MIME part tree recursively
///
/// Keeps the first text/plain and text/html bodies and collects attachment
/// metadata.
fn walk_parts(
    part: &ParsedMail<'_>,
    part_id: String,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) -> AppResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            let raw_body = part
                .get_body_raw()
                .map_err(|e| AppError::Internal(format!("failed decoding attachment body: {e}")))?;
            attachments.push(AttachmentInfo {
                filename,
                content_type: ctype,
                size_bytes: raw_body.len(),
                part_id,
            });
            return Ok(());
        }

        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }

        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(ammonia::clean(&html));
        }

        return Ok(());
    }

    for (idx, sub) in part.subparts.iter().enumerate() {
        let next_id = format!("{part_id}.{}", idx + 1);
        walk_parts(sub, next_id, body_text, body_html, attachments)?;
    }
    Ok(())
}

fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Parse an address list header into senders
///
/// Group syntax is flattened. Values that do not parse as addresses are kept
/// verbatim as the email.
pub fn parse_addresses(value: &str) -> Vec<Sender> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![Sender {
                    name: info.display_name.clone(),
                    email: info.addr.clone(),
                }],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| Sender {
                        name: info.display_name.clone(),
                        email: info.addr.clone(),
                    })
                    .collect(),
            })
            .collect(),
        Err(_) if value.trim().is_empty() => Vec::new(),
        Err(_) => vec![Sender {
            name: None,
            email: value.trim().to_owned(),
        }],
    }
}

/// Normalize an RFC 2822 date to RFC 3339 UTC with millisecond precision
///
/// The fixed format makes lexical order match chronological order, which the
/// cache's keyset pagination relies on. Strict RFC 2822 is tried first;
/// `mailparse` covers the sloppier forms but answers garbage with the epoch,
/// so non-positive timestamps are rejected.
pub fn normalize_date(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(format_timestamp(&parsed.with_timezone(&Utc)));
    }
    let ts = mailparse::dateparse(value).ok().filter(|ts| *ts > 0)?;
    DateTime::<Utc>::from_timestamp(ts, 0).map(|d| format_timestamp(&d))
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_tuples(headers: &[MailHeader<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map keeping the first value
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        map.entry(k.to_ascii_lowercase()).or_insert_with(|| v.clone());
    }
    map
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input;
    }
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_date, parse_addresses, parse_message, truncate_chars};

    #[test]
    fn truncates_unicode_by_character() {
        let input = "a😀b😀c".to_owned();
        assert_eq!(truncate_chars(input, 4), "a😀b😀");
    }

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: Sender Name <sender@example.com>\r\nTo: user@example.com\r\nSubject: Hi\r\nMessage-ID: <abc@example.com>\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let parsed = parse_message(raw, 2000).expect("parse should succeed");

        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.sender.email, "sender@example.com");
        assert_eq!(parsed.sender.name.as_deref(), Some("Sender Name"));
        assert_eq!(parsed.to.len(), 1);
        assert_eq!(parsed.message_id.as_deref(), Some("<abc@example.com>"));
        assert_eq!(parsed.date.as_deref(), Some("2025-01-01T00:00:00.000Z"));
        assert_eq!(parsed.body_text.as_deref(), Some("Hello there"));
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn html_only_message_gets_text_rendering() {
        let raw = b"From: a@example.com\r\nSubject: Html\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>world</b></p><script>alert(1)</script>";
        let parsed = parse_message(raw, 2000).expect("parse should succeed");
        let html = parsed.body_html_sanitized.expect("html kept");
        assert!(!html.contains("script"));
        let text = parsed.body_text.expect("text rendered from html");
        assert!(text.contains("Hello"));
    }

    #[test]
    fn dates_normalize_to_utc() {
        assert_eq!(
            normalize_date("Tue, 4 Feb 2025 10:30:00 +0200").as_deref(),
            Some("2025-02-04T08:30:00.000Z")
        );
        assert!(normalize_date("not a date").is_none());
        assert!(normalize_date("").is_none());
        assert!(normalize_date("   ").is_none());
    }

    #[test]
    fn garbage_date_header_leaves_date_unset() {
        let raw = b"From: a@example.com\r\nSubject: x\r\nDate: not a date\r\n\r\nbody";
        let parsed = parse_message(raw, 2000).expect("parse should succeed");
        assert!(parsed.date.is_none());
    }

    #[test]
    fn unparseable_address_is_kept_verbatim() {
        let senders = parse_addresses("undisclosed-recipients");
        assert_eq!(senders.len(), 1);
        assert!(parse_addresses("   ").is_empty());
    }
}
