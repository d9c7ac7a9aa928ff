//! Outgoing message composition and SMTP submission
//!
//! Messages are built with `lettre` and submitted over implicit TLS. The same
//! builder produces the RFC822 bytes stored in the drafts and sent mailboxes.

use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MessageBuilder, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;

use crate::config::MailboxConfig;
use crate::errors::{AppError, AppResult};

/// Fields of a message to compose
#[derive(Debug, Clone, Default)]
pub struct Composition<'a> {
    pub from: Option<&'a str>,
    pub to: &'a [String],
    pub cc: &'a [String],
    pub bcc: &'a [String],
    pub subject: &'a str,
    pub body_text: &'a str,
    pub body_html: Option<&'a str>,
    pub in_reply_to: Option<&'a str>,
    /// Keep the `Bcc` header in the formatted bytes (drafts only)
    pub keep_bcc: bool,
}

/// A built message with its generated Message-ID
#[derive(Debug, Clone)]
pub struct Composed {
    pub message_id: String,
    pub message: Message,
}

/// Generate a Message-ID in angle-bracket form for the sender's domain
pub fn new_message_id(address: &str) -> String {
    let domain = address
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{domain}>", uuid::Uuid::new_v4())
}

fn parse_mailbox(value: &str) -> AppResult<Mailbox> {
    value
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| AppError::invalid(format!("invalid address '{value}': {e}")))
}

/// Sender mailbox for `from`, defaulting to the account's primary address
///
/// Only the primary address and configured aliases may be used.
pub fn sender_mailbox(account: &MailboxConfig, from: Option<&str>) -> AppResult<Mailbox> {
    let address = from.map(str::trim).unwrap_or(account.user.as_str());
    let allowed = address.eq_ignore_ascii_case(&account.user)
        || account
            .aliases
            .iter()
            .any(|a| a.eq_ignore_ascii_case(address));
    if !allowed {
        return Err(AppError::invalid(format!(
            "'{address}' is not an alias of this mailbox"
        )));
    }
    match &account.display_name {
        Some(name) => parse_mailbox(&format!("\"{}\" <{address}>", name.replace('"', ""))),
        None => parse_mailbox(address),
    }
}

/// Build an RFC822 message
///
/// # Errors
///
/// - `InvalidInput` if there are no recipients or an address does not parse
pub fn compose(account: &MailboxConfig, fields: &Composition<'_>) -> AppResult<Composed> {
    if fields.to.is_empty() && fields.cc.is_empty() && fields.bcc.is_empty() {
        return Err(AppError::invalid("message needs at least one recipient"));
    }

    let from = sender_mailbox(account, fields.from)?;
    let message_id = new_message_id(&from.email.to_string());
    let mut builder: MessageBuilder = Message::builder()
        .from(from)
        .subject(fields.subject)
        .message_id(Some(message_id.clone()));
    for to in fields.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    for cc in fields.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }
    for bcc in fields.bcc {
        builder = builder.bcc(parse_mailbox(bcc)?);
    }
    if let Some(parent) = fields.in_reply_to.filter(|p| !p.trim().is_empty()) {
        builder = builder
            .in_reply_to(parent.trim().to_owned())
            .references(parent.trim().to_owned());
    }
    if fields.keep_bcc {
        builder = builder.keep_bcc();
    }

    let message = match fields.body_html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            fields.body_text.to_owned(),
            html.to_owned(),
        )),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(fields.body_text.to_owned()),
    }
    .map_err(|e| AppError::invalid(format!("failed to build message: {e}")))?;

    Ok(Composed {
        message_id,
        message,
    })
}

/// Submit a message over SMTP with implicit TLS
///
/// # Errors
///
/// - `NoSession` if the mailbox has no credentials
/// - `Unavailable`/`Timeout` for transient SMTP failures
/// - `AuthFailed` or `Internal` for permanent ones
pub async fn send(account: &MailboxConfig, message: Message) -> AppResult<()> {
    let pass = account.pass.as_ref().ok_or_else(|| {
        AppError::NoSession(format!("mailbox '{}' has no credentials", account.mailbox_id))
    })?;
    let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&account.smtp_host)
        .map_err(|e| AppError::invalid(format!("smtp relay init failed: {e}")))?
        .port(account.smtp_port)
        .credentials(Credentials::new(
            account.user.clone(),
            pass.expose_secret().to_owned(),
        ))
        .build();

    transport.send(message).await.map_err(|e| {
        let msg = format!("smtp send failed: {e}");
        if e.is_timeout() {
            AppError::Timeout(msg)
        } else if e.is_transient() {
            AppError::Unavailable(msg)
        } else if msg.to_ascii_lowercase().contains("auth") {
            AppError::AuthFailed(msg)
        } else {
            AppError::Internal(msg)
        }
    })?;
    tracing::info!(mailbox = %account.mailbox_id, "message submitted");
    Ok(())
}
