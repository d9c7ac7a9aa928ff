//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. All network
//! calls are enforced to use TLS, timeouts come from [`ImapTimeouts`], and
//! protocol failures are classified as retryable or fatal for the sync loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag, Name};
use chrono::{DateTime, Utc};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::{ImapTimeouts, MailboxConfig};
use crate::errors::{AppError, AppResult};

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

fn socket_timeout(timeouts: &ImapTimeouts) -> Duration {
    Duration::from_millis(timeouts.socket_timeout_ms)
}

/// Classify an `async-imap` failure
///
/// Throttling responses become `RateLimited`, dropped connections
/// `Unavailable`, credential rejections `AuthFailed`; anything else is
/// `Internal`.
pub fn classify_error(context: &str, err: async_imap::error::Error) -> AppError {
    let transient = matches!(
        err,
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
    );
    let msg = format!("{context}: {err}");
    let lower = msg.to_ascii_lowercase();
    if lower.contains("throttl") || lower.contains("rate limit") || lower.contains("too many") {
        AppError::RateLimited(msg)
    } else if transient || lower.contains("[unavailable]") || lower.contains("try again") {
        AppError::Unavailable(msg)
    } else if lower.contains("[authenticationfailed]") || lower.contains("invalid credentials") {
        AppError::AuthFailed(msg)
    } else {
        AppError::Internal(msg)
    }
}

/// Run one IMAP step under the socket timeout, classifying failures
async fn bounded<T, F>(timeouts: &ImapTimeouts, context: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, async_imap::error::Error>>,
{
    timeout(socket_timeout(timeouts), fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{context} timed out")))
        .and_then(|r| r.map_err(|e| classify_error(context, e)))
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with webpki root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `NoSession` if the mailbox has no password configured
/// - `InvalidInput` if `imap_secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `Unavailable` for TCP, TLS or greeting failures
/// - `AuthFailed` if authentication fails
pub async fn connect_authenticated(
    timeouts: &ImapTimeouts,
    mailbox: &MailboxConfig,
) -> AppResult<ImapSession> {
    let pass = mailbox.pass.as_ref().ok_or_else(|| {
        AppError::NoSession(format!("mailbox '{}' has no credentials", mailbox.mailbox_id))
    })?;
    if !mailbox.imap_secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set ZERO_MAIL_<MAILBOX>_IMAP_SECURE=true".to_owned(),
        ));
    }

    let connect_duration = Duration::from_millis(timeouts.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(timeouts.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((mailbox.imap_host.as_str(), mailbox.imap_port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Unavailable(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(mailbox.imap_host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Unavailable(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Unavailable(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Unavailable(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    timeout(
        greeting_duration,
        client.login(mailbox.user.as_str(), pass.expose_secret()),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
    .and_then(|r| {
        r.map_err(|(e, _)| {
            let msg = e.to_string();
            if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                AppError::AuthFailed(msg)
            } else {
                classify_error("IMAP login", e)
            }
        })
    })
}

/// Close the session politely; failures are ignored
pub async fn logout(timeouts: &ImapTimeouts, mut session: ImapSession) {
    if let Err(e) = bounded(timeouts, "LOGOUT", session.logout()).await {
        tracing::debug!(error = %e, "IMAP logout failed");
    }
}

/// Whether the server advertises `MOVE` (RFC 6851)
pub async fn supports_move(timeouts: &ImapTimeouts, session: &mut ImapSession) -> AppResult<bool> {
    let caps = bounded(timeouts, "CAPABILITY", session.capabilities()).await?;
    Ok(caps.has_str("MOVE"))
}

/// List all visible mailboxes/folders
pub async fn list_all_mailboxes(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
) -> AppResult<Vec<Name>> {
    let stream = bounded(timeouts, "LIST", session.list(None, Some("*"))).await?;
    bounded(timeouts, "LIST stream", stream.try_collect::<Vec<_>>()).await
}

pub async fn create_mailbox(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<()> {
    bounded(timeouts, "CREATE", session.create(mailbox)).await
}

pub async fn rename_mailbox(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    from: &str,
    to: &str,
) -> AppResult<()> {
    bounded(timeouts, "RENAME", session.rename(from, to)).await
}

pub async fn delete_mailbox(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<()> {
    bounded(timeouts, "DELETE", session.delete(mailbox)).await
}

/// Select mailbox in read-only mode
///
/// Uses `EXAMINE` so listing never marks messages as read. Returns the
/// `UIDVALIDITY` for identifier stability.
pub async fn select_mailbox_readonly(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<u32> {
    let selected = timeout(socket_timeout(timeouts), session.examine(mailbox))
        .await
        .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::NotFound(format!("cannot examine mailbox '{mailbox}': {e}")))
        })?;
    selected
        .uid_validity
        .ok_or_else(|| AppError::Internal("mailbox missing UIDVALIDITY".to_owned()))
}

/// Select mailbox in read-write mode
pub async fn select_mailbox_readwrite(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<u32> {
    let selected = timeout(socket_timeout(timeouts), session.select(mailbox))
        .await
        .map_err(|_| AppError::Timeout(format!("SELECT timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::NotFound(format!("cannot select mailbox '{mailbox}': {e}")))
        })?;
    selected
        .uid_validity
        .ok_or_else(|| AppError::Internal("mailbox missing UIDVALIDITY".to_owned()))
}

/// Fetch a single message with custom query
///
/// # Errors
///
/// - `NotFound` if UID does not exist in mailbox
pub async fn fetch_one(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid: u32,
    query: &str,
) -> AppResult<Fetch> {
    let stream = bounded(timeouts, "UID FETCH", session.uid_fetch(uid.to_string(), query)).await?;
    let fetches: Vec<Fetch> = bounded(timeouts, "UID FETCH stream", stream.try_collect()).await?;
    fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))
}

/// One message as fetched: source bytes, flags and server arrival time
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub raw: Vec<u8>,
    pub flags: Vec<String>,
    /// `INTERNALDATE`, stable across refetches
    pub internal_date: Option<DateTime<Utc>>,
}

/// Fetch full RFC822 source, flags and `INTERNALDATE` without setting `\Seen`
pub async fn fetch_message(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid: u32,
) -> AppResult<FetchedMessage> {
    let fetch = fetch_one(timeouts, session, uid, "UID FLAGS INTERNALDATE BODY.PEEK[]").await?;
    let raw = fetch
        .body()
        .ok_or_else(|| AppError::Internal("message has no RFC822 body".to_owned()))?
        .to_vec();
    Ok(FetchedMessage {
        raw,
        flags: flag_names(&fetch),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
    })
}

/// Fetch message flags only
pub async fn fetch_flags(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid: u32,
) -> AppResult<Vec<String>> {
    let fetch = fetch_one(timeouts, session, uid, "UID FLAGS").await?;
    Ok(flag_names(&fetch))
}

/// Render fetch flags in IMAP wire form (`\Seen`, `$Important`)
pub fn flag_names(fetch: &Fetch) -> Vec<String> {
    fetch
        .flags()
        .map(|flag| match flag {
            Flag::Seen => "\\Seen".to_owned(),
            Flag::Answered => "\\Answered".to_owned(),
            Flag::Flagged => "\\Flagged".to_owned(),
            Flag::Deleted => "\\Deleted".to_owned(),
            Flag::Draft => "\\Draft".to_owned(),
            Flag::Recent => "\\Recent".to_owned(),
            Flag::MayCreate => "\\*".to_owned(),
            Flag::Custom(name) => name.to_string(),
        })
        .collect()
}

/// Search for messages matching query
///
/// Runs `UID SEARCH` and returns matching UIDs in descending order (newest
/// first).
pub async fn uid_search(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    query: &str,
) -> AppResult<Vec<u32>> {
    let set = bounded(timeouts, "UID SEARCH", session.uid_search(query)).await?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Store flags on messages
///
/// Use `+FLAGS.SILENT (...)` to add flags or `-FLAGS.SILENT (...)` to remove.
pub async fn uid_store(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uids: &[u32],
    query: &str,
) -> AppResult<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let stream = bounded(timeouts, "UID STORE", session.uid_store(uid_set(uids), query)).await?;
    let _: Vec<Fetch> = bounded(timeouts, "UID STORE stream", stream.try_collect()).await?;
    Ok(())
}

pub async fn uid_copy(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uids: &[u32],
    mailbox: &str,
) -> AppResult<()> {
    if uids.is_empty() {
        return Ok(());
    }
    bounded(timeouts, "UID COPY", session.uid_copy(uid_set(uids), mailbox)).await
}

/// Move messages, preferring `UID MOVE` and falling back to copy + expunge
pub async fn uid_move(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uids: &[u32],
    mailbox: &str,
) -> AppResult<()> {
    if uids.is_empty() {
        return Ok(());
    }
    if supports_move(timeouts, session).await? {
        return bounded(timeouts, "UID MOVE", session.uid_mv(uid_set(uids), mailbox)).await;
    }
    uid_copy(timeouts, session, uids, mailbox).await?;
    uid_store(timeouts, session, uids, "+FLAGS.SILENT (\\Deleted)").await?;
    uid_expunge(timeouts, session, uids).await
}

/// Permanently remove messages marked `\Deleted`
pub async fn uid_expunge(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uids: &[u32],
) -> AppResult<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let stream = bounded(timeouts, "UID EXPUNGE", session.uid_expunge(uid_set(uids))).await?;
    let _: Vec<u32> = bounded(timeouts, "UID EXPUNGE stream", stream.try_collect()).await?;
    Ok(())
}

/// Append raw RFC822 message to mailbox with optional flag list
pub async fn append(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
    flags: Option<&str>,
    content: &[u8],
) -> AppResult<()> {
    bounded(
        timeouts,
        "APPEND",
        session.append(mailbox, flags, None, content),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::{classify_error, uid_set};
    use crate::errors::AppError;

    #[test]
    fn uid_set_joins_with_commas() {
        assert_eq!(uid_set(&[3, 1, 2]), "3,1,2");
        assert_eq!(uid_set(&[]), "");
    }

    #[test]
    fn throttling_response_is_rate_limited() {
        let err = classify_error(
            "UID FETCH",
            async_imap::error::Error::No("[THROTTLED] Account exceeded command limits".to_owned()),
        );
        assert!(matches!(err, AppError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn dropped_connection_is_retryable() {
        let err = classify_error("UID SEARCH", async_imap::error::Error::ConnectionLost);
        assert!(matches!(err, AppError::Unavailable(_)));
    }

    #[test]
    fn bad_command_is_fatal() {
        let err = classify_error(
            "UID STORE",
            async_imap::error::Error::Bad("Invalid arguments".to_owned()),
        );
        assert!(!err.is_retryable());
    }
}
