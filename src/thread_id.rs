//! Opaque thread and draft identifiers for the IMAP provider
//!
//! Encodes mailbox, UIDVALIDITY and UID into a stable string. Mailbox names
//! may contain colons, which are preserved during parsing. Also encodes the
//! keyset continuation token used for upstream listing.

use crate::errors::{AppError, AppResult};

/// Stable IMAP-backed thread identifier
///
/// # Format
///
/// `imap:{mailbox}:{uidvalidity}:{uid}`
///
/// The `mailbox` segment may contain colons internally (e.g.,
/// `Projects:2026:Q1`). All segments between the prefix and the two trailing
/// numbers are joined with colons.
///
/// # Example
///
/// ```text
/// imap:INBOX:12345:42
/// imap:Projects:2026:Q1:999:7
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadId {
    /// Mailbox name (may contain colons)
    pub mailbox: String,
    /// IMAP UIDVALIDITY (mailbox snapshot identifier)
    pub uidvalidity: u32,
    /// Message UID within mailbox
    pub uid: u32,
}

impl ThreadId {
    /// Parse thread ID from string
    ///
    /// Returns error if the prefix is not `imap`, fewer than 4 segments are
    /// present, the numbers do not parse, or the mailbox is empty.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let mut parts: Vec<&str> = raw.split(':').collect();
        if parts.len() < 4 {
            return Err(AppError::invalid("thread id must have at least 4 segments"));
        }
        if parts[0] != "imap" {
            return Err(AppError::invalid("thread id must start with 'imap'"));
        }

        let uid = parts
            .pop()
            .ok_or_else(|| AppError::invalid("missing uid"))?
            .parse::<u32>()
            .map_err(|_| AppError::invalid("invalid uid in thread id"))?;

        let uidvalidity = parts
            .pop()
            .ok_or_else(|| AppError::invalid("missing uidvalidity"))?
            .parse::<u32>()
            .map_err(|_| AppError::invalid("invalid uidvalidity in thread id"))?;

        let mailbox = parts[1..].join(":");
        if mailbox.is_empty() {
            return Err(AppError::invalid("thread id mailbox cannot be empty"));
        }

        Ok(Self {
            mailbox,
            uidvalidity,
            uid,
        })
    }

    pub fn encode(&self) -> String {
        format!("imap:{}:{}:{}", self.mailbox, self.uidvalidity, self.uid)
    }
}

/// Keyset continuation token: the next page holds UIDs strictly below `below_uid`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken {
    pub uidvalidity: u32,
    pub below_uid: u32,
}

impl PageToken {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let (validity, uid) = raw
            .split_once(':')
            .ok_or_else(|| AppError::invalid("page token must be '<uidvalidity>:<uid>'"))?;
        Ok(Self {
            uidvalidity: validity
                .parse()
                .map_err(|_| AppError::invalid("invalid uidvalidity in page token"))?,
            below_uid: uid
                .parse()
                .map_err(|_| AppError::invalid("invalid uid in page token"))?,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.uidvalidity, self.below_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::{PageToken, ThreadId};

    #[test]
    fn parses_and_encodes_standard_thread_id() {
        let id = ThreadId::parse("imap:INBOX:123:42").expect("parse succeeds");
        assert_eq!(id.mailbox, "INBOX");
        assert_eq!(id.uidvalidity, 123);
        assert_eq!(id.uid, 42);
        assert_eq!(id.encode(), "imap:INBOX:123:42");
    }

    #[test]
    fn parses_mailbox_with_colons() {
        let id = ThreadId::parse("imap:Projects:2026:Q1:999:7").expect("parse succeeds");
        assert_eq!(id.mailbox, "Projects:2026:Q1");
        assert_eq!(id.uidvalidity, 999);
        assert_eq!(id.uid, 7);
    }

    #[test]
    fn rejects_invalid_prefix() {
        let err = ThreadId::parse("gmail:INBOX:123:1").expect_err("must fail");
        assert!(err.to_string().contains("must start with 'imap'"));
    }

    #[test]
    fn page_token_rejects_garbage() {
        assert!(PageToken::parse("not-a-token").is_err());
        assert_eq!(
            PageToken::parse("7:100").expect("valid token"),
            PageToken {
                uidvalidity: 7,
                below_uid: 100
            }
        );
    }
}
