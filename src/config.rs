//! Configuration for mailboxes, sync policy, chat model and server settings
//!
//! All configuration is loaded from environment variables following the pattern
//! `ZERO_MAIL_<SEGMENT>_<KEY>` for mailboxes and `ZERO_MAIL_<KEY>` for global
//! settings. Mailbox segments are discovered by scanning for
//! `ZERO_MAIL_*_IMAP_HOST` variables.

use std::collections::BTreeMap;
use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};
use crate::retry::RetryPolicy;

/// Mailbox (agent instance) configuration
///
/// Holds connection details and credentials for a single upstream mailbox.
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Mailbox identifier (lowercase, used as default `mailbox_id` parameter)
    pub mailbox_id: String,
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port (typically 993 for TLS)
    pub imap_port: u16,
    /// Whether to use TLS (enforced to `true` when connecting)
    pub imap_secure: bool,
    /// SMTP submission host
    pub smtp_host: String,
    /// SMTP submission port (implicit TLS)
    pub smtp_port: u16,
    /// Username for authentication, also the primary address
    pub user: String,
    /// Password; `None` means the agent runs without an upstream session
    pub pass: Option<SecretString>,
    /// Display name used on outgoing mail
    pub display_name: Option<String>,
    /// Extra sending addresses
    pub aliases: Vec<String>,
    /// Well-known mailbox names on the server
    pub folders: FolderNames,
}

/// Server-side names of the special-use mailboxes
#[derive(Debug, Clone)]
pub struct FolderNames {
    pub sent: String,
    pub drafts: String,
    pub trash: String,
    pub archive: String,
    pub spam: String,
}

impl Default for FolderNames {
    fn default() -> Self {
        Self {
            sent: "Sent".to_owned(),
            drafts: "Drafts".to_owned(),
            trash: "Trash".to_owned(),
            archive: "Archive".to_owned(),
            spam: "Junk".to_owned(),
        }
    }
}

/// IMAP network timeouts
#[derive(Debug, Clone)]
pub struct ImapTimeouts {
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Socket I/O timeout in milliseconds
    pub socket_timeout_ms: u64,
}

impl Default for ImapTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            greeting_timeout_ms: 15_000,
            socket_timeout_ms: 300_000,
        }
    }
}

/// Paginated sync loop policy
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Whether the folder sync loop may run at all
    pub enabled: bool,
    /// Threads requested per upstream page
    pub page_size: usize,
    /// Fixed delay between upstream pages
    pub page_delay: Duration,
    /// Cached-row count at which a folder sync is skipped
    pub max_threads: usize,
    /// Folders synced by the background loop
    pub folders: Vec<String>,
    /// Background loop period; zero disables it
    pub interval: Duration,
    /// Age after which a stale single-flight marker may be reclaimed
    pub guard_ttl: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            page_size: 50,
            page_delay: Duration::from_millis(2_000),
            max_threads: 1_000,
            folders: vec!["inbox".to_owned(), "sent".to_owned()],
            interval: Duration::from_secs(300),
            guard_ttl: Duration::from_secs(900),
        }
    }
}

/// Chat model endpoint
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,
    /// API key; `None` disables chat
    pub api_key: Option<SecretString>,
    /// Model name sent with each request
    pub model: String,
    /// System prompt override
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            api_key: None,
            model: "gpt-4o-mini".to_owned(),
            system_prompt: None,
        }
    }
}

/// Server-wide configuration
///
/// Wraps all mailbox configs and global settings. Shared with the agents,
/// MCP tool handlers and HTTP routes via `Arc`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// All configured mailboxes, keyed by `mailbox_id`
    pub mailboxes: BTreeMap<String, MailboxConfig>,
    /// Whether write tools (labels, drafts, sending, bulk operations) are enabled
    pub write_enabled: bool,
    /// IMAP network timeouts
    pub timeouts: ImapTimeouts,
    /// Root directory of the SQLite cache and blob store
    pub cache_dir: PathBuf,
    /// Socket address for the HTTP server
    pub http_bind: String,
    /// Folder sync behaviour
    pub sync: SyncPolicy,
    /// Upstream retry behaviour
    pub retry: RetryPolicy,
    /// Chat model endpoint
    pub llm: LlmConfig,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers mailboxes by scanning `ZERO_MAIL_*_IMAP_HOST` patterns.
    /// If none are explicitly defined, a `default` mailbox is required via
    /// `ZERO_MAIL_DEFAULT_IMAP_HOST` and `ZERO_MAIL_DEFAULT_USER`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// ZERO_MAIL_DEFAULT_IMAP_HOST=imap.gmail.com
    /// ZERO_MAIL_DEFAULT_USER=user@gmail.com
    /// ZERO_MAIL_DEFAULT_PASS=app-password
    /// ZERO_MAIL_DEFAULT_SMTP_HOST=smtp.gmail.com
    /// ZERO_MAIL_WORK_IMAP_HOST=outlook.office365.com
    /// ZERO_MAIL_WORK_USER=user@company.com
    /// ZERO_MAIL_WRITE_ENABLED=true
    /// ZERO_MAIL_LLM_API_KEY=sk-...
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let mailbox_pattern = Regex::new(r"^ZERO_MAIL_([A-Z0-9_]+)_IMAP_HOST$")
            .map_err(|e| AppError::Internal(format!("invalid mailbox regex: {e}")))?;

        let mut segments: Vec<String> = env::vars()
            .filter_map(|(k, _)| {
                mailbox_pattern
                    .captures(&k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();

        if segments.is_empty() {
            segments.push("DEFAULT".to_owned());
        }

        segments.sort();
        segments.dedup();

        let mut mailboxes = BTreeMap::new();
        for seg in segments {
            let mailbox = load_mailbox(&seg)?;
            mailboxes.insert(mailbox.mailbox_id.clone(), mailbox);
        }

        let sync_defaults = SyncPolicy::default();
        let sync = SyncPolicy {
            enabled: parse_bool_env("ZERO_MAIL_SYNC_ENABLED", sync_defaults.enabled)?,
            page_size: parse_usize_env("ZERO_MAIL_SYNC_PAGE_SIZE", sync_defaults.page_size)?
                .clamp(1, 500),
            page_delay: Duration::from_millis(parse_u64_env("ZERO_MAIL_SYNC_PAGE_DELAY_MS", 2_000)?),
            max_threads: parse_usize_env("ZERO_MAIL_SYNC_MAX_THREADS", sync_defaults.max_threads)?,
            folders: optional_env("ZERO_MAIL_SYNC_FOLDERS")?
                .map(|v| split_list(&v))
                .unwrap_or(sync_defaults.folders),
            interval: Duration::from_secs(parse_u64_env("ZERO_MAIL_SYNC_INTERVAL_SECONDS", 300)?),
            guard_ttl: Duration::from_secs(parse_u64_env("ZERO_MAIL_SYNC_GUARD_TTL_SECONDS", 900)?),
        };

        let retry = RetryPolicy {
            max_attempts: parse_u32_env("ZERO_MAIL_RETRY_MAX_ATTEMPTS", 5)?.max(1),
            base_delay: Duration::from_millis(parse_u64_env("ZERO_MAIL_RETRY_BASE_DELAY_MS", 500)?),
            max_delay: Duration::from_millis(parse_u64_env("ZERO_MAIL_RETRY_MAX_DELAY_MS", 10_000)?),
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            base_url: optional_env("ZERO_MAIL_LLM_BASE_URL")?.unwrap_or(llm_defaults.base_url),
            api_key: optional_env("ZERO_MAIL_LLM_API_KEY")?
                .map(|k| SecretString::new(k.into())),
            model: optional_env("ZERO_MAIL_LLM_MODEL")?.unwrap_or(llm_defaults.model),
            system_prompt: optional_env("ZERO_MAIL_LLM_SYSTEM_PROMPT")?,
        };

        Ok(Self {
            mailboxes,
            write_enabled: parse_bool_env("ZERO_MAIL_WRITE_ENABLED", false)?,
            timeouts: ImapTimeouts {
                connect_timeout_ms: parse_u64_env("ZERO_MAIL_CONNECT_TIMEOUT_MS", 30_000)?,
                greeting_timeout_ms: parse_u64_env("ZERO_MAIL_GREETING_TIMEOUT_MS", 15_000)?,
                socket_timeout_ms: parse_u64_env("ZERO_MAIL_SOCKET_TIMEOUT_MS", 300_000)?,
            },
            cache_dir: PathBuf::from(
                optional_env("ZERO_MAIL_CACHE_DIR")?.unwrap_or_else(|| ".zero-mail".to_owned()),
            ),
            http_bind: optional_env("ZERO_MAIL_HTTP_BIND")?
                .unwrap_or_else(|| "127.0.0.1:8787".to_owned()),
            sync,
            retry,
            llm,
        })
    }
}

/// Load a single mailbox configuration from environment
///
/// Reads `ZERO_MAIL_<SEGMENT>_IMAP_HOST`, `_USER`, `_PASS` and the optional
/// port, SMTP, alias and folder-name keys. Normalizes the segment name to
/// lowercase for `mailbox_id`.
fn load_mailbox(segment: &str) -> AppResult<MailboxConfig> {
    let prefix = format!("ZERO_MAIL_{}_", sanitize_segment(segment));
    let imap_host = required_env(&format!("{prefix}IMAP_HOST"))?;
    let user = required_env(&format!("{prefix}USER"))?;
    let pass = optional_env(&format!("{prefix}PASS"))?.map(|p| SecretString::new(p.into()));
    let defaults = FolderNames::default();

    Ok(MailboxConfig {
        mailbox_id: segment.to_ascii_lowercase(),
        smtp_host: optional_env(&format!("{prefix}SMTP_HOST"))?
            .unwrap_or_else(|| imap_host.clone()),
        smtp_port: parse_u16_env(&format!("{prefix}SMTP_PORT"), 465)?,
        imap_host,
        imap_port: parse_u16_env(&format!("{prefix}IMAP_PORT"), 993)?,
        imap_secure: parse_bool_env(&format!("{prefix}IMAP_SECURE"), true)?,
        user,
        pass,
        display_name: optional_env(&format!("{prefix}DISPLAY_NAME"))?,
        aliases: optional_env(&format!("{prefix}ALIASES"))?
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        folders: FolderNames {
            sent: optional_env(&format!("{prefix}SENT_MAILBOX"))?.unwrap_or(defaults.sent),
            drafts: optional_env(&format!("{prefix}DRAFTS_MAILBOX"))?.unwrap_or(defaults.drafts),
            trash: optional_env(&format!("{prefix}TRASH_MAILBOX"))?.unwrap_or(defaults.trash),
            archive: optional_env(&format!("{prefix}ARCHIVE_MAILBOX"))?
                .unwrap_or(defaults.archive),
            spam: optional_env(&format!("{prefix}SPAM_MAILBOX"))?.unwrap_or(defaults.spam),
        },
    })
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable; empty values count as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Sanitize a mailbox segment to uppercase alphanumeric/underscore
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Split a comma-separated list, dropping blanks
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match optional_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a numeric environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse.
fn parse_num_env<T: std::str::FromStr>(key: &str, default: T, kind: &str) -> AppResult<T> {
    match optional_env(key)? {
        Some(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!("invalid {kind} environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_num_env(key, default, "u16")
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    parse_num_env(key, default, "u32")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_num_env(key, default, "u64")
}

fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    parse_num_env(key, default, "usize")
}

#[cfg(test)]
mod tests {
    use super::{parse_bool_value, sanitize_segment, split_list};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn split_list_trims_and_drops_blanks() {
        assert_eq!(
            split_list(" inbox, sent,,archive "),
            vec!["inbox".to_owned(), "sent".to_owned(), "archive".to_owned()]
        );
    }

    #[test]
    fn sanitize_segment_uppercases_and_replaces_symbols() {
        assert_eq!(sanitize_segment("work-mail"), "WORK_MAIL");
        assert_eq!(sanitize_segment("_x_"), "X");
    }
}
