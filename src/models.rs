//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts. Each type is
//! annotated with `JsonSchema` for automatic schema generation.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cache::ThreadCacheRow;
use crate::upstream::{DraftInput, LABEL_UNREAD, OutgoingEmail, Sender};

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
/// This structure provides consistent response shape across all MCP tools.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Agent metadata (no credentials)
///
/// Returned by `list_mailboxes`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MailboxInfo {
    pub mailbox_id: String,
    /// Whether an upstream session is attached
    pub has_session: bool,
    /// Whether the folder sync loop may run
    pub sync_enabled: bool,
}

/// Cached thread as shown in listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ThreadListItem {
    pub id: String,
    pub subject: String,
    pub sender: Sender,
    /// RFC 3339 timestamp of the newest message
    pub received_on: String,
    pub label_ids: Vec<String>,
    pub unread: bool,
}

impl From<&ThreadCacheRow> for ThreadListItem {
    fn from(row: &ThreadCacheRow) -> Self {
        Self {
            id: row.id.clone(),
            subject: row.latest_subject.clone(),
            sender: row.latest_sender.clone(),
            received_on: row.latest_received_on.clone(),
            label_ids: row.latest_label_ids.clone(),
            unread: row.latest_label_ids.iter().any(|l| l == LABEL_UNREAD),
        }
    }
}

/// One page of cached threads
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThreadListing {
    pub threads: Vec<ThreadListItem>,
    /// Pass back as `cursor` for the next page; empty when there is none
    pub next_cursor: String,
}

/// Merged result of the local and upstream search branches
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchResult {
    /// Newest first, deduplicated by thread id
    pub threads: Vec<ThreadListItem>,
    /// Set when the local cache search failed
    pub local_error: Option<String>,
    /// Set when the upstream search failed
    pub upstream_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CountResult {
    pub folder: String,
    pub count: usize,
}

/// Outcome of a thread mutation and the cache refresh after it
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MutationResult {
    /// Rows re-fetched from upstream
    pub refreshed: Vec<String>,
    /// Rows dropped because the thread vanished upstream
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncStatus {
    pub enabled: bool,
    /// Guard keys with a sync in flight
    pub active: Vec<String>,
}

/// Input: mailbox_id only
///
/// Used by `list_labels`, `email_aliases` and `sync_status`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MailboxOnlyInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
}

/// Input: list cached threads of a folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListThreadsInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    /// Folder name (`inbox`, `sent`, `draft`, `bin`, `spam`, `archive`) or user label id
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Case-insensitive substring of subject or sender
    pub query: Option<String>,
    /// Keep threads carrying any of these label ids
    #[serde(default)]
    pub label_ids: Vec<String>,
    /// Maximum threads to return (1..100, default 20)
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// `next_cursor` from the previous page
    pub cursor: Option<String>,
}

/// Input: search threads locally and upstream
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchThreadsInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub query: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    /// Maximum threads to return (1..100, default 20)
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

/// Input: one folder
///
/// Used by `count_threads` and `sync_folder`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FolderInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    #[serde(default = "default_folder")]
    pub folder: String,
}

/// Input: one thread
///
/// Used by `get_thread` and `sync_thread`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ThreadInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub thread_id: String,
}

/// Input: a batch of threads
///
/// Used by `mark_as_read`, `mark_as_unread` and `bulk_archive`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ThreadIdsInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    /// Thread ids (1..100)
    pub thread_ids: Vec<String>,
}

/// Input: move threads to the bin. Requires explicit `confirm=true`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BulkDeleteInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub thread_ids: Vec<String>,
    /// Explicit confirmation required (must be `true`)
    pub confirm: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ModifyLabelsInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub thread_ids: Vec<String>,
    #[serde(default)]
    pub add_label_ids: Vec<String>,
    #[serde(default)]
    pub remove_label_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct LabelInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub label_id: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateLabelInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateLabelInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub label_id: String,
    /// New display name
    pub name: String,
}

/// Input: delete a user label. Requires explicit `confirm=true`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteLabelInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub label_id: String,
    pub confirm: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CreateDraftInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    #[serde(flatten)]
    pub draft: DraftInput,
}

/// Input: one draft
///
/// Used by `get_draft` and `send_draft`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DraftIdInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub draft_id: String,
}

/// Input: delete a draft. Requires explicit `confirm=true`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteDraftInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub draft_id: String,
    pub confirm: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListDraftsInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    /// `next_page_token` from the previous page
    pub page_token: Option<String>,
    /// Maximum drafts to return (1..100, default 20)
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    #[serde(flatten)]
    pub email: OutgoingEmail,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SetSyncEnabledInput {
    /// Mailbox identifier (defaults to `"default"`)
    #[serde(default = "default_mailbox_id")]
    pub mailbox_id: String,
    pub enabled: bool,
}

/// Default value for `mailbox_id` field
pub fn default_mailbox_id() -> String {
    "default".to_owned()
}

fn default_folder() -> String {
    "inbox".to_owned()
}

/// Default page size for listings
///
/// Keeps a single response readable while pagination covers the rest.
fn default_max_results() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CreateDraftInput, ListThreadsInput, ThreadListItem};
    use crate::cache::ThreadCacheRow;
    use crate::upstream::Sender;

    #[test]
    fn list_input_defaults() {
        let input: ListThreadsInput = serde_json::from_value(json!({})).expect("parse");
        assert_eq!(input.mailbox_id, "default");
        assert_eq!(input.folder, "inbox");
        assert_eq!(input.max_results, 20);
        assert!(input.label_ids.is_empty());
    }

    #[test]
    fn draft_input_is_flattened() {
        let input: CreateDraftInput = serde_json::from_value(json!({
            "mailbox_id": "work",
            "to": ["a@example.com"],
            "subject": "Hi",
            "body": "Hello"
        }))
        .expect("parse");
        assert_eq!(input.mailbox_id, "work");
        assert_eq!(input.draft.to, vec!["a@example.com"]);
        assert!(input.draft.cc.is_empty());
    }

    #[test]
    fn list_item_derives_unread_from_labels() {
        let row = ThreadCacheRow {
            id: "t1".to_owned(),
            provider_thread_id: "t1".to_owned(),
            provider_id: "fake".to_owned(),
            latest_sender: Sender {
                name: None,
                email: "a@example.com".to_owned(),
            },
            latest_received_on: "2025-01-01T00:00:00.000Z".to_owned(),
            latest_subject: "Hi".to_owned(),
            latest_label_ids: vec!["INBOX".to_owned(), "UNREAD".to_owned()],
            updated_at: "2025-01-01T00:00:00.000Z".to_owned(),
        };
        let item = ThreadListItem::from(&row);
        assert!(item.unread);
        assert_eq!(item.subject, "Hi");
    }
}
