//! Upstream mail provider contract
//!
//! The agent talks to its mail provider only through [`MailProvider`]. Types
//! here follow a Gmail-like model: threads, label ids, drafts and aliases.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::AppResult;

pub const LABEL_INBOX: &str = "INBOX";
pub const LABEL_SENT: &str = "SENT";
pub const LABEL_DRAFT: &str = "DRAFT";
pub const LABEL_TRASH: &str = "TRASH";
pub const LABEL_SPAM: &str = "SPAM";
pub const LABEL_ARCHIVE: &str = "ARCHIVE";
pub const LABEL_UNREAD: &str = "UNREAD";
pub const LABEL_STARRED: &str = "STARRED";
pub const LABEL_IMPORTANT: &str = "IMPORTANT";

/// Map a folder name (`inbox`, `sent`, `bin`, ...) to its system label id
///
/// Unknown folders are treated as user label ids and returned unchanged.
pub fn folder_label(folder: &str) -> String {
    match folder.trim().to_ascii_lowercase().as_str() {
        "inbox" => LABEL_INBOX.to_owned(),
        "sent" => LABEL_SENT.to_owned(),
        "draft" | "drafts" => LABEL_DRAFT.to_owned(),
        "bin" | "trash" => LABEL_TRASH.to_owned(),
        "spam" | "junk" => LABEL_SPAM.to_owned(),
        "archive" => LABEL_ARCHIVE.to_owned(),
        _ => folder.trim().to_owned(),
    }
}

/// Lightweight thread reference returned by listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ThreadSummary {
    pub id: String,
}

/// One page of upstream thread listing
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ThreadPage {
    pub threads: Vec<ThreadSummary>,
    /// Continuation token; `None` or empty means no further pages
    pub next_page_token: Option<String>,
}

impl ThreadPage {
    /// The continuation token if it is non-empty
    pub fn continuation(&self) -> Option<&str> {
        self.next_page_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Upstream listing request
#[derive(Debug, Clone, Default)]
pub struct ListThreadsRequest {
    pub folder: String,
    pub query: Option<String>,
    pub label_ids: Vec<String>,
    pub max_results: usize,
    pub page_token: Option<String>,
}

/// Mail address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Sender {
    pub name: Option<String>,
    pub email: String,
}

impl Sender {
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.email),
            _ => self.email.clone(),
        }
    }
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AttachmentInfo {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`, `image/jpeg`)
    pub content_type: String,
    /// Attachment size in bytes
    pub size_bytes: usize,
    /// Part ID for MIME structure (e.g., `1`, `2`, `3.1`)
    pub part_id: String,
}

/// A single parsed message
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    /// RFC 5322 Message-ID header
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: Sender,
    pub to: Vec<Sender>,
    pub cc: Vec<Sender>,
    /// RFC 3339 UTC timestamp with millisecond precision
    pub received_on: String,
    pub label_ids: Vec<String>,
    pub unread: bool,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Full thread detail, oldest message first
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThreadDetail {
    pub id: String,
    pub messages: Vec<MailMessage>,
}

impl ThreadDetail {
    /// Most recent message by `received_on`
    pub fn latest(&self) -> Option<&MailMessage> {
        self.messages.iter().max_by(|a, b| a.received_on.cmp(&b.received_on))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub kind: LabelKind,
}

/// Draft contents supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DraftInput {
    /// Existing draft to replace
    pub draft_id: Option<String>,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Message-ID of the message being replied to
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Draft {
    pub id: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: Option<String>,
    pub updated_on: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DraftPage {
    pub drafts: Vec<Draft>,
    pub next_page_token: Option<String>,
}

/// Message to send directly
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    /// Alias address to send from; defaults to the primary address
    pub from_alias: Option<String>,
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EmailAlias {
    pub email: String,
    pub name: Option<String>,
    pub primary: bool,
}

/// Mail provider operations used by the agent
///
/// Implementations map these calls onto the provider's API and classify
/// failures as retryable (`RateLimited`, `Unavailable`, `Timeout`) or fatal.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Stable identifier of the upstream connection (stored on cache rows)
    fn provider_id(&self) -> &str;

    async fn list_threads(&self, request: &ListThreadsRequest) -> AppResult<ThreadPage>;
    async fn get_thread(&self, thread_id: &str) -> AppResult<ThreadDetail>;
    async fn modify_labels(
        &self,
        thread_ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> AppResult<()>;

    async fn list_labels(&self) -> AppResult<Vec<Label>>;
    async fn get_label(&self, label_id: &str) -> AppResult<Label>;
    async fn create_label(&self, name: &str) -> AppResult<Label>;
    async fn update_label(&self, label_id: &str, name: &str) -> AppResult<Label>;
    async fn delete_label(&self, label_id: &str) -> AppResult<()>;

    async fn create_draft(&self, draft: &DraftInput) -> AppResult<Draft>;
    async fn get_draft(&self, draft_id: &str) -> AppResult<Draft>;
    async fn list_drafts(&self, page_token: Option<&str>, max_results: usize)
    -> AppResult<DraftPage>;
    async fn delete_draft(&self, draft_id: &str) -> AppResult<()>;
    async fn send_draft(&self, draft_id: &str) -> AppResult<()>;
    async fn send_email(&self, email: &OutgoingEmail) -> AppResult<()>;

    async fn aliases(&self) -> AppResult<Vec<EmailAlias>>;
}
