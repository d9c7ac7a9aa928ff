//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers one MCP tool per agent
//! operation. Handles input validation, write gating and response
//! formatting; the work itself is done by the mailbox's [`ZeroAgent`].

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::agent::{AgentRegistry, ThreadQuery, ZeroAgent};
use crate::chat::{ChatToolSpec, ChatTools};
use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    BulkDeleteInput, CountResult, CreateDraftInput, CreateLabelInput, DeleteDraftInput,
    DeleteLabelInput, DraftIdInput, FolderInput, LabelInput, ListDraftsInput, ListThreadsInput,
    MailboxInfo, MailboxOnlyInput, Meta, ModifyLabelsInput, MutationResult, SearchResult,
    SearchThreadsInput, SendEmailInput, SetSyncEnabledInput, SyncStatus, ThreadIdsInput,
    ThreadInput, ThreadListing, ToolEnvelope, UpdateLabelInput,
};
use crate::upstream::{Draft, DraftInput, DraftPage, EmailAlias, Label, OutgoingEmail, ThreadDetail};

/// Maximum threads per listing or search page
const MAX_RESULTS: usize = 100;
/// Maximum thread ids per mutation
const MAX_THREAD_IDS: usize = 100;

/// Mail agent MCP server
///
/// Holds shared configuration and the agent registry. Implements MCP tool
/// handlers via `#[tool]` attribute macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct ZeroMailServer {
    /// Server config (write flag)
    config: Arc<ServerConfig>,
    /// One agent per configured mailbox
    agents: Arc<AgentRegistry>,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl ZeroMailServer {
    pub fn new(config: Arc<ServerConfig>, agents: Arc<AgentRegistry>) -> Self {
        Self {
            config,
            agents,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "mail_list_mailboxes",
        description = "List configured mailboxes and their session state"
    )]
    async fn list_mailboxes(&self) -> Result<Json<ToolEnvelope<Vec<MailboxInfo>>>, ErrorData> {
        let started = Instant::now();
        let data = self
            .agents
            .agents()
            .map(|agent| {
                let status = agent.sync_status();
                MailboxInfo {
                    mailbox_id: agent.mailbox_id().to_owned(),
                    has_session: agent.has_session(),
                    sync_enabled: status.enabled,
                }
            })
            .collect::<Vec<_>>();
        finalize_tool(
            started,
            Ok((format!("{} mailbox(es) configured", data.len()), data)),
        )
    }

    /// Tool: List cached threads of a folder
    ///
    /// Newest first with keyset pagination. An empty folder is synced from
    /// upstream before the first page is read.
    #[tool(
        name = "mail_list_threads",
        description = "List threads of a folder, newest first, with cursor pagination"
    )]
    async fn list_threads(
        &self,
        Parameters(input): Parameters<ListThreadsInput>,
    ) -> Result<Json<ToolEnvelope<ThreadListing>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_threads_impl(input)
                .await
                .map(|data| (format!("{} thread(s) returned", data.threads.len()), data)),
        )
    }

    #[tool(
        name = "mail_get_thread",
        description = "Get a thread with all of its messages"
    )]
    async fn get_thread(
        &self,
        Parameters(input): Parameters<ThreadInput>,
    ) -> Result<Json<ToolEnvelope<ThreadDetail>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, ThreadDetail)> = async {
            validate_thread_id(&input.thread_id)?;
            let agent = self.agent(&input.mailbox_id)?;
            let thread = agent.get_thread(&input.thread_id).await?;
            Ok((format!("{} message(s) in thread", thread.messages.len()), thread))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Search the cache and upstream in parallel
    ///
    /// Either side failing degrades to the other side's results; the failure
    /// is reported in `local_error` or `upstream_error`.
    #[tool(
        name = "mail_search_threads",
        description = "Search threads in the local cache and upstream in parallel"
    )]
    async fn search_threads(
        &self,
        Parameters(input): Parameters<SearchThreadsInput>,
    ) -> Result<Json<ToolEnvelope<SearchResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, SearchResult)> = async {
            validate_query(&input.query)?;
            validate_folder(&input.folder)?;
            validate_range(input.max_results, 1, MAX_RESULTS, "max_results")?;
            let agent = self.agent(&input.mailbox_id)?;
            let data = agent
                .search_threads(&input.query, &input.folder, input.max_results)
                .await?;
            let degraded = data.local_error.is_some() || data.upstream_error.is_some();
            let summary = if degraded {
                format!("{} thread(s) found (partial results)", data.threads.len())
            } else {
                format!("{} thread(s) found", data.threads.len())
            };
            Ok((summary, data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_count_threads",
        description = "Count cached threads in a folder"
    )]
    async fn count_threads(
        &self,
        Parameters(input): Parameters<FolderInput>,
    ) -> Result<Json<ToolEnvelope<CountResult>>, ErrorData> {
        let started = Instant::now();
        let result = self.count_threads_impl(&input);
        finalize_tool(started, result)
    }

    /// Tool: Run a paginated folder sync now
    ///
    /// Returns `already_running` when a sync of the same folder is in
    /// flight.
    #[tool(
        name = "mail_sync_folder",
        description = "Sync a folder from upstream into the cache"
    )]
    async fn sync_folder(
        &self,
        Parameters(input): Parameters<FolderInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, serde_json::Value)> = async {
            validate_folder(&input.folder)?;
            let outcome = self.agent(&input.mailbox_id)?.sync_folder(&input.folder).await?;
            let data = serde_json::to_value(outcome)?;
            Ok(("Folder sync finished".to_owned(), data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_sync_thread",
        description = "Re-fetch one thread from upstream into the cache"
    )]
    async fn sync_thread(
        &self,
        Parameters(input): Parameters<ThreadInput>,
    ) -> Result<Json<ToolEnvelope<MutationResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, MutationResult)> = async {
            validate_thread_id(&input.thread_id)?;
            let data = self
                .agent(&input.mailbox_id)?
                .sync_thread(&input.thread_id)
                .await?;
            Ok((mutation_summary("Thread synced", &data), data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_sync_status",
        description = "Show whether sync is enabled and which syncs are running"
    )]
    async fn sync_status(
        &self,
        Parameters(input): Parameters<MailboxOnlyInput>,
    ) -> Result<Json<ToolEnvelope<SyncStatus>>, ErrorData> {
        let started = Instant::now();
        let result = self.agent(&input.mailbox_id).map(|agent| {
            let status = agent.sync_status();
            (format!("{} sync(s) running", status.active.len()), status)
        });
        finalize_tool(started, result)
    }

    /// Tool: Turn the folder sync loop on or off
    ///
    /// A running folder sync stops after its current page when disabled.
    #[tool(
        name = "mail_set_sync_enabled",
        description = "Enable or disable the folder sync loop"
    )]
    async fn set_sync_enabled(
        &self,
        Parameters(input): Parameters<SetSyncEnabledInput>,
    ) -> Result<Json<ToolEnvelope<SyncStatus>>, ErrorData> {
        let started = Instant::now();
        let result = self.agent(&input.mailbox_id).map(|agent| {
            let status = agent.set_sync_enabled(input.enabled);
            let summary = if status.enabled {
                "Sync enabled"
            } else {
                "Sync disabled"
            };
            (summary.to_owned(), status)
        });
        finalize_tool(started, result)
    }

    /// Tool: Add or remove labels on threads
    ///
    /// Requires `ZERO_MAIL_WRITE_ENABLED=true`. Affected cache rows are
    /// refreshed from upstream afterwards.
    #[tool(
        name = "mail_modify_labels",
        description = "Add or remove labels on threads"
    )]
    async fn modify_labels(
        &self,
        Parameters(input): Parameters<ModifyLabelsInput>,
    ) -> Result<Json<ToolEnvelope<MutationResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, MutationResult)> = async {
            require_write_enabled(&self.config)?;
            validate_thread_ids(&input.thread_ids)?;
            validate_label_ids(&input.add_label_ids, "add_label_ids")?;
            validate_label_ids(&input.remove_label_ids, "remove_label_ids")?;
            let data = self
                .agent(&input.mailbox_id)?
                .modify_labels(
                    &input.thread_ids,
                    &input.add_label_ids,
                    &input.remove_label_ids,
                )
                .await?;
            Ok((mutation_summary("Labels updated", &data), data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_mark_as_read", description = "Mark threads as read")]
    async fn mark_as_read(
        &self,
        Parameters(input): Parameters<ThreadIdsInput>,
    ) -> Result<Json<ToolEnvelope<MutationResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, MutationResult)> = async {
            let agent = self.thread_mutation(&input)?;
            let data = agent.mark_as_read(&input.thread_ids).await?;
            Ok((mutation_summary("Marked as read", &data), data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_mark_as_unread", description = "Mark threads as unread")]
    async fn mark_as_unread(
        &self,
        Parameters(input): Parameters<ThreadIdsInput>,
    ) -> Result<Json<ToolEnvelope<MutationResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, MutationResult)> = async {
            let agent = self.thread_mutation(&input)?;
            let data = agent.mark_as_unread(&input.thread_ids).await?;
            Ok((mutation_summary("Marked as unread", &data), data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_bulk_archive",
        description = "Archive threads (remove them from the inbox)"
    )]
    async fn bulk_archive(
        &self,
        Parameters(input): Parameters<ThreadIdsInput>,
    ) -> Result<Json<ToolEnvelope<MutationResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, MutationResult)> = async {
            let agent = self.thread_mutation(&input)?;
            let data = agent.bulk_archive(&input.thread_ids).await?;
            Ok((mutation_summary("Archived", &data), data))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Move threads to the bin
    ///
    /// Requires explicit `confirm=true` and `ZERO_MAIL_WRITE_ENABLED=true`.
    #[tool(name = "mail_bulk_delete", description = "Move threads to the bin")]
    async fn bulk_delete(
        &self,
        Parameters(input): Parameters<BulkDeleteInput>,
    ) -> Result<Json<ToolEnvelope<MutationResult>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, MutationResult)> = async {
            require_write_enabled(&self.config)?;
            require_confirm(input.confirm, "bulk_delete")?;
            validate_thread_ids(&input.thread_ids)?;
            let data = self
                .agent(&input.mailbox_id)?
                .bulk_delete(&input.thread_ids)
                .await?;
            Ok((mutation_summary("Moved to bin", &data), data))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_list_labels", description = "List labels of a mailbox")]
    async fn list_labels(
        &self,
        Parameters(input): Parameters<MailboxOnlyInput>,
    ) -> Result<Json<ToolEnvelope<Vec<Label>>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Vec<Label>)> = async {
            let labels = self.agent(&input.mailbox_id)?.list_labels().await?;
            Ok((format!("{} label(s)", labels.len()), labels))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_get_label", description = "Get one label")]
    async fn get_label(
        &self,
        Parameters(input): Parameters<LabelInput>,
    ) -> Result<Json<ToolEnvelope<Label>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Label)> = async {
            validate_label_id(&input.label_id, "label_id")?;
            let label = self
                .agent(&input.mailbox_id)?
                .get_label(&input.label_id)
                .await?;
            Ok((format!("Label {}", label.name), label))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_create_label", description = "Create a user label")]
    async fn create_label(
        &self,
        Parameters(input): Parameters<CreateLabelInput>,
    ) -> Result<Json<ToolEnvelope<Label>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Label)> = async {
            require_write_enabled(&self.config)?;
            validate_label_name(&input.name)?;
            let label = self
                .agent(&input.mailbox_id)?
                .create_label(&input.name)
                .await?;
            Ok(("Label created".to_owned(), label))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_update_label", description = "Rename a user label")]
    async fn update_label(
        &self,
        Parameters(input): Parameters<UpdateLabelInput>,
    ) -> Result<Json<ToolEnvelope<Label>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Label)> = async {
            require_write_enabled(&self.config)?;
            validate_label_id(&input.label_id, "label_id")?;
            validate_label_name(&input.name)?;
            let label = self
                .agent(&input.mailbox_id)?
                .update_label(&input.label_id, &input.name)
                .await?;
            Ok(("Label updated".to_owned(), label))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Delete a user label
    ///
    /// Requires explicit `confirm=true` and `ZERO_MAIL_WRITE_ENABLED=true`.
    #[tool(name = "mail_delete_label", description = "Delete a user label")]
    async fn delete_label(
        &self,
        Parameters(input): Parameters<DeleteLabelInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, serde_json::Value)> = async {
            require_write_enabled(&self.config)?;
            require_confirm(input.confirm, "delete_label")?;
            validate_label_id(&input.label_id, "label_id")?;
            self.agent(&input.mailbox_id)?
                .delete_label(&input.label_id)
                .await?;
            Ok((
                "Label deleted".to_owned(),
                json!({ "label_id": input.label_id }),
            ))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Create or replace a draft
    ///
    /// Passing `draft_id` replaces that draft. Requires
    /// `ZERO_MAIL_WRITE_ENABLED=true`.
    #[tool(name = "mail_create_draft", description = "Create or replace a draft")]
    async fn create_draft(
        &self,
        Parameters(input): Parameters<CreateDraftInput>,
    ) -> Result<Json<ToolEnvelope<Draft>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Draft)> = async {
            require_write_enabled(&self.config)?;
            validate_draft(&input.draft)?;
            let draft = self
                .agent(&input.mailbox_id)?
                .create_draft(&input.draft)
                .await?;
            Ok(("Draft saved".to_owned(), draft))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_get_draft", description = "Get one draft")]
    async fn get_draft(
        &self,
        Parameters(input): Parameters<DraftIdInput>,
    ) -> Result<Json<ToolEnvelope<Draft>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Draft)> = async {
            validate_thread_id(&input.draft_id)?;
            let draft = self
                .agent(&input.mailbox_id)?
                .get_draft(&input.draft_id)
                .await?;
            Ok(("Draft retrieved".to_owned(), draft))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_list_drafts", description = "List drafts, newest first")]
    async fn list_drafts(
        &self,
        Parameters(input): Parameters<ListDraftsInput>,
    ) -> Result<Json<ToolEnvelope<DraftPage>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, DraftPage)> = async {
            validate_range(input.max_results, 1, MAX_RESULTS, "max_results")?;
            if let Some(token) = &input.page_token {
                validate_no_controls(token, "page_token")?;
            }
            let page = self
                .agent(&input.mailbox_id)?
                .list_drafts(input.page_token.as_deref(), input.max_results)
                .await?;
            Ok((format!("{} draft(s) returned", page.drafts.len()), page))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Delete a draft
    ///
    /// Requires explicit `confirm=true` and `ZERO_MAIL_WRITE_ENABLED=true`.
    #[tool(name = "mail_delete_draft", description = "Delete a draft")]
    async fn delete_draft(
        &self,
        Parameters(input): Parameters<DeleteDraftInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, serde_json::Value)> = async {
            require_write_enabled(&self.config)?;
            require_confirm(input.confirm, "delete_draft")?;
            validate_thread_id(&input.draft_id)?;
            self.agent(&input.mailbox_id)?
                .delete_draft(&input.draft_id)
                .await?;
            Ok((
                "Draft deleted".to_owned(),
                json!({ "draft_id": input.draft_id }),
            ))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(name = "mail_send_draft", description = "Send a saved draft")]
    async fn send_draft(
        &self,
        Parameters(input): Parameters<DraftIdInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, serde_json::Value)> = async {
            require_write_enabled(&self.config)?;
            validate_thread_id(&input.draft_id)?;
            self.agent(&input.mailbox_id)?
                .send_draft(&input.draft_id)
                .await?;
            Ok((
                "Draft sent".to_owned(),
                json!({ "draft_id": input.draft_id }),
            ))
        }
        .await;
        finalize_tool(started, result)
    }

    /// Tool: Send an email directly
    ///
    /// A copy is stored in the Sent folder. Requires
    /// `ZERO_MAIL_WRITE_ENABLED=true`.
    #[tool(name = "mail_send_email", description = "Send an email")]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, serde_json::Value)> = async {
            require_write_enabled(&self.config)?;
            validate_outgoing(&input.email)?;
            self.agent(&input.mailbox_id)?
                .send_email(&input.email)
                .await?;
            Ok((
                "Email sent".to_owned(),
                json!({ "recipients": input.email.to.len() + input.email.cc.len() + input.email.bcc.len() }),
            ))
        }
        .await;
        finalize_tool(started, result)
    }

    #[tool(
        name = "mail_email_aliases",
        description = "List addresses this mailbox can send from"
    )]
    async fn email_aliases(
        &self,
        Parameters(input): Parameters<MailboxOnlyInput>,
    ) -> Result<Json<ToolEnvelope<Vec<EmailAlias>>>, ErrorData> {
        let started = Instant::now();
        let result: AppResult<(String, Vec<EmailAlias>)> = async {
            let aliases = self.agent(&input.mailbox_id)?.email_aliases().await?;
            Ok((format!("{} alias(es)", aliases.len()), aliases))
        }
        .await;
        finalize_tool(started, result)
    }
}

/// MCP server handler implementation
///
/// Provides server info and capabilities to MCP client.
#[tool_handler(router = self.tool_router)]
impl ServerHandler for ZeroMailServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Per-mailbox mail agent with a local thread cache. Read tools are enabled by default; label, draft, send and bulk tools require ZERO_MAIL_WRITE_ENABLED=true.".to_owned(),
        )
    }
}

/// Tools the chat model may call; destructive and sending tools stay MCP-only
const CHAT_TOOLS: &[&str] = &[
    "mail_list_threads",
    "mail_get_thread",
    "mail_search_threads",
    "mail_count_threads",
    "mail_list_labels",
    "mail_get_label",
    "mail_list_drafts",
    "mail_get_draft",
    "mail_email_aliases",
    "mail_mark_as_read",
    "mail_mark_as_unread",
    "mail_bulk_archive",
    "mail_modify_labels",
    "mail_create_label",
    "mail_create_draft",
];

/// Chat tool dispatcher bound to one mailbox
///
/// Calls run through the MCP tool handlers, so input validation and the
/// write gate apply unchanged. The registry is held weakly since every
/// agent owns the chat service these tools are registered on.
pub struct MailboxChatTools {
    config: Arc<ServerConfig>,
    agents: Weak<AgentRegistry>,
    mailbox_id: String,
    specs: Vec<ChatToolSpec>,
}

impl MailboxChatTools {
    pub fn new(
        config: Arc<ServerConfig>,
        agents: &Arc<AgentRegistry>,
        mailbox_id: &str,
    ) -> Self {
        let specs = ZeroMailServer::tool_router()
            .list_all()
            .into_iter()
            .filter(|tool| CHAT_TOOLS.iter().any(|name| *name == tool.name))
            .map(|tool| {
                let mut parameters = (*tool.input_schema).clone();
                parameters.remove("$schema");
                if let Some(properties) = parameters
                    .get_mut("properties")
                    .and_then(Value::as_object_mut)
                {
                    properties.remove("mailbox_id");
                }
                ChatToolSpec {
                    name: tool.name.into_owned(),
                    description: tool.description.map(|d| d.into_owned()).unwrap_or_default(),
                    parameters: Value::Object(parameters),
                }
            })
            .collect();
        Self {
            config,
            agents: Arc::downgrade(agents),
            mailbox_id: mailbox_id.to_owned(),
            specs,
        }
    }
}

#[async_trait]
impl ChatTools for MailboxChatTools {
    fn specs(&self) -> Vec<ChatToolSpec> {
        self.specs.clone()
    }

    async fn call(&self, name: &str, arguments: &str) -> Value {
        let Some(agents) = self.agents.upgrade() else {
            return json!({ "error": "mailbox agents are shut down" });
        };
        let server = ZeroMailServer::new(Arc::clone(&self.config), agents);
        match server.call_chat_tool(&self.mailbox_id, name, arguments).await {
            Ok(value) => value,
            Err(e) => json!({ "error": e.message }),
        }
    }
}

/// Let every agent's chat act on its own mailbox
pub fn attach_chat_tools(config: &Arc<ServerConfig>, agents: &Arc<AgentRegistry>) {
    for agent in agents.agents() {
        agent.chat().set_tools(Arc::new(MailboxChatTools::new(
            Arc::clone(config),
            agents,
            agent.mailbox_id(),
        )));
    }
}

/// Decode chat arguments, run one tool handler and flatten its envelope
async fn run_chat_tool<I, T, F, Fut>(arguments: Value, handler: F) -> Result<Value, ErrorData>
where
    I: DeserializeOwned,
    T: Serialize + schemars::JsonSchema,
    F: FnOnce(Parameters<I>) -> Fut,
    Fut: Future<Output = Result<Json<ToolEnvelope<T>>, ErrorData>>,
{
    let input = serde_json::from_value(arguments).map_err(|e| {
        AppError::InvalidInput(format!("invalid tool arguments: {e}")).to_error_data()
    })?;
    let Json(envelope) = handler(Parameters(input)).await?;
    serde_json::to_value(envelope)
        .map_err(|e| AppError::Internal(format!("tool result encoding: {e}")).to_error_data())
}

impl ZeroMailServer {
    /// Dispatch a chat tool call against `mailbox_id`
    ///
    /// Any `mailbox_id` in the arguments is overridden so the model cannot
    /// reach other mailboxes.
    async fn call_chat_tool(
        &self,
        mailbox_id: &str,
        name: &str,
        arguments: &str,
    ) -> Result<Value, ErrorData> {
        if !CHAT_TOOLS.iter().any(|tool| *tool == name) {
            return Err(AppError::NotFound(format!("unknown tool '{name}'")).to_error_data());
        }
        let mut args = match arguments.trim() {
            "" => Value::Object(Map::new()),
            raw => serde_json::from_str::<Value>(raw).map_err(|e| {
                AppError::InvalidInput(format!("tool arguments are not JSON: {e}")).to_error_data()
            })?,
        };
        let Some(object) = args.as_object_mut() else {
            return Err(
                AppError::InvalidInput("tool arguments must be an object".to_owned())
                    .to_error_data(),
            );
        };
        object.insert("mailbox_id".to_owned(), Value::from(mailbox_id));

        match name {
            "mail_list_threads" => run_chat_tool(args, |p| self.list_threads(p)).await,
            "mail_get_thread" => run_chat_tool(args, |p| self.get_thread(p)).await,
            "mail_search_threads" => run_chat_tool(args, |p| self.search_threads(p)).await,
            "mail_count_threads" => run_chat_tool(args, |p| self.count_threads(p)).await,
            "mail_list_labels" => run_chat_tool(args, |p| self.list_labels(p)).await,
            "mail_get_label" => run_chat_tool(args, |p| self.get_label(p)).await,
            "mail_list_drafts" => run_chat_tool(args, |p| self.list_drafts(p)).await,
            "mail_get_draft" => run_chat_tool(args, |p| self.get_draft(p)).await,
            "mail_email_aliases" => run_chat_tool(args, |p| self.email_aliases(p)).await,
            "mail_mark_as_read" => run_chat_tool(args, |p| self.mark_as_read(p)).await,
            "mail_mark_as_unread" => run_chat_tool(args, |p| self.mark_as_unread(p)).await,
            "mail_bulk_archive" => run_chat_tool(args, |p| self.bulk_archive(p)).await,
            "mail_modify_labels" => run_chat_tool(args, |p| self.modify_labels(p)).await,
            "mail_create_label" => run_chat_tool(args, |p| self.create_label(p)).await,
            "mail_create_draft" => run_chat_tool(args, |p| self.create_draft(p)).await,
            other => Err(AppError::NotFound(format!("unknown tool '{other}'")).to_error_data()),
        }
    }

    fn agent(&self, mailbox_id: &str) -> AppResult<Arc<ZeroAgent>> {
        validate_mailbox_id(mailbox_id)?;
        self.agents.get(mailbox_id)
    }

    /// Write gate and id checks shared by the batch label tools
    fn thread_mutation(&self, input: &ThreadIdsInput) -> AppResult<Arc<ZeroAgent>> {
        require_write_enabled(&self.config)?;
        validate_thread_ids(&input.thread_ids)?;
        self.agent(&input.mailbox_id)
    }

    fn count_threads_impl(&self, input: &FolderInput) -> AppResult<(String, CountResult)> {
        validate_folder(&input.folder)?;
        let count = self.agent(&input.mailbox_id)?.count_threads(&input.folder)?;
        Ok((
            format!("{count} cached thread(s)"),
            CountResult {
                folder: input.folder.clone(),
                count,
            },
        ))
    }

    async fn list_threads_impl(&self, input: ListThreadsInput) -> AppResult<ThreadListing> {
        validate_folder(&input.folder)?;
        validate_range(input.max_results, 1, MAX_RESULTS, "max_results")?;
        validate_label_ids(&input.label_ids, "label_ids")?;
        if let Some(query) = &input.query {
            validate_query(query)?;
        }
        if let Some(cursor) = &input.cursor {
            validate_no_controls(cursor, "cursor")?;
        }
        let agent = self.agent(&input.mailbox_id)?;
        agent
            .list_threads(&ThreadQuery {
                folder: input.folder,
                query: input.query,
                label_ids: input.label_ids,
                max_results: input.max_results,
                cursor: input.cursor,
            })
            .await
    }
}

fn mutation_summary(action: &str, data: &MutationResult) -> String {
    if data.evicted.is_empty() {
        format!("{action}: {} thread(s) refreshed", data.refreshed.len())
    } else {
        format!(
            "{action}: {} thread(s) refreshed, {} removed from cache",
            data.refreshed.len(),
            data.evicted.len()
        )
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Validate mailbox_id format
fn validate_mailbox_id(mailbox_id: &str) -> AppResult<()> {
    if mailbox_id.is_empty() || mailbox_id.len() > 64 {
        return Err(AppError::InvalidInput(
            "mailbox_id must be 1..64 characters".to_owned(),
        ));
    }
    if !mailbox_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::InvalidInput(
            "mailbox_id must match [A-Za-z0-9_-]+".to_owned(),
        ));
    }
    Ok(())
}

/// Validate folder name or user label id
fn validate_folder(folder: &str) -> AppResult<()> {
    if folder.trim().is_empty() || folder.len() > 256 {
        return Err(AppError::InvalidInput(
            "folder must be 1..256 characters".to_owned(),
        ));
    }
    validate_no_controls(folder, "folder")
}

fn validate_thread_id(id: &str) -> AppResult<()> {
    if id.is_empty() || id.len() > 512 {
        return Err(AppError::InvalidInput(
            "id must be 1..512 characters".to_owned(),
        ));
    }
    validate_no_controls(id, "id")
}

fn validate_thread_ids(ids: &[String]) -> AppResult<()> {
    validate_range(ids.len(), 1, MAX_THREAD_IDS, "thread_ids length")?;
    ids.iter().try_for_each(|id| validate_thread_id(id))
}

fn validate_label_id(id: &str, field: &str) -> AppResult<()> {
    if id.is_empty() || id.len() > 256 {
        return Err(AppError::InvalidInput(format!(
            "{field} entries must be 1..256 characters"
        )));
    }
    validate_no_controls(id, field)
}

fn validate_label_ids(ids: &[String], field: &str) -> AppResult<()> {
    ids.iter().try_for_each(|id| validate_label_id(id, field))
}

fn validate_label_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() || name.len() > 225 {
        return Err(AppError::InvalidInput(
            "name must be 1..225 characters".to_owned(),
        ));
    }
    validate_no_controls(name, "name")
}

/// Validate search text (1..256 chars, no control characters)
fn validate_query(query: &str) -> AppResult<()> {
    let len = query.chars().count();
    if len == 0 || len > 256 {
        return Err(AppError::InvalidInput(
            "query must be 1..256 characters".to_owned(),
        ));
    }
    validate_no_controls(query, "query")
}

/// Reject control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Validate numeric value in range
fn validate_range(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::InvalidInput(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

fn validate_addresses(addresses: &[String], field: &str) -> AppResult<()> {
    for address in addresses {
        validate_no_controls(address, field)?;
        if !address.contains('@') {
            return Err(AppError::InvalidInput(format!(
                "{field} contains an invalid address: {address}"
            )));
        }
    }
    Ok(())
}

fn validate_draft(draft: &DraftInput) -> AppResult<()> {
    validate_addresses(&draft.to, "to")?;
    validate_addresses(&draft.cc, "cc")?;
    validate_addresses(&draft.bcc, "bcc")?;
    validate_no_controls(&draft.subject, "subject")?;
    if let Some(id) = &draft.draft_id {
        validate_thread_id(id)?;
    }
    Ok(())
}

fn validate_outgoing(email: &OutgoingEmail) -> AppResult<()> {
    if email.to.is_empty() {
        return Err(AppError::InvalidInput(
            "at least one recipient is required".to_owned(),
        ));
    }
    validate_addresses(&email.to, "to")?;
    validate_addresses(&email.cc, "cc")?;
    validate_addresses(&email.bcc, "bcc")?;
    validate_no_controls(&email.subject, "subject")?;
    if let Some(alias) = &email.from_alias {
        validate_addresses(std::slice::from_ref(alias), "from_alias")?;
    }
    Ok(())
}

/// Check if write operations are enabled
fn require_write_enabled(config: &ServerConfig) -> AppResult<()> {
    if !config.write_enabled {
        return Err(AppError::InvalidInput(
            "write tools are disabled; set ZERO_MAIL_WRITE_ENABLED=true".to_owned(),
        ));
    }
    Ok(())
}

fn require_confirm(confirm: bool, tool: &str) -> AppResult<()> {
    if !confirm {
        return Err(AppError::InvalidInput(format!(
            "{tool} requires explicit confirm=true"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use rmcp::handler::server::wrapper::Parameters;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{
        MailboxChatTools, ZeroMailServer, attach_chat_tools, validate_mailbox_id,
        validate_outgoing, validate_query, validate_thread_ids,
    };
    use crate::agent::AgentRegistry;
    use crate::chat::{ChatTools, ModelTurn};
    use crate::errors::AppError;
    use crate::models::{BulkDeleteInput, ListThreadsInput, ThreadIdsInput};
    use crate::protocol::ServerMessage;
    use crate::testing::{
        FakeChatModel, FakeProvider, agent, agent_with_model, server_config, thread,
    };
    use crate::upstream::OutgoingEmail;

    fn server(dir: &std::path::Path, write_enabled: bool) -> (ZeroMailServer, Arc<FakeProvider>) {
        let agent = Arc::new(agent(dir));
        let provider = Arc::new(FakeProvider::new());
        provider.insert(thread("t1", "2025-01-01T00:00:00.000Z", "Hello", &["INBOX", "UNREAD"]));
        provider.insert(thread("t2", "2025-01-02T00:00:00.000Z", "Again", &["INBOX"]));
        agent.attach_provider(provider.clone());
        let mut agents = BTreeMap::new();
        agents.insert("default".to_owned(), agent);
        (
            ZeroMailServer::new(
                Arc::new(server_config(write_enabled)),
                Arc::new(AgentRegistry::new(agents)),
            ),
            provider,
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    #[test]
    fn rejects_bad_mailbox_ids() {
        validate_mailbox_id("work_2").expect("valid");
        let err = validate_mailbox_id("../etc").expect_err("must fail");
        assert!(err.to_string().contains("mailbox_id"));
        assert!(validate_mailbox_id("").is_err());
    }

    #[test]
    fn rejects_control_chars_in_query() {
        let err = validate_query("hello\nworld").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn thread_id_batch_is_bounded() {
        assert!(validate_thread_ids(&[]).is_err());
        let many: Vec<String> = (0..101).map(|i| format!("t{i}")).collect();
        assert!(validate_thread_ids(&many).is_err());
        validate_thread_ids(&ids(&["t1", "t2"])).expect("valid");
    }

    #[test]
    fn outgoing_mail_needs_recipient() {
        let err = validate_outgoing(&OutgoingEmail::default()).expect_err("must fail");
        assert!(err.to_string().contains("recipient"));
        let err = validate_outgoing(&OutgoingEmail {
            to: ids(&["not-an-address"]),
            ..OutgoingEmail::default()
        })
        .expect_err("must fail");
        assert!(err.to_string().contains("invalid address"));
    }

    #[test]
    fn registers_every_agent_tool() {
        let names: Vec<String> = ZeroMailServer::tool_router()
            .list_all()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        for name in [
            "mail_list_threads",
            "mail_get_thread",
            "mail_search_threads",
            "mail_count_threads",
            "mail_sync_folder",
            "mail_sync_thread",
            "mail_set_sync_enabled",
            "mail_modify_labels",
            "mail_mark_as_read",
            "mail_mark_as_unread",
            "mail_bulk_archive",
            "mail_bulk_delete",
            "mail_list_labels",
            "mail_get_label",
            "mail_create_label",
            "mail_update_label",
            "mail_delete_label",
            "mail_create_draft",
            "mail_get_draft",
            "mail_list_drafts",
            "mail_delete_draft",
            "mail_send_draft",
            "mail_send_email",
            "mail_email_aliases",
        ] {
            assert!(names.iter().any(|n| n == name), "missing tool {name}");
        }
    }

    #[tokio::test]
    async fn list_threads_reads_through_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (server, _) = server(dir.path(), false);
        let input: ListThreadsInput =
            serde_json::from_value(serde_json::json!({ "max_results": 1 })).expect("input");
        let listing = server.list_threads_impl(input).await.expect("list");
        assert_eq!(listing.threads.len(), 1);
        assert_eq!(listing.threads[0].id, "t2");
        assert!(!listing.next_cursor.is_empty());
    }

    #[tokio::test]
    async fn unknown_mailbox_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (server, _) = server(dir.path(), false);
        let input: ListThreadsInput =
            serde_json::from_value(serde_json::json!({ "mailbox_id": "work" })).expect("input");
        let err = server.list_threads_impl(input).await.expect_err("must fail");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn write_tools_are_gated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (server, provider) = server(dir.path(), false);
        let err = server
            .mark_as_read(Parameters(ThreadIdsInput {
                mailbox_id: "default".to_owned(),
                thread_ids: ids(&["t1"]),
            }))
            .await
            .err().expect("writes disabled");
        assert!(err.message.contains("ZERO_MAIL_WRITE_ENABLED"));
        assert!(provider.labels_of("t1").contains(&"UNREAD".to_owned()));
    }

    #[tokio::test]
    async fn bulk_delete_requires_confirm() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (server, provider) = server(dir.path(), true);
        let err = server
            .bulk_delete(Parameters(BulkDeleteInput {
                mailbox_id: "default".to_owned(),
                thread_ids: ids(&["t1"]),
                confirm: false,
            }))
            .await
            .err().expect("confirm required");
        assert!(err.message.contains("confirm=true"));

        let envelope = server
            .bulk_delete(Parameters(BulkDeleteInput {
                mailbox_id: "default".to_owned(),
                thread_ids: ids(&["t1"]),
                confirm: true,
            }))
            .await
            .expect("deleted");
        assert_eq!(envelope.0.data.refreshed, ids(&["t1"]));
        assert!(provider.labels_of("t1").contains(&"TRASH".to_owned()));
    }

    /// Registry with one mailbox whose chat model is `model`
    fn chat_registry(
        dir: &std::path::Path,
        write_enabled: bool,
        model: Arc<FakeChatModel>,
    ) -> (Arc<AgentRegistry>, Arc<FakeProvider>) {
        let agent = Arc::new(agent_with_model(dir, model));
        let provider = Arc::new(FakeProvider::new());
        provider.insert(thread("t1", "2025-01-01T00:00:00.000Z", "Hello", &["INBOX", "UNREAD"]));
        agent.attach_provider(provider.clone());
        let mut agents = BTreeMap::new();
        agents.insert("default".to_owned(), agent);
        let registry = Arc::new(AgentRegistry::new(agents));
        attach_chat_tools(&Arc::new(server_config(write_enabled)), &registry);
        (registry, provider)
    }

    fn tool_results(turns: &[ModelTurn]) -> Vec<String> {
        turns
            .iter()
            .filter_map(|t| match t {
                ModelTurn::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chat_tools_leave_out_destructive_tools_and_mailbox_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (server, _) = server(dir.path(), true);
        let tools = MailboxChatTools::new(Arc::clone(&server.config), &server.agents, "default");
        let specs = tools.specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"mail_list_threads"));
        assert!(names.contains(&"mail_mark_as_read"));
        for hidden in ["mail_bulk_delete", "mail_send_email", "mail_delete_draft"] {
            assert!(!names.contains(&hidden), "{hidden} offered to chat");
        }
        for spec in &specs {
            assert!(spec.parameters.pointer("/properties/mailbox_id").is_none());
            assert!(!spec.description.is_empty());
        }
    }

    #[tokio::test]
    async fn chat_tool_calls_are_bound_to_their_mailbox() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (server, provider) = server(dir.path(), true);
        let tools = MailboxChatTools::new(Arc::clone(&server.config), &server.agents, "default");

        let result = tools
            .call(
                "mail_mark_as_read",
                &json!({ "mailbox_id": "work", "thread_ids": ["t1"] }).to_string(),
            )
            .await;
        assert!(result.get("error").is_none(), "{result}");
        assert!(!provider.labels_of("t1").contains(&"UNREAD".to_owned()));

        let unknown = tools.call("mail_bulk_delete", "{}").await;
        assert!(unknown["error"].as_str().is_some_and(|e| e.contains("unknown tool")));
        let malformed = tools.call("mail_get_thread", "{not json").await;
        assert!(malformed.get("error").is_some());
    }

    #[tokio::test]
    async fn chat_reply_runs_tool_call_then_streams_answer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = Arc::new(
            FakeChatModel::new(&["Marked as read."])
                .with_tool_call("mail_mark_as_read", json!({ "thread_ids": ["t1"] })),
        );
        let (registry, provider) = chat_registry(dir.path(), true, Arc::clone(&model));
        let chat = Arc::clone(registry.get("default").expect("agent").chat());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ticket = chat.pending().register("req-1");
        chat.run_chat_request(1, "req-1", ticket, Vec::new(), &tx)
            .await
            .expect("chat");

        assert!(!provider.labels_of("t1").contains(&"UNREAD".to_owned()));
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                ServerMessage::chunk("req-1", "Marked as read."),
                ServerMessage::done("req-1"),
            ]
        );

        let seen = model.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].1.iter().any(|name| name == "mail_mark_as_read"));
        let results = tool_results(&seen[1].0);
        assert_eq!(results.len(), 1);
        assert!(!results[0].contains("\"error\""), "{}", results[0]);
        assert!(matches!(
            &seen[1].0[0],
            ModelTurn::ToolCalls { calls, .. } if calls[0].name == "mail_mark_as_read"
        ));
    }

    #[tokio::test]
    async fn chat_tool_writes_respect_write_gate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = Arc::new(
            FakeChatModel::new(&["Writes are off."])
                .with_tool_call("mail_mark_as_read", json!({ "thread_ids": ["t1"] })),
        );
        let (registry, provider) = chat_registry(dir.path(), false, Arc::clone(&model));
        let chat = Arc::clone(registry.get("default").expect("agent").chat());
        let (tx, _rx) = mpsc::unbounded_channel();

        let ticket = chat.pending().register("req-2");
        chat.run_chat_request(1, "req-2", ticket, Vec::new(), &tx)
            .await
            .expect("chat");

        assert!(provider.labels_of("t1").contains(&"UNREAD".to_owned()));
        let results = tool_results(&model.seen()[1].0);
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("ZERO_MAIL_WRITE_ENABLED"), "{}", results[0]);
    }
}
