//! Per-mailbox agent and the registry that owns them
//!
//! A [`ZeroAgent`] pairs the thread cache with an optional upstream session.
//! Reads are served from the cache and fall back to upstream; mutations go
//! upstream first and then refresh the affected cache rows. Every operation
//! that touches upstream fails with `NoSession` while no provider is
//! attached.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::cache::{CacheFilter, ThreadCache};
use crate::chat::{ChatModel, ChatService, OpenAiChatModel};
use crate::config::{MailboxConfig, ServerConfig};
use crate::errors::{AppError, AppResult};
use crate::imap_provider::ImapProvider;
use crate::models::{
    MutationResult, SearchResult, SyncStatus, ThreadListItem, ThreadListing,
};
use crate::reader::CacheReader;
use crate::retry::retry;
use crate::sync::{SyncEngine, SyncOutcome};
use crate::upstream::{
    Draft, DraftInput, DraftPage, EmailAlias, LABEL_INBOX, LABEL_TRASH, LABEL_UNREAD, Label,
    ListThreadsRequest, MailProvider, OutgoingEmail, ThreadDetail, folder_label,
};

/// Listing parameters for [`ZeroAgent::list_threads`]
#[derive(Debug, Clone, Default)]
pub struct ThreadQuery {
    pub folder: String,
    pub query: Option<String>,
    pub label_ids: Vec<String>,
    pub max_results: usize,
    pub cursor: Option<String>,
}

pub struct ZeroAgent {
    mailbox_id: String,
    provider: RwLock<Option<Arc<dyn MailProvider>>>,
    sync: Arc<SyncEngine>,
    reader: CacheReader,
    chat: Arc<ChatService>,
}

impl ZeroAgent {
    pub fn new(mailbox_id: impl Into<String>, sync: Arc<SyncEngine>, chat: Arc<ChatService>) -> Self {
        Self {
            mailbox_id: mailbox_id.into(),
            provider: RwLock::new(None),
            reader: CacheReader::new(Arc::clone(&sync)),
            sync,
            chat,
        }
    }

    pub fn mailbox_id(&self) -> &str {
        &self.mailbox_id
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.chat
    }

    pub fn attach_provider(&self, provider: Arc<dyn MailProvider>) {
        info!(mailbox_id = %self.mailbox_id, provider = provider.provider_id(), "upstream session attached");
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = Some(provider);
    }

    pub fn detach_provider(&self) {
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!(mailbox_id = %self.mailbox_id, "upstream session detached");
    }

    pub fn has_session(&self) -> bool {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn session(&self) -> AppResult<Arc<dyn MailProvider>> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                AppError::NoSession(format!(
                    "mailbox '{}' has no upstream session",
                    self.mailbox_id
                ))
            })
    }

    fn items(&self, ids: &[String]) -> AppResult<Vec<ThreadListItem>> {
        let cache = self.sync.cache();
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = cache.get(id)? {
                items.push(ThreadListItem::from(&row));
            }
        }
        Ok(items)
    }

    /// List cached threads of a folder, newest first
    ///
    /// The first page of a folder with no cached rows runs a folder sync
    /// before reading.
    pub async fn list_threads(&self, query: &ThreadQuery) -> AppResult<ThreadListing> {
        let provider = self.session()?;
        let label = folder_label(&query.folder);
        let cursor = query.cursor.clone().filter(|c| !c.is_empty());

        if cursor.is_none() && self.sync.cache().count(&label)? == 0 {
            let outcome = self
                .sync
                .sync_folder(provider.as_ref(), &query.folder)
                .await?;
            debug!(mailbox_id = %self.mailbox_id, folder = %label, ?outcome, "synced empty folder");
        }

        let page = self.reader.list_threads(&CacheFilter {
            folder_label: Some(label),
            label_ids: query.label_ids.clone(),
            query: query.query.clone(),
            cursor,
            limit: query.max_results,
        })?;
        Ok(ThreadListing {
            threads: self.items(&page.thread_ids)?,
            next_cursor: page.next_cursor,
        })
    }

    pub async fn get_thread(&self, thread_id: &str) -> AppResult<ThreadDetail> {
        let provider = self.session()?;
        self.reader
            .get_thread(Some(provider.as_ref()), thread_id)
            .await
    }

    /// Search the local cache and upstream concurrently
    ///
    /// A failing branch is reported in the result and the other branch's
    /// threads are returned. Only when both fail is the upstream error
    /// returned.
    pub async fn search_threads(
        &self,
        query: &str,
        folder: &str,
        max_results: usize,
    ) -> AppResult<SearchResult> {
        let provider = self.session()?;
        let local = async {
            self.reader.list_threads(&CacheFilter {
                folder_label: Some(folder_label(folder)),
                query: Some(query.to_owned()),
                limit: max_results,
                ..CacheFilter::default()
            })
        };
        let request = ListThreadsRequest {
            folder: folder.to_owned(),
            query: Some(query.to_owned()),
            max_results,
            ..ListThreadsRequest::default()
        };
        let upstream = retry(self.sync.retry_policy(), "search threads", || {
            provider.list_threads(&request)
        });
        let (local, upstream) = tokio::join!(local, upstream);

        let (ids, local_error, upstream_error) = match (local, upstream) {
            (Err(local), Err(upstream)) => {
                warn!(mailbox_id = %self.mailbox_id, local = %local, upstream = %upstream, "both search branches failed");
                return Err(upstream);
            }
            (Ok(local), Ok(upstream)) => {
                let mut ids = local.thread_ids;
                ids.extend(upstream.threads.into_iter().map(|t| t.id));
                (ids, None, None)
            }
            (Ok(local), Err(e)) => {
                warn!(mailbox_id = %self.mailbox_id, error = %e, "upstream search failed, using cache only");
                (local.thread_ids, None, Some(e.to_string()))
            }
            (Err(e), Ok(upstream)) => {
                warn!(mailbox_id = %self.mailbox_id, error = %e, "cache search failed, using upstream only");
                let ids = upstream.threads.into_iter().map(|t| t.id).collect();
                (ids, Some(e.to_string()), None)
            }
        };

        let mut threads: Vec<ThreadListItem> = Vec::with_capacity(ids.len());
        for id in ids {
            if threads.iter().any(|t| t.id == id) {
                continue;
            }
            if let Some(row) = self.sync.cache().get(&id)? {
                threads.push(ThreadListItem::from(&row));
                continue;
            }
            match self.sync.sync_thread(provider.as_ref(), &id).await {
                Ok(Some(row)) => threads.push(ThreadListItem::from(&row)),
                Ok(None) => {}
                Err(e) => {
                    warn!(mailbox_id = %self.mailbox_id, thread_id = %id, error = %e, "search hit could not be fetched");
                }
            }
        }
        threads.sort_by(|a, b| b.received_on.cmp(&a.received_on));
        threads.truncate(max_results);

        Ok(SearchResult {
            threads,
            local_error,
            upstream_error,
        })
    }

    pub fn count_threads(&self, folder: &str) -> AppResult<usize> {
        self.session()?;
        self.sync.cache().count(&folder_label(folder))
    }

    pub async fn sync_folder(&self, folder: &str) -> AppResult<SyncOutcome> {
        let provider = self.session()?;
        self.sync.sync_folder(provider.as_ref(), folder).await
    }

    /// Re-fetch one thread; evicts it when it no longer exists upstream
    pub async fn sync_thread(&self, thread_id: &str) -> AppResult<MutationResult> {
        let provider = self.session()?;
        self.refresh(provider.as_ref(), &[thread_id.to_owned()])
            .await
    }

    pub fn set_sync_enabled(&self, enabled: bool) -> SyncStatus {
        self.sync.set_enabled(enabled);
        self.sync_status()
    }

    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            enabled: self.sync.is_enabled(),
            active: self.sync.active_syncs(),
        }
    }

    async fn refresh(
        &self,
        provider: &dyn MailProvider,
        thread_ids: &[String],
    ) -> AppResult<MutationResult> {
        let mut result = MutationResult::default();
        for id in thread_ids {
            match self.sync.sync_thread(provider, id).await {
                Ok(Some(_)) => result.refreshed.push(id.clone()),
                Ok(None) => debug!(thread_id = %id, "thread sync in flight, refresh skipped"),
                Err(AppError::NotFound(_)) => {
                    self.sync.evict(id).await?;
                    result.evicted.push(id.clone());
                }
                Err(e) => {
                    warn!(mailbox_id = %self.mailbox_id, thread_id = %id, error = %e, "cache refresh failed");
                }
            }
        }
        Ok(result)
    }

    /// Add and remove labels on threads, then refresh their cache rows
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if no threads or no label changes are given
    pub async fn modify_labels(
        &self,
        thread_ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> AppResult<MutationResult> {
        if thread_ids.is_empty() {
            return Err(AppError::invalid("thread_ids must not be empty"));
        }
        if add_label_ids.is_empty() && remove_label_ids.is_empty() {
            return Err(AppError::invalid(
                "at least one of add_label_ids or remove_label_ids is required",
            ));
        }
        let provider = self.session()?;
        retry(self.sync.retry_policy(), "modify labels", || {
            provider.modify_labels(thread_ids, add_label_ids, remove_label_ids)
        })
        .await?;
        self.refresh(provider.as_ref(), thread_ids).await
    }

    pub async fn mark_as_read(&self, thread_ids: &[String]) -> AppResult<MutationResult> {
        self.modify_labels(thread_ids, &[], &[LABEL_UNREAD.to_owned()])
            .await
    }

    pub async fn mark_as_unread(&self, thread_ids: &[String]) -> AppResult<MutationResult> {
        self.modify_labels(thread_ids, &[LABEL_UNREAD.to_owned()], &[])
            .await
    }

    pub async fn bulk_archive(&self, thread_ids: &[String]) -> AppResult<MutationResult> {
        self.modify_labels(thread_ids, &[], &[LABEL_INBOX.to_owned()])
            .await
    }

    /// Move threads to the bin
    pub async fn bulk_delete(&self, thread_ids: &[String]) -> AppResult<MutationResult> {
        self.modify_labels(
            thread_ids,
            &[LABEL_TRASH.to_owned()],
            &[LABEL_INBOX.to_owned()],
        )
        .await
    }

    pub async fn list_labels(&self) -> AppResult<Vec<Label>> {
        let provider = self.session()?;
        retry(self.sync.retry_policy(), "list labels", || {
            provider.list_labels()
        })
        .await
    }

    pub async fn get_label(&self, label_id: &str) -> AppResult<Label> {
        let provider = self.session()?;
        retry(self.sync.retry_policy(), "get label", || {
            provider.get_label(label_id)
        })
        .await
    }

    pub async fn create_label(&self, name: &str) -> AppResult<Label> {
        self.session()?.create_label(name).await
    }

    pub async fn update_label(&self, label_id: &str, name: &str) -> AppResult<Label> {
        self.session()?.update_label(label_id, name).await
    }

    pub async fn delete_label(&self, label_id: &str) -> AppResult<()> {
        self.session()?.delete_label(label_id).await
    }

    pub async fn create_draft(&self, draft: &DraftInput) -> AppResult<Draft> {
        self.session()?.create_draft(draft).await
    }

    pub async fn get_draft(&self, draft_id: &str) -> AppResult<Draft> {
        let provider = self.session()?;
        retry(self.sync.retry_policy(), "get draft", || {
            provider.get_draft(draft_id)
        })
        .await
    }

    pub async fn list_drafts(
        &self,
        page_token: Option<&str>,
        max_results: usize,
    ) -> AppResult<DraftPage> {
        let provider = self.session()?;
        retry(self.sync.retry_policy(), "list drafts", || {
            provider.list_drafts(page_token, max_results)
        })
        .await
    }

    pub async fn delete_draft(&self, draft_id: &str) -> AppResult<()> {
        self.session()?.delete_draft(draft_id).await
    }

    pub async fn send_draft(&self, draft_id: &str) -> AppResult<()> {
        self.session()?.send_draft(draft_id).await?;
        info!(mailbox_id = %self.mailbox_id, draft_id, "draft sent");
        Ok(())
    }

    pub async fn send_email(&self, email: &OutgoingEmail) -> AppResult<()> {
        if email.to.is_empty() {
            return Err(AppError::invalid("at least one recipient is required"));
        }
        self.session()?.send_email(email).await?;
        info!(mailbox_id = %self.mailbox_id, recipients = email.to.len(), "email sent");
        Ok(())
    }

    pub async fn email_aliases(&self) -> AppResult<Vec<EmailAlias>> {
        let provider = self.session()?;
        retry(self.sync.retry_policy(), "email aliases", || {
            provider.aliases()
        })
        .await
    }
}

fn default_system_prompt(mailbox: &MailboxConfig) -> String {
    format!(
        "You are an email assistant for the mailbox {}. Answer concisely and \
         never invent messages that are not in the conversation.",
        mailbox.user
    )
}

/// All agents of the process, keyed by mailbox id
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<ZeroAgent>>,
    shutdown: CancellationToken,
}

impl AgentRegistry {
    pub fn new(agents: BTreeMap<String, Arc<ZeroAgent>>) -> Self {
        Self {
            agents,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build one agent per configured mailbox
    ///
    /// Each agent gets its own cache database and blob directory under
    /// `cache_dir/<mailbox_id>`. Mailboxes without a password start without
    /// an upstream session.
    pub fn from_config(config: &ServerConfig) -> AppResult<Self> {
        let model: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(config.llm.clone()));
        let mut agents = BTreeMap::new();

        for (mailbox_id, mailbox) in &config.mailboxes {
            let root = config.cache_dir.join(mailbox_id);
            let cache = Arc::new(ThreadCache::open(&root.join("cache.sqlite3"))?);
            let blobs = BlobStore::new(root.join("blobs"), &mailbox.user);
            let sync = Arc::new(SyncEngine::new(
                Arc::clone(&cache),
                blobs,
                config.sync.clone(),
                config.retry.clone(),
            ));
            let prompt = config
                .llm
                .system_prompt
                .clone()
                .unwrap_or_else(|| default_system_prompt(mailbox));
            let chat = Arc::new(ChatService::new(cache, Arc::clone(&model), prompt));

            let agent = ZeroAgent::new(mailbox_id.clone(), sync, chat);
            if mailbox.pass.is_some() {
                agent.attach_provider(Arc::new(ImapProvider::new(
                    mailbox.clone(),
                    config.timeouts.clone(),
                )));
            } else {
                warn!(mailbox_id = %mailbox_id, "no password configured, agent starts without upstream session");
            }
            agents.insert(mailbox_id.clone(), Arc::new(agent));
        }
        Ok(Self::new(agents))
    }

    /// Look up an agent
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the mailbox is not configured.
    pub fn get(&self, mailbox_id: &str) -> AppResult<Arc<ZeroAgent>> {
        self.agents
            .get(mailbox_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("mailbox '{mailbox_id}' is not configured")))
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<ZeroAgent>> {
        self.agents.values()
    }

    /// Start one background sync loop per agent
    ///
    /// Returns no handles when `interval` is zero.
    pub fn spawn_sync_loops(&self, folders: &[String], interval: Duration) -> Vec<JoinHandle<()>> {
        if interval.is_zero() {
            info!("background sync disabled");
            return Vec::new();
        }
        self.agents
            .values()
            .map(|agent| {
                tokio::spawn(run_sync_loop(
                    Arc::clone(agent),
                    folders.to_vec(),
                    interval,
                    self.shutdown.clone(),
                ))
            })
            .collect()
    }

    /// Stop all background sync loops
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_sync_loop(
    agent: Arc<ZeroAgent>,
    folders: Vec<String>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(mailbox_id = %agent.mailbox_id(), ?interval, "background sync loop started");

    'ticks: loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for folder in &folders {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break 'ticks,
                result = agent.sync_folder(folder) => result,
            };
            match result {
                Ok(outcome) => {
                    debug!(mailbox_id = %agent.mailbox_id(), folder = %folder, ?outcome, "background sync pass");
                }
                Err(AppError::NoSession(_)) => {
                    debug!(mailbox_id = %agent.mailbox_id(), "no upstream session, skipping sync pass");
                    break;
                }
                Err(e) => {
                    warn!(mailbox_id = %agent.mailbox_id(), folder = %folder, error = %e, "background sync failed");
                }
            }
        }
    }
    info!(mailbox_id = %agent.mailbox_id(), "background sync loop stopped");
}
