//! In-memory fakes for the mail provider and the chat model

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::agent::ZeroAgent;
use crate::blobs::BlobStore;
use crate::cache::ThreadCache;
use crate::chat::{
    ChatModel, ChatService, ChatStream, ChatToolSpec, ModelEvent, ModelTurn, ToolCall,
};
use crate::config::{ImapTimeouts, LlmConfig, ServerConfig, SyncPolicy};
use crate::errors::{AppError, AppResult};
use crate::retry::RetryPolicy;
use crate::sync::SyncEngine;
use crate::upstream::{
    Draft, DraftInput, DraftPage, EmailAlias, Label, LabelKind, ListThreadsRequest, MailMessage,
    MailProvider, OutgoingEmail, Sender, ThreadDetail, ThreadPage, ThreadSummary, folder_label,
};

/// Single-message thread with the given labels
pub fn thread(id: &str, received_on: &str, subject: &str, labels: &[&str]) -> ThreadDetail {
    ThreadDetail {
        id: id.to_owned(),
        messages: vec![MailMessage {
            id: id.to_owned(),
            thread_id: id.to_owned(),
            message_id: Some(format!("<{id}@example.com>")),
            subject: subject.to_owned(),
            sender: Sender {
                name: Some("Grace Hopper".to_owned()),
                email: "grace@example.com".to_owned(),
            },
            to: Vec::new(),
            cc: Vec::new(),
            received_on: received_on.to_owned(),
            label_ids: labels.iter().map(|l| (*l).to_owned()).collect(),
            unread: labels.contains(&"UNREAD"),
            body_text: Some(format!("body of {id}")),
            body_html: None,
            attachments: Vec::new(),
        }],
    }
}

/// Agent over an in-memory cache with fast sync and retry policies
pub fn agent(blob_dir: &Path) -> ZeroAgent {
    agent_with_model(blob_dir, Arc::new(FakeChatModel::new(&["Hi", " there"])))
}

pub fn agent_with_model(blob_dir: &Path, model: Arc<dyn ChatModel>) -> ZeroAgent {
    let cache = Arc::new(ThreadCache::open_in_memory().expect("cache"));
    let sync = Arc::new(SyncEngine::new(
        Arc::clone(&cache),
        BlobStore::new(blob_dir, "owner"),
        SyncPolicy {
            page_size: 2,
            page_delay: Duration::ZERO,
            ..SyncPolicy::default()
        },
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
    ));
    let chat = Arc::new(ChatService::new(
        cache,
        model,
        "You help with email.".to_owned(),
    ));
    ZeroAgent::new("default", sync, chat)
}

/// Server config with no mailboxes
pub fn server_config(write_enabled: bool) -> ServerConfig {
    ServerConfig {
        mailboxes: BTreeMap::new(),
        write_enabled,
        timeouts: ImapTimeouts::default(),
        cache_dir: PathBuf::from(".zero-mail-test"),
        http_bind: "127.0.0.1:0".to_owned(),
        sync: SyncPolicy::default(),
        retry: RetryPolicy::default(),
        llm: LlmConfig::default(),
    }
}

#[derive(Default)]
pub struct FakeProvider {
    threads: Mutex<BTreeMap<String, ThreadDetail>>,
    failing_threads: Mutex<HashSet<String>>,
    list_failures: Mutex<VecDeque<AppError>>,
    list_delay: Mutex<Duration>,
    labels: Mutex<Vec<Label>>,
    drafts: Mutex<BTreeMap<String, Draft>>,
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, thread: ThreadDetail) {
        lock(&self.threads).insert(thread.id.clone(), thread);
    }

    pub fn remove(&self, id: &str) {
        lock(&self.threads).remove(id);
    }

    /// `get_thread` for `id` fails with a fatal error
    pub fn fail_thread(&self, id: &str) {
        lock(&self.failing_threads).insert(id.to_owned());
    }

    /// The next `list_threads` call fails with `err`
    pub fn fail_next_list(&self, err: AppError) {
        lock(&self.list_failures).push_back(err);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *lock(&self.list_delay) = delay;
    }

    pub fn labels_of(&self, id: &str) -> Vec<String> {
        lock(&self.threads)
            .get(id)
            .and_then(|t| t.latest().map(|m| m.label_ids.clone()))
            .unwrap_or_default()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl MailProvider for FakeProvider {
    fn provider_id(&self) -> &str {
        "fake"
    }

    async fn list_threads(&self, request: &ListThreadsRequest) -> AppResult<ThreadPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.list_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.list_failures).pop_front() {
            return Err(err);
        }

        let label = folder_label(&request.folder);
        let query = request.query.as_deref().map(str::to_lowercase);
        let mut matching: Vec<(String, String)> = lock(&self.threads)
            .values()
            .filter_map(|t| t.latest().map(|m| (t.id.clone(), m)))
            .filter(|(_, m)| m.label_ids.contains(&label))
            .filter(|(_, m)| {
                request.label_ids.is_empty()
                    || request.label_ids.iter().any(|l| m.label_ids.contains(l))
            })
            .filter(|(_, m)| {
                query
                    .as_deref()
                    .is_none_or(|q| m.subject.to_lowercase().contains(q))
            })
            .map(|(id, m)| (m.received_on.clone(), id))
            .collect();
        matching.sort_by(|a, b| b.cmp(a));

        let offset: usize = request
            .page_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| t.parse().map_err(|_| AppError::invalid("bad page token")))
            .transpose()?
            .unwrap_or(0);
        let limit = request.max_results.max(1);
        let end = (offset + limit).min(matching.len());
        let threads = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|(_, id)| ThreadSummary { id: id.clone() })
            .collect();
        Ok(ThreadPage {
            threads,
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn get_thread(&self, thread_id: &str) -> AppResult<ThreadDetail> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_threads).contains(thread_id) {
            return Err(AppError::Internal(format!("cannot decode {thread_id}")));
        }
        lock(&self.threads)
            .get(thread_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("thread {thread_id}")))
    }

    async fn modify_labels(
        &self,
        thread_ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> AppResult<()> {
        let mut threads = lock(&self.threads);
        for id in thread_ids {
            let thread = threads
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("thread {id}")))?;
            for message in &mut thread.messages {
                message.label_ids.retain(|l| !remove_label_ids.contains(l));
                for add in add_label_ids {
                    if !message.label_ids.contains(add) {
                        message.label_ids.push(add.clone());
                    }
                }
                message.unread = message.label_ids.iter().any(|l| l == "UNREAD");
            }
        }
        Ok(())
    }

    async fn list_labels(&self) -> AppResult<Vec<Label>> {
        Ok(lock(&self.labels).clone())
    }

    async fn get_label(&self, label_id: &str) -> AppResult<Label> {
        lock(&self.labels)
            .iter()
            .find(|l| l.id == label_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("label {label_id}")))
    }

    async fn create_label(&self, name: &str) -> AppResult<Label> {
        let label = Label {
            id: name.to_owned(),
            name: name.to_owned(),
            kind: LabelKind::User,
        };
        lock(&self.labels).push(label.clone());
        Ok(label)
    }

    async fn update_label(&self, label_id: &str, name: &str) -> AppResult<Label> {
        let mut labels = lock(&self.labels);
        let label = labels
            .iter_mut()
            .find(|l| l.id == label_id)
            .ok_or_else(|| AppError::NotFound(format!("label {label_id}")))?;
        label.name = name.to_owned();
        Ok(label.clone())
    }

    async fn delete_label(&self, label_id: &str) -> AppResult<()> {
        lock(&self.labels).retain(|l| l.id != label_id);
        Ok(())
    }

    async fn create_draft(&self, draft: &DraftInput) -> AppResult<Draft> {
        let mut drafts = lock(&self.drafts);
        if let Some(old) = &draft.draft_id {
            drafts.remove(old);
        }
        let created = Draft {
            id: format!("draft-{}", uuid::Uuid::new_v4().simple()),
            to: draft.to.clone(),
            subject: draft.subject.clone(),
            body: Some(draft.body.clone()),
            updated_on: "2025-01-01T00:00:00.000Z".to_owned(),
        };
        drafts.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get_draft(&self, draft_id: &str) -> AppResult<Draft> {
        lock(&self.drafts)
            .get(draft_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("draft {draft_id}")))
    }

    async fn list_drafts(
        &self,
        _page_token: Option<&str>,
        max_results: usize,
    ) -> AppResult<DraftPage> {
        Ok(DraftPage {
            drafts: lock(&self.drafts).values().take(max_results).cloned().collect(),
            next_page_token: None,
        })
    }

    async fn delete_draft(&self, draft_id: &str) -> AppResult<()> {
        lock(&self.drafts)
            .remove(draft_id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("draft {draft_id}")))
    }

    async fn send_draft(&self, draft_id: &str) -> AppResult<()> {
        let draft = lock(&self.drafts)
            .remove(draft_id)
            .ok_or_else(|| AppError::NotFound(format!("draft {draft_id}")))?;
        lock(&self.sent).push(OutgoingEmail {
            to: draft.to,
            subject: draft.subject,
            body_text: draft.body.unwrap_or_default(),
            ..OutgoingEmail::default()
        });
        Ok(())
    }

    async fn send_email(&self, email: &OutgoingEmail) -> AppResult<()> {
        lock(&self.sent).push(email.clone());
        Ok(())
    }

    async fn aliases(&self) -> AppResult<Vec<EmailAlias>> {
        Ok(vec![EmailAlias {
            email: "me@example.com".to_owned(),
            name: None,
            primary: true,
        }])
    }
}

/// Chat model that replays fixed chunks
///
/// With `tool_call` set, the first reply is that call alone and later
/// replies are the chunks.
#[derive(Default)]
pub struct FakeChatModel {
    pub chunks: Vec<String>,
    pub chunk_delay: Duration,
    /// Fail after emitting the chunks
    pub fail_midway: bool,
    pub calls: AtomicUsize,
    pub tool_call: Mutex<Option<ToolCall>>,
    /// Turns and offered tool names of every call
    pub seen: Mutex<Vec<(Vec<ModelTurn>, Vec<String>)>>,
}

impl FakeChatModel {
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| (*c).to_owned()).collect(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(self, name: &str, arguments: serde_json::Value) -> Self {
        *self.tool_call.lock().expect("lock") = Some(ToolCall {
            id: "call-1".to_owned(),
            name: name.to_owned(),
            arguments: arguments.to_string(),
        });
        self
    }

    pub fn seen(&self) -> Vec<(Vec<ModelTurn>, Vec<String>)> {
        self.seen.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn stream(
        &self,
        _system: &str,
        turns: &[ModelTurn],
        tools: &[ChatToolSpec],
    ) -> AppResult<ChatStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().expect("lock").push((
            turns.to_vec(),
            tools.iter().map(|t| t.name.clone()).collect(),
        ));
        if let Some(call) = self.tool_call.lock().expect("lock").take() {
            return Ok(futures::stream::iter(vec![Ok(ModelEvent::ToolCall(call))]).boxed());
        }
        let delay = self.chunk_delay;
        let mut items: Vec<AppResult<ModelEvent>> = self
            .chunks
            .iter()
            .cloned()
            .map(|c| Ok(ModelEvent::Text(c)))
            .collect();
        if self.fail_midway {
            items.push(Err(AppError::Unavailable("model stream dropped".to_owned())));
        }
        Ok(futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed())
    }
}
