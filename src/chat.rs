//! Streamed AI chat with cancellation
//!
//! [`ChatService`] answers `use-chat-request` frames by streaming model
//! output as `done: false` chunks, always followed by one empty `done: true`
//! terminator. In-flight requests are tracked in [`PendingChatRequests`]
//! by the client-supplied id so a later `chat-request-cancel` can abort them.
//! History is persisted in the thread cache database and history changes are
//! fanned out to the other connections of the same agent.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ThreadCache;
use crate::config::LlmConfig;
use crate::errors::{AppError, AppResult};
use crate::mime::format_timestamp;
use crate::protocol::{ChatMessage, ChatRole, ClientMessage, ServerMessage};

/// Upper bound on model round trips spent on tool calls for one reply
const MAX_TOOL_ROUNDS: usize = 4;

/// Function call requested by the model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments as sent by the model
    pub arguments: String,
}

/// Function the model may call
#[derive(Debug, Clone, PartialEq)]
pub struct ChatToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// One conversation entry sent to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelTurn {
    Message { role: ChatRole, content: String },
    ToolCalls { content: String, calls: Vec<ToolCall> },
    ToolResult { call_id: String, content: String },
}

impl From<&ChatMessage> for ModelTurn {
    fn from(message: &ChatMessage) -> Self {
        Self::Message {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Item of a model reply stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    Text(String),
    ToolCall(ToolCall),
}

/// Stream of text deltas and tool calls produced by a chat model
pub type ChatStream = BoxStream<'static, AppResult<ModelEvent>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream(
        &self,
        system: &str,
        turns: &[ModelTurn],
        tools: &[ChatToolSpec],
    ) -> AppResult<ChatStream>;
}

/// Mailbox operations the model may invoke while answering
#[async_trait]
pub trait ChatTools: Send + Sync {
    fn specs(&self) -> Vec<ChatToolSpec>;

    /// Run one call; failures are reported inside the returned JSON
    async fn call(&self, name: &str, arguments: &str) -> Value;
}

/// OpenAI-compatible `/chat/completions` client with `stream: true`
pub struct OpenAiChatModel {
    client: reqwest::Client,
    config: LlmConfig,
}

impl OpenAiChatModel {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

fn wire_turn(turn: &ModelTurn) -> Value {
    match turn {
        ModelTurn::Message { role, content } => {
            json!({ "role": role.as_str(), "content": content })
        }
        ModelTurn::ToolCalls { content, calls } => json!({
            "role": "assistant",
            "content": (!content.is_empty()).then_some(content),
            "tool_calls": calls
                .iter()
                .map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments },
                }))
                .collect::<Vec<_>>(),
        }),
        ModelTurn::ToolResult { call_id, content } => {
            json!({ "role": "tool", "tool_call_id": call_id, "content": content })
        }
    }
}

fn request_body(model: &str, system: &str, turns: &[ModelTurn], tools: &[ChatToolSpec]) -> Value {
    let mut messages = vec![json!({ "role": "system", "content": system })];
    messages.extend(turns.iter().map(wire_turn));
    let mut body = json!({
        "model": model,
        "stream": true,
        "messages": messages,
    });
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            }))
            .collect();
    }
    body
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn stream(
        &self,
        system: &str,
        turns: &[ModelTurn],
        tools: &[ChatToolSpec],
    ) -> AppResult<ChatStream> {
        let key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::NoSession("chat model is not configured".to_owned()))?;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(key.expose_secret())
            .json(&request_body(&self.config.model, system, turns, tools))
            .send()
            .await
            .map_err(|e| AppError::Unavailable(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let msg = format!("chat model returned {status}");
            return Err(match status.as_u16() {
                429 => AppError::RateLimited(msg),
                401 | 403 => AppError::AuthFailed(msg),
                500..=599 => AppError::Unavailable(msg),
                _ => AppError::Internal(msg),
            });
        }
        Ok(sse_event_stream(response.bytes_stream()))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    ToolCall(ToolCall),
    Done,
}

/// Incremental `text/event-stream` decoder for chat completion chunks
///
/// Tool calls arrive as fragments keyed by `index`; they are assembled here
/// and emitted once the choice finishes.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    calls: BTreeMap<u64, ToolCall>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim_end().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                events.extend(self.finish());
                events.push(SseEvent::Done);
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(value) => self.decode_chunk(&value, &mut events),
                Err(e) => debug!(error = %e, "skipping malformed chat stream event"),
            }
        }
        events
    }

    fn decode_chunk(&mut self, value: &Value, events: &mut Vec<SseEvent>) {
        if let Some(text) = value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            events.push(SseEvent::Delta(text.to_owned()));
        }
        if let Some(fragments) = value
            .pointer("/choices/0/delta/tool_calls")
            .and_then(Value::as_array)
        {
            for fragment in fragments {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let call = self.calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    call.id = id.to_owned();
                }
                if let Some(name) = fragment.pointer("/function/name").and_then(Value::as_str) {
                    call.name.push_str(name);
                }
                if let Some(args) = fragment
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    call.arguments.push_str(args);
                }
            }
        }
        if value
            .pointer("/choices/0/finish_reason")
            .is_some_and(|r| !r.is_null())
        {
            events.extend(self.finish());
        }
    }

    /// Emit the tool calls assembled so far
    fn finish(&mut self) -> Vec<SseEvent> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(SseEvent::ToolCall)
            .collect()
    }
}

fn sse_event_stream<S, B, E>(bytes: S) -> ChatStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let state = (Box::pin(bytes), SseDecoder::default(), VecDeque::new(), false);
    futures::stream::unfold(
        state,
        |(mut bytes, mut decoder, mut pending, mut finished)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((Ok(event), (bytes, decoder, pending, finished)));
                }
                if finished {
                    return None;
                }
                let events = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                    Some(Err(e)) => {
                        let err = AppError::Unavailable(format!("chat stream interrupted: {e}"));
                        return Some((Err(err), (bytes, decoder, pending, true)));
                    }
                    None => {
                        finished = true;
                        decoder.finish()
                    }
                };
                for event in events {
                    match event {
                        SseEvent::Delta(text) => pending.push_back(ModelEvent::Text(text)),
                        SseEvent::ToolCall(call) => pending.push_back(ModelEvent::ToolCall(call)),
                        SseEvent::Done => finished = true,
                    }
                }
            }
        },
    )
    .boxed()
}

/// Handle for one in-flight chat request
#[derive(Debug, Clone)]
pub struct ChatTicket {
    generation: u64,
    pub token: CancellationToken,
}

/// Cancellation handles of in-flight chat requests by client id
#[derive(Debug, Default)]
pub struct PendingChatRequests {
    inner: Mutex<HashMap<String, ChatTicket>>,
    next_generation: AtomicU64,
}

impl PendingChatRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChatTicket>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Track a new request; a request already running under `id` is cancelled
    pub fn register(&self, id: &str) -> ChatTicket {
        let ticket = ChatTicket {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(previous) = self.lock().insert(id.to_owned(), ticket.clone()) {
            previous.token.cancel();
        }
        ticket
    }

    /// Abort the request; unknown or finished ids are a no-op returning `false`
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock().remove(id) {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a finished request unless a newer one reused its id
    pub fn complete(&self, id: &str, ticket: &ChatTicket) {
        let mut map = self.lock();
        if map.get(id).is_some_and(|t| t.generation == ticket.generation) {
            map.remove(id);
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }
}

/// Frame fanned out to every connection of an agent
#[derive(Debug, Clone)]
pub struct ChatEvent {
    /// Connection that caused the change; it already has the update
    pub origin: Option<u64>,
    pub message: ServerMessage,
}

/// Per-agent chat state: history, pending requests and the fan-out channel
pub struct ChatService {
    cache: Arc<ThreadCache>,
    model: Arc<dyn ChatModel>,
    system_prompt: String,
    pending: PendingChatRequests,
    events: broadcast::Sender<ChatEvent>,
    next_connection: AtomicU64,
    tools: OnceLock<Arc<dyn ChatTools>>,
}

impl ChatService {
    pub fn new(cache: Arc<ThreadCache>, model: Arc<dyn ChatModel>, system_prompt: String) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            cache,
            model,
            system_prompt,
            pending: PendingChatRequests::default(),
            events,
            next_connection: AtomicU64::new(1),
            tools: OnceLock::new(),
        }
    }

    /// Let the model act on the mailbox; only the first registration sticks
    pub fn set_tools(&self, tools: Arc<dyn ChatTools>) {
        if self.tools.set(tools).is_err() {
            warn!("chat tools already registered");
        }
    }

    pub fn connect(&self) -> (u64, broadcast::Receiver<ChatEvent>) {
        (
            self.next_connection.fetch_add(1, Ordering::Relaxed),
            self.events.subscribe(),
        )
    }

    pub fn history(&self) -> AppResult<Vec<ChatMessage>> {
        self.cache.load_chat()
    }

    pub fn pending(&self) -> &PendingChatRequests {
        &self.pending
    }

    fn publish(&self, origin: Option<u64>, message: ServerMessage) {
        // No subscribers is fine.
        let _ = self.events.send(ChatEvent { origin, message });
    }

    /// Dispatch one client frame
    ///
    /// Chat requests run on a spawned task so cancel frames on the same
    /// connection are handled while the reply streams.
    pub fn handle_client_message(
        self: &Arc<Self>,
        connection: u64,
        message: ClientMessage,
        out: mpsc::UnboundedSender<ServerMessage>,
    ) -> AppResult<()> {
        match message {
            ClientMessage::UseChatRequest { id, messages } => {
                self.cache.replace_chat(&messages)?;
                self.publish(
                    Some(connection),
                    ServerMessage::ChatMessages {
                        messages: messages.clone(),
                    },
                );
                let ticket = self.pending.register(&id);
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = service
                        .run_chat_request(connection, &id, ticket, messages, &out)
                        .await
                    {
                        warn!(request_id = %id, error = %e, "chat request failed");
                    }
                });
            }
            ClientMessage::ChatClear => {
                self.cache.clear_chat()?;
                self.publish(Some(connection), ServerMessage::ChatClear);
            }
            ClientMessage::ChatMessages { messages } => {
                self.cache.replace_chat(&messages)?;
                self.publish(Some(connection), ServerMessage::ChatMessages { messages });
            }
            ClientMessage::ChatRequestCancel { id } => {
                let cancelled = self.pending.cancel(&id);
                debug!(request_id = %id, cancelled, "chat cancel received");
            }
        }
        Ok(())
    }

    /// Stream one reply to `out`
    ///
    /// Emits `done: false` chunks and then exactly one `done: true` frame,
    /// also when cancelled or when the model fails (preceded by an
    /// `error: true` frame). Tool calls requested by the model are run and
    /// their results fed back before streaming continues. Text produced
    /// before a cancel is kept in history.
    pub async fn run_chat_request(
        &self,
        connection: u64,
        id: &str,
        ticket: ChatTicket,
        messages: Vec<ChatMessage>,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) -> AppResult<()> {
        let mut reply = String::new();

        let result: AppResult<()> = async {
            let tools = self.tools.get().cloned();
            let specs = tools.as_ref().map(|t| t.specs()).unwrap_or_default();
            let mut turns: Vec<ModelTurn> = messages.iter().map(ModelTurn::from).collect();

            for round in 0..=MAX_TOOL_ROUNDS {
                // The last round withholds tools so the model has to answer.
                let offered: &[ChatToolSpec] = if round < MAX_TOOL_ROUNDS {
                    &specs[..]
                } else {
                    &[]
                };
                let mut stream = tokio::select! {
                    biased;
                    _ = ticket.token.cancelled() => return Ok(()),
                    stream = self.model.stream(&self.system_prompt, &turns, offered) => stream?,
                };

                let mut text = String::new();
                let mut calls = Vec::new();
                loop {
                    tokio::select! {
                        biased;
                        _ = ticket.token.cancelled() => {
                            info!(request_id = %id, "chat request cancelled");
                            return Ok(());
                        }
                        next = stream.next() => match next {
                            Some(Ok(ModelEvent::Text(chunk))) => {
                                text.push_str(&chunk);
                                reply.push_str(&chunk);
                                if out.send(ServerMessage::chunk(id, chunk)).is_err() {
                                    debug!(request_id = %id, "chat client went away");
                                    return Ok(());
                                }
                            }
                            Some(Ok(ModelEvent::ToolCall(call))) => calls.push(call),
                            Some(Err(e)) => return Err(e),
                            None => break,
                        },
                    }
                }

                let Some(tools) = tools.as_ref().filter(|_| !calls.is_empty()) else {
                    return Ok(());
                };
                turns.push(ModelTurn::ToolCalls {
                    content: text,
                    calls: calls.clone(),
                });
                for call in calls {
                    info!(request_id = %id, tool = %call.name, "chat tool call");
                    let output = tokio::select! {
                        biased;
                        _ = ticket.token.cancelled() => return Ok(()),
                        output = tools.call(&call.name, &call.arguments) => output,
                    };
                    turns.push(ModelTurn::ToolResult {
                        call_id: call.id,
                        content: output.to_string(),
                    });
                }
            }
            warn!(request_id = %id, "chat tool rounds exhausted");
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            let _ = out.send(ServerMessage::failed(id, e.to_string()));
        }
        let _ = out.send(ServerMessage::done(id));
        self.pending.complete(id, &ticket);

        if !reply.is_empty() {
            self.cache.append_chat(&ChatMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: ChatRole::Assistant,
                content: reply,
                created_at: Some(format_timestamp(&Utc::now())),
            })?;
            self.publish(
                Some(connection),
                ServerMessage::ChatMessages {
                    messages: self.cache.load_chat()?,
                },
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::sync::mpsc;

    use super::{
        ChatService, ModelEvent, PendingChatRequests, SseDecoder, SseEvent, ToolCall,
        sse_event_stream,
    };
    use crate::cache::ThreadCache;
    use crate::protocol::{ChatMessage, ChatRole, ClientMessage, ServerMessage};
    use crate::testing::FakeChatModel;

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            id: "u1".to_owned(),
            role: ChatRole::User,
            content: content.to_owned(),
            created_at: None,
        }
    }

    fn service(model: FakeChatModel) -> Arc<ChatService> {
        Arc::new(ChatService::new(
            Arc::new(ThreadCache::open_in_memory().expect("cache")),
            Arc::new(model),
            "You help with email.".to_owned(),
        ))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn terminators(frames: &[ServerMessage]) -> usize {
        frames
            .iter()
            .filter(|f| matches!(f, ServerMessage::UseChatResponse { done: true, .. }))
            .count()
    }

    #[test]
    fn sse_decoder_handles_split_lines_and_done() {
        let mut decoder = SseDecoder::default();
        assert!(
            decoder
                .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel")
                .is_empty()
        );
        let events = decoder.push(b"lo\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Delta("Hello".to_owned()), SseEvent::Done]
        );
    }

    #[tokio::test]
    async fn sse_stream_stops_at_done() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\ndata: [DONE]\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n".to_vec()),
        ];
        let events: Vec<ModelEvent> = sse_event_stream(futures::stream::iter(chunks))
            .map(|r| r.expect("chunk"))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                ModelEvent::Text("a".to_owned()),
                ModelEvent::Text("b".to_owned())
            ]
        );
    }

    #[test]
    fn sse_decoder_assembles_tool_call_fragments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            concat!(
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_7\",",
                "\"type\":\"function\",\"function\":{\"name\":\"mail_get_thread\",\"arguments\":\"\"}}]}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,",
                "\"function\":{\"arguments\":\"{\\\"thread_id\\\":\"}}]}}]}\n",
            )
            .as_bytes(),
        );
        assert!(events.is_empty(), "calls wait for the choice to finish");

        let events = decoder.push(
            concat!(
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,",
                "\"function\":{\"arguments\":\"\\\"t1\\\"}\"}}]}}]}\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n",
                "data: [DONE]\n",
            )
            .as_bytes(),
        );
        assert_eq!(
            events,
            vec![
                SseEvent::ToolCall(ToolCall {
                    id: "call_7".to_owned(),
                    name: "mail_get_thread".to_owned(),
                    arguments: "{\"thread_id\":\"t1\"}".to_owned(),
                }),
                SseEvent::Done,
            ]
        );
    }

    #[test]
    fn cancel_is_idempotent() {
        let pending = PendingChatRequests::default();
        assert!(!pending.cancel("unknown"));

        let ticket = pending.register("req-1");
        assert!(pending.cancel("req-1"));
        assert!(ticket.token.is_cancelled());
        assert!(!pending.cancel("req-1"));

        pending.complete("req-1", &ticket);
        assert!(!pending.cancel("req-1"));
    }

    #[test]
    fn reregistering_id_cancels_previous_request() {
        let pending = PendingChatRequests::default();
        let first = pending.register("req-1");
        let second = pending.register("req-1");
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());

        pending.complete("req-1", &first);
        assert!(pending.is_pending("req-1"), "stale completion keeps newer entry");
        pending.complete("req-1", &second);
        assert!(!pending.is_pending("req-1"));
    }

    #[tokio::test]
    async fn streams_chunks_then_single_terminator() {
        let chat = service(FakeChatModel::new(&["Hello", ", ", "world"]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ticket = chat.pending().register("req-1");
        chat.run_chat_request(1, "req-1", ticket, vec![user("hi")], &tx)
            .await
            .expect("chat");

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], ServerMessage::chunk("req-1", "Hello"));
        assert_eq!(frames[3], ServerMessage::done("req-1"));
        assert!(!chat.pending().is_pending("req-1"));

        let history = chat.history().expect("history");
        assert_eq!(history.last().map(|m| m.content.as_str()), Some("Hello, world"));
        assert_eq!(history.last().map(|m| m.role), Some(ChatRole::Assistant));
    }

    #[tokio::test]
    async fn cancel_mid_stream_still_terminates_once() {
        let mut model = FakeChatModel::new(&["one", "two", "three", "four", "five"]);
        model.chunk_delay = Duration::from_millis(40);
        let chat = service(model);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (conn, _events) = chat.connect();
        chat.handle_client_message(
            conn,
            ClientMessage::UseChatRequest {
                id: "req-1".to_owned(),
                messages: vec![user("hi")],
            },
            tx.clone(),
        )
        .expect("dispatch");

        let first = rx.recv().await.expect("first chunk");
        assert_eq!(first, ServerMessage::chunk("req-1", "one"));
        chat.handle_client_message(
            conn,
            ClientMessage::ChatRequestCancel {
                id: "req-1".to_owned(),
            },
            tx.clone(),
        )
        .expect("cancel");
        chat.handle_client_message(
            conn,
            ClientMessage::ChatRequestCancel {
                id: "req-1".to_owned(),
            },
            tx.clone(),
        )
        .expect("second cancel is a no-op");

        let mut frames = vec![first];
        while let Some(frame) = rx.recv().await {
            let done = matches!(frame, ServerMessage::UseChatResponse { done: true, .. });
            frames.push(frame);
            if done {
                break;
            }
        }
        assert_eq!(terminators(&frames), 1);
        assert!(frames.len() < 6, "stream stopped early");
        assert_eq!(frames.last(), Some(&ServerMessage::done("req-1")));
    }

    #[tokio::test]
    async fn cancel_right_after_request_stops_before_first_chunk() {
        let model = Arc::new(FakeChatModel::new(&["never", "sent"]));
        let chat = Arc::new(ChatService::new(
            Arc::new(ThreadCache::open_in_memory().expect("cache")),
            model.clone(),
            "You help with email.".to_owned(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (conn, _events) = chat.connect();

        chat.handle_client_message(
            conn,
            ClientMessage::UseChatRequest {
                id: "req-1".to_owned(),
                messages: vec![user("hi")],
            },
            tx.clone(),
        )
        .expect("dispatch");
        assert!(chat.pending().is_pending("req-1"));
        chat.handle_client_message(
            conn,
            ClientMessage::ChatRequestCancel {
                id: "req-1".to_owned(),
            },
            tx.clone(),
        )
        .expect("cancel");

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("terminator in time")
            .expect("frame");
        assert_eq!(frame, ServerMessage::done("req-1"));
        tokio::task::yield_now().await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chat.history().expect("history").len(), 1);
    }

    #[tokio::test]
    async fn model_failure_is_flagged_before_terminator() {
        let mut model = FakeChatModel::new(&["partial"]);
        model.fail_midway = true;
        let chat = service(model);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ticket = chat.pending().register("req-9");
        let result = chat
            .run_chat_request(1, "req-9", ticket, vec![user("hi")], &tx)
            .await;
        assert!(result.is_err());

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            &frames[1],
            ServerMessage::UseChatResponse { error: true, done: false, .. }
        ));
        assert_eq!(frames[2], ServerMessage::done("req-9"));
        assert_eq!(terminators(&frames), 1);
    }

    #[tokio::test]
    async fn history_changes_reach_other_connections_only() {
        let chat = service(FakeChatModel::new(&[]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (a, mut a_events) = chat.connect();
        let (_b, mut b_events) = chat.connect();

        chat.handle_client_message(a, ClientMessage::ChatClear, tx)
            .expect("clear");

        let seen_by_b = b_events.recv().await.expect("event");
        assert_eq!(seen_by_b.message, ServerMessage::ChatClear);
        let seen_by_a = a_events.recv().await.expect("event");
        assert_eq!(seen_by_a.origin, Some(a), "origin lets the sender skip its own echo");
    }
}
