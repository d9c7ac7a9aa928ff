//! Local thread metadata cache and chat history (SQLite)
//!
//! One database per agent instance. Thread rows are written with a single
//! upsert statement so a row is never partially written. Listing uses keyset
//! pagination on `latest_received_on` (strictly less than the cursor, newest
//! first). All filter values are bound parameters.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::errors::{AppError, AppResult};
use crate::protocol::{ChatMessage, ChatRole};
use crate::upstream::Sender;

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    provider_thread_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    latest_sender TEXT NOT NULL,
    latest_received_on TEXT NOT NULL,
    latest_subject TEXT NOT NULL,
    latest_label_ids TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_threads_received
    ON threads(latest_received_on DESC);

CREATE TABLE IF NOT EXISTS chat_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT
);
";

/// Cached metadata of one thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCacheRow {
    pub id: String,
    pub provider_thread_id: String,
    pub provider_id: String,
    pub latest_sender: Sender,
    /// ISO-8601 UTC timestamp of the newest message
    pub latest_received_on: String,
    pub latest_subject: String,
    /// Ordered label ids of the newest message
    pub latest_label_ids: Vec<String>,
    pub updated_at: String,
}

/// Listing filter over cached threads
#[derive(Debug, Clone, Default)]
pub struct CacheFilter {
    /// Folder label id the thread must carry (e.g. `INBOX`)
    pub folder_label: Option<String>,
    /// Any of these label ids must be present (OR semantics)
    pub label_ids: Vec<String>,
    /// Case-insensitive substring of subject or sender
    pub query: Option<String>,
    /// Exclusive upper bound on `latest_received_on`
    pub cursor: Option<String>,
    pub limit: usize,
}

/// One page of cached thread ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePage {
    pub thread_ids: Vec<String>,
    /// Last row's `latest_received_on`; empty when the page is short
    pub next_cursor: String,
}

/// SQLite-backed cache handle
#[derive(Debug)]
pub struct ThreadCache {
    conn: Mutex<Connection>,
}

impl ThreadCache {
    /// Open (or create) the cache database at `path`
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| AppError::Internal(format!("failed to create cache dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    /// In-memory cache, used by tests and ephemeral agents
    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("cache connection lock poisoned".to_owned()))
    }

    /// Insert or replace a thread row in one statement
    pub fn upsert(&self, row: &ThreadCacheRow) -> AppResult<()> {
        let sender = serde_json::to_string(&row.latest_sender)?;
        let labels = serde_json::to_string(&row.latest_label_ids)?;
        self.lock()?.execute(
            "INSERT INTO threads (
                id, provider_thread_id, provider_id, latest_sender,
                latest_received_on, latest_subject, latest_label_ids, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                provider_thread_id = excluded.provider_thread_id,
                provider_id = excluded.provider_id,
                latest_sender = excluded.latest_sender,
                latest_received_on = excluded.latest_received_on,
                latest_subject = excluded.latest_subject,
                latest_label_ids = excluded.latest_label_ids,
                updated_at = excluded.updated_at",
            params![
                row.id,
                row.provider_thread_id,
                row.provider_id,
                sender,
                row.latest_received_on,
                row.latest_subject,
                labels,
                row.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> AppResult<Option<ThreadCacheRow>> {
        let raw = self
            .lock()?
            .query_row(
                "SELECT id, provider_thread_id, provider_id, latest_sender,
                        latest_received_on, latest_subject, latest_label_ids, updated_at
                 FROM threads WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        raw.map(
            |(id, provider_thread_id, provider_id, sender, received, subject, labels, updated)|
             -> AppResult<ThreadCacheRow> {
                Ok(ThreadCacheRow {
                    id,
                    provider_thread_id,
                    provider_id,
                    latest_sender: serde_json::from_str(&sender)?,
                    latest_received_on: received,
                    latest_subject: subject,
                    latest_label_ids: serde_json::from_str(&labels)?,
                    updated_at: updated,
                })
            },
        )
        .transpose()
    }

    /// Remove a row; returns whether it existed
    pub fn delete(&self, id: &str) -> AppResult<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM threads WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Number of cached threads carrying `folder_label`
    pub fn count(&self, folder_label: &str) -> AppResult<usize> {
        let n: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM threads
             WHERE EXISTS (SELECT 1 FROM json_each(threads.latest_label_ids) WHERE json_each.value = ?1)",
            params![folder_label],
            |r| r.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Keyset-paginated listing, newest first
    pub fn list(&self, filter: &CacheFilter) -> AppResult<CachePage> {
        let limit = filter.limit.max(1);
        let mut sql = String::from("SELECT id, latest_received_on FROM threads WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(folder) = &filter.folder_label {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(threads.latest_label_ids) WHERE json_each.value = ?)",
            );
            values.push(Value::Text(folder.clone()));
        }
        if !filter.label_ids.is_empty() {
            let placeholders = vec!["?"; filter.label_ids.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each(threads.latest_label_ids) WHERE json_each.value IN ({placeholders}))"
            ));
            values.extend(filter.label_ids.iter().cloned().map(Value::Text));
        }
        if let Some(q) = filter.query.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            sql.push_str(
                " AND (latest_subject LIKE ? ESCAPE '\\' \
                 OR json_extract(latest_sender, '$.name') LIKE ? ESCAPE '\\' \
                 OR json_extract(latest_sender, '$.email') LIKE ? ESCAPE '\\')",
            );
            let pattern = Value::Text(format!("%{}%", escape_like(q)));
            values.extend([pattern.clone(), pattern.clone(), pattern]);
        }
        if let Some(cursor) = filter.cursor.as_deref().filter(|c| !c.is_empty()) {
            sql.push_str(" AND latest_received_on < ?");
            values.push(Value::Text(cursor.to_owned()));
        }
        sql.push_str(" ORDER BY latest_received_on DESC, id DESC LIMIT ?");
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if rows.len() < limit {
            String::new()
        } else {
            rows.last().map(|(_, at)| at.clone()).unwrap_or_default()
        };
        Ok(CachePage {
            thread_ids: rows.into_iter().map(|(id, _)| id).collect(),
            next_cursor,
        })
    }

    pub fn load_chat(&self) -> AppResult<Vec<ChatMessage>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, role, content, created_at FROM chat_messages ORDER BY seq")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, role, content, created_at)| ChatMessage {
                id,
                role: ChatRole::parse(&role),
                content,
                created_at,
            })
            .collect())
    }

    /// Replace the whole chat history atomically
    pub fn replace_chat(&self, messages: &[ChatMessage]) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chat_messages", [])?;
        for m in messages {
            tx.execute(
                "INSERT INTO chat_messages (id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![m.id, m.role.as_str(), m.content, m.created_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn append_chat(&self, message: &ChatMessage) -> AppResult<()> {
        self.lock()?.execute(
            "INSERT INTO chat_messages (id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                message.id,
                message.role.as_str(),
                message.content,
                message.created_at
            ],
        )?;
        Ok(())
    }

    pub fn clear_chat(&self) -> AppResult<()> {
        self.lock()?.execute("DELETE FROM chat_messages", [])?;
        Ok(())
    }
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
