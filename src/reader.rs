//! Cache-first thread reads
//!
//! A thread is served from the cache row and its blob. On a miss the reader
//! syncs that one thread from upstream and reads again, once; a second miss
//! is `NotFound`.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{CacheFilter, CachePage};
use crate::errors::{AppError, AppResult};
use crate::sync::SyncEngine;
use crate::upstream::{MailProvider, ThreadDetail};

pub struct CacheReader {
    sync: Arc<SyncEngine>,
}

impl CacheReader {
    pub fn new(sync: Arc<SyncEngine>) -> Self {
        Self { sync }
    }

    async fn read_cached(&self, thread_id: &str) -> AppResult<Option<ThreadDetail>> {
        if self.sync.cache().get(thread_id)?.is_none() {
            return Ok(None);
        }
        self.sync.blobs().get(thread_id).await
    }

    /// Read a thread, syncing it from upstream at most once on a miss
    ///
    /// # Errors
    ///
    /// - `NoSession` on a miss when no provider is attached
    /// - `NotFound` if the thread is still missing after the sync
    pub async fn get_thread(
        &self,
        provider: Option<&dyn MailProvider>,
        thread_id: &str,
    ) -> AppResult<ThreadDetail> {
        if let Some(thread) = self.read_cached(thread_id).await? {
            return Ok(thread);
        }

        debug!(thread_id, "cache miss, syncing thread");
        let provider = provider.ok_or_else(|| {
            AppError::NoSession("no upstream session to fetch uncached thread".to_owned())
        })?;
        match self.sync.sync_thread(provider, thread_id).await {
            Ok(_) => {}
            Err(AppError::NotFound(_)) => {
                self.sync.evict(thread_id).await?;
            }
            Err(e) => return Err(e),
        }

        self.read_cached(thread_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("thread {thread_id} not found")))
    }

    pub fn list_threads(&self, filter: &CacheFilter) -> AppResult<CachePage> {
        self.sync.cache().list(filter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::CacheReader;
    use crate::blobs::BlobStore;
    use crate::cache::ThreadCache;
    use crate::config::SyncPolicy;
    use crate::errors::AppError;
    use crate::retry::RetryPolicy;
    use crate::sync::SyncEngine;
    use crate::testing::{FakeProvider, thread};

    fn reader(dir: &std::path::Path) -> CacheReader {
        CacheReader::new(Arc::new(SyncEngine::new(
            Arc::new(ThreadCache::open_in_memory().expect("cache")),
            BlobStore::new(dir, "owner"),
            SyncPolicy::default(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        )))
    }

    #[tokio::test]
    async fn miss_syncs_once_then_serves_from_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reader = reader(dir.path());
        let provider = FakeProvider::new();
        provider.insert(thread("t1", "2025-01-01T00:00:00.000Z", "hello", &["INBOX"]));

        let first = reader.get_thread(Some(&provider), "t1").await.expect("get");
        assert_eq!(first.id, "t1");
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 1);

        let second = reader.get_thread(Some(&provider), "t1").await.expect("get");
        assert_eq!(second.messages.len(), 1);
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 1, "served from cache");
    }

    #[tokio::test]
    async fn missing_thread_is_fetched_exactly_once_before_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reader = reader(dir.path());
        let provider = FakeProvider::new();

        let err = reader
            .get_thread(Some(&provider), "gone")
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(provider.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn miss_without_session_is_no_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reader = reader(dir.path());
        let err = reader.get_thread(None, "t1").await.expect_err("must fail");
        assert!(matches!(err, AppError::NoSession(_)));
    }
}
