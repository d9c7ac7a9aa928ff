//! Paginated folder sync with single-flight guards
//!
//! A folder sync walks the upstream listing page by page, fetches each
//! thread with retries and writes it through to the blob store and the
//! thread cache. Per-thread failures are logged and skipped; failures of the
//! listing itself end the loop and propagate. The guard permit is released on
//! every exit path when it drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::cache::{ThreadCache, ThreadCacheRow};
use crate::config::SyncPolicy;
use crate::errors::{AppError, AppResult};
use crate::mime::format_timestamp;
use crate::retry::{RetryPolicy, retry};
use crate::single_flight::SingleFlight;
use crate::upstream::{ListThreadsRequest, MailProvider, ThreadDetail, folder_label};

/// Result of one `sync_folder` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Another sync of the same folder is in flight
    AlreadyRunning,
    /// The loop-enable flag is off
    Disabled,
    /// The folder already holds at least the configured number of rows
    ThresholdMet { cached: usize },
    Completed {
        pages: usize,
        synced: usize,
        failed: usize,
    },
}

/// Build the cache row for a fetched thread from its newest message
pub fn row_from_thread(provider_id: &str, thread: &ThreadDetail) -> AppResult<ThreadCacheRow> {
    let latest = thread
        .latest()
        .ok_or_else(|| AppError::NotFound(format!("thread {} has no messages", thread.id)))?;
    Ok(ThreadCacheRow {
        id: thread.id.clone(),
        provider_thread_id: latest.thread_id.clone(),
        provider_id: provider_id.to_owned(),
        latest_sender: latest.sender.clone(),
        latest_received_on: latest.received_on.clone(),
        latest_subject: latest.subject.clone(),
        latest_label_ids: latest.label_ids.clone(),
        updated_at: format_timestamp(&Utc::now()),
    })
}

pub struct SyncEngine {
    cache: Arc<ThreadCache>,
    blobs: BlobStore,
    guard: Arc<SingleFlight>,
    policy: SyncPolicy,
    retry: RetryPolicy,
    enabled: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        cache: Arc<ThreadCache>,
        blobs: BlobStore,
        policy: SyncPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            blobs,
            guard: Arc::new(SingleFlight::new(policy.guard_ttl)),
            enabled: AtomicBool::new(policy.enabled),
            policy,
            retry,
        }
    }

    pub fn cache(&self) -> &Arc<ThreadCache> {
        &self.cache
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "sync loop flag changed");
    }

    /// Keys with a sync currently in flight
    pub fn active_syncs(&self) -> Vec<String> {
        self.guard.active_keys()
    }

    /// Sync one folder into the cache
    ///
    /// # Errors
    ///
    /// Returns the listing error once retries are exhausted or the error is
    /// fatal. Per-thread failures are counted in the outcome instead.
    pub async fn sync_folder(
        &self,
        provider: &dyn MailProvider,
        folder: &str,
    ) -> AppResult<SyncOutcome> {
        if !self.is_enabled() {
            return Ok(SyncOutcome::Disabled);
        }
        let label = folder_label(folder);
        let Some(permit) = self.guard.try_permit(&format!("folder:{label}")) else {
            debug!(folder = %label, "folder sync already running");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let cached = self.cache.count(&label)?;
        if cached >= self.policy.max_threads {
            debug!(folder = %label, cached, "folder sync skipped, threshold met");
            return Ok(SyncOutcome::ThresholdMet { cached });
        }

        let mut request = ListThreadsRequest {
            folder: folder.to_owned(),
            max_results: self.policy.page_size,
            ..ListThreadsRequest::default()
        };
        let (mut pages, mut synced, mut failed) = (0, 0, 0);
        loop {
            let page = retry(&self.retry, "list threads", || provider.list_threads(&request)).await?;
            pages += 1;

            for summary in &page.threads {
                match self.sync_thread(provider, &summary.id).await {
                    Ok(Some(_)) => synced += 1,
                    Ok(None) => {}
                    Err(e) => {
                        failed += 1;
                        warn!(folder = %label, thread_id = %summary.id, error = %e, "thread sync failed, skipping");
                    }
                }
            }

            let Some(token) = page.continuation() else {
                break;
            };
            if !self.is_enabled() {
                info!(folder = %label, pages, "sync loop disabled mid-folder");
                break;
            }
            request.page_token = Some(token.to_owned());
            tokio::time::sleep(self.policy.page_delay).await;
        }

        info!(key = permit.key(), pages, synced, failed, "folder sync finished");
        Ok(SyncOutcome::Completed {
            pages,
            synced,
            failed,
        })
    }

    /// Fetch one thread and write it through to blob store and cache
    ///
    /// Returns `None` without touching upstream when the same thread is
    /// already being synced.
    pub async fn sync_thread(
        &self,
        provider: &dyn MailProvider,
        thread_id: &str,
    ) -> AppResult<Option<ThreadCacheRow>> {
        let Some(_permit) = self.guard.try_permit(&format!("thread:{thread_id}")) else {
            return Ok(None);
        };
        let thread = retry(&self.retry, "get thread", || provider.get_thread(thread_id)).await?;
        let row = row_from_thread(provider.provider_id(), &thread)?;
        self.blobs.put(&thread).await?;
        self.cache.upsert(&row)?;
        Ok(Some(row))
    }

    /// Drop a thread from cache and blob store
    pub async fn evict(&self, thread_id: &str) -> AppResult<()> {
        self.cache.delete(thread_id)?;
        self.blobs.delete(thread_id).await
    }
}
