//! # Adaptive Result Cache
//!
//! Every result handed to [`AdaptiveResultCache::put`] is persisted in full
//! under a content-derived id. What goes back to the caller depends on the
//! result's estimated token cost: small results are delivered whole, large
//! ones as a [`Summary`] plus the id for later retrieval.
//!
//! ## Storage layout
//!
//! Each entry is two blobs in the backing [`BlobStore`]:
//! - `<id>.result.json`: the full [`ExecutionResult`]
//! - `<id>.meta.json`: the [`CacheEntry`] (provenance, size, summary)
//!
//! ## Concurrency
//!
//! The id → entry index sits behind one mutex, held only to register or
//! deregister an id. Blob reads and writes happen outside it.
//!
//! ## Eviction
//!
//! Nothing is evicted implicitly. Entries go away through [`clear`],
//! [`remove`], or the optional age-based cleanup task. Growth is reported by
//! [`check_size`], never silently handled.
//!
//! [`clear`]: AdaptiveResultCache::clear
//! [`remove`]: AdaptiveResultCache::remove
//! [`check_size`]: AdaptiveResultCache::check_size

mod summary;

pub use summary::{estimate_tokens, ColumnStats, Summary};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::query::{ExecutionResult, Query};
use crate::storage::{BlobStore, StorageError, StorageResult};

use summary::tokens_for_bytes;

const RESULT_SUFFIX: &str = ".result.json";
const META_SUFFIX: &str = ".meta.json";
const ID_LEN: usize = 32;

/// Metadata of one cached result. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    /// The query that produced the result, for provenance
    pub query: Query,
    pub created_at: DateTime<Utc>,
    pub size_estimate_bytes: u64,
    pub summary: Summary,
    /// Blob key of the persisted full result
    pub payload_key: String,
}

/// What the caller of `put` receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum Delivery {
    Full {
        cache_id: String,
        result: ExecutionResult,
    },
    Summarized {
        cache_id: String,
        summary: Summary,
        truncated_for_delivery: bool,
    },
}

impl Delivery {
    pub fn cache_id(&self) -> &str {
        match self {
            Delivery::Full { cache_id, .. } | Delivery::Summarized { cache_id, .. } => cache_id,
        }
    }

    pub fn is_summarized(&self) -> bool {
        matches!(self, Delivery::Summarized { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    pub entry: CacheEntry,
    pub delivery: Delivery,
}

/// Size of one entry as reported by `check_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySize {
    pub id: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizeWarning {
    EntryTooLarge { id: String, bytes: u64, threshold: u64 },
    TotalTooLarge { bytes: u64, threshold: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeReport {
    /// Sorted by id
    pub entries: Vec<EntrySize>,
    pub total_bytes: u64,
    pub warnings: Vec<SizeWarning>,
}

/// Result cache over a [`BlobStore`].
pub struct AdaptiveResultCache {
    config: CacheConfig,
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    index: Mutex<HashMap<String, CacheEntry>>,
}

impl AdaptiveResultCache {
    /// Open the cache, rebuilding the index from the entries already in `store`.
    pub fn open(
        config: CacheConfig,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let keys = store.list()?;
        let mut index = HashMap::new();

        for key in keys.iter().filter(|k| k.ends_with(META_SUFFIX)) {
            let entry: CacheEntry = match store
                .read(key)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable cache metadata");
                    continue;
                }
            };
            if !keys.contains(&entry.payload_key) {
                warn!(id = %entry.id, "Skipping cache entry whose payload is missing");
                continue;
            }
            index.insert(entry.id.clone(), entry);
        }

        if !index.is_empty() {
            info!(entries = index.len(), "Rebuilt result cache index");
        }

        Ok(AdaptiveResultCache {
            config,
            store,
            clock,
            index: Mutex::new(index),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Persist `result` and decide how to deliver it.
    ///
    /// Fails only when the backing store does; the result is never dropped
    /// silently.
    pub fn put(&self, query: &Query, result: &ExecutionResult) -> StorageResult<PutOutcome> {
        let payload = serde_json::to_vec(result)?;
        let tokens = tokens_for_bytes(payload.len() as u64, self.config.bytes_per_token);
        let id = content_id(query, &payload)?;

        let existing = self.index.lock().get(&id).cloned();
        let entry = match existing {
            Some(entry) => {
                debug!(id = %id, "Result already cached");
                entry
            }
            None => self.store_entry(id, query, result, &payload, tokens)?,
        };

        let delivery = if tokens <= self.config.summary_token_threshold {
            Delivery::Full {
                cache_id: entry.id.clone(),
                result: result.clone(),
            }
        } else {
            Delivery::Summarized {
                cache_id: entry.id.clone(),
                summary: entry.summary.clone(),
                truncated_for_delivery: true,
            }
        };

        Ok(PutOutcome { entry, delivery })
    }

    fn store_entry(
        &self,
        id: String,
        query: &Query,
        result: &ExecutionResult,
        payload: &[u8],
        tokens: u64,
    ) -> StorageResult<CacheEntry> {
        let entry = CacheEntry {
            payload_key: format!("{id}{RESULT_SUFFIX}"),
            id,
            query: query.clone(),
            created_at: self.clock.wall(),
            size_estimate_bytes: payload.len() as u64,
            summary: Summary::build(result, self.config.sample_rows, tokens),
        };
        let meta_key = format!("{}{META_SUFFIX}", entry.id);

        if let Err(e) = self.store.write(&entry.payload_key, payload) {
            error!(id = %entry.id, error = %e, "Failed to persist cached result");
            return Err(e);
        }
        let meta = serde_json::to_vec_pretty(&entry)?;
        if let Err(e) = self.store.write(&meta_key, &meta) {
            error!(id = %entry.id, error = %e, "Failed to persist cache metadata");
            let _ = self.store.delete(&entry.payload_key);
            return Err(e);
        }

        // A concurrent put of the same content may have registered first
        let entry = self
            .index
            .lock()
            .entry(entry.id.clone())
            .or_insert(entry)
            .clone();
        debug!(
            id = %entry.id,
            bytes = entry.size_estimate_bytes,
            tokens,
            "Cached result"
        );
        Ok(entry)
    }

    /// Full result stored under `id`.
    pub fn get(&self, id: &str) -> GatewayResult<ExecutionResult> {
        let payload_key = self
            .index
            .lock()
            .get(id)
            .map(|entry| entry.payload_key.clone())
            .ok_or_else(|| GatewayError::not_found(id))?;

        let bytes = match self.store.read(&payload_key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_missing() => return Err(GatewayError::not_found(id)),
            Err(e) => return Err(e.into()),
        };
        let result = serde_json::from_slice(&bytes).map_err(StorageError::from)?;
        Ok(result)
    }

    /// Metadata of one entry
    pub fn entry(&self, id: &str) -> Option<CacheEntry> {
        self.index.lock().get(id).cloned()
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.index.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Walk all entries and report their sizes, warning about oversized ones.
    pub fn check_size(&self) -> SizeReport {
        let mut entries: Vec<EntrySize> = self
            .index
            .lock()
            .values()
            .map(|e| EntrySize {
                id: e.id.clone(),
                bytes: e.size_estimate_bytes,
                created_at: e.created_at,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let total_bytes = entries.iter().map(|e| e.bytes).sum();
        let mut warnings = Vec::new();

        for entry in entries
            .iter()
            .filter(|e| e.bytes > self.config.entry_warn_bytes)
        {
            warn!(
                id = %entry.id,
                bytes = entry.bytes,
                threshold = self.config.entry_warn_bytes,
                "Cache entry exceeds size threshold"
            );
            warnings.push(SizeWarning::EntryTooLarge {
                id: entry.id.clone(),
                bytes: entry.bytes,
                threshold: self.config.entry_warn_bytes,
            });
        }
        if total_bytes > self.config.total_warn_bytes {
            warn!(
                bytes = total_bytes,
                threshold = self.config.total_warn_bytes,
                "Result cache exceeds total size threshold"
            );
            warnings.push(SizeWarning::TotalTooLarge {
                bytes: total_bytes,
                threshold: self.config.total_warn_bytes,
            });
        }

        SizeReport {
            entries,
            total_bytes,
            warnings,
        }
    }

    /// Delete every entry, or only those at least `older_than` old.
    /// Returns the number of entries removed.
    pub fn clear(&self, older_than: Option<Duration>) -> StorageResult<usize> {
        let now = self.clock.wall();
        let removed: Vec<CacheEntry> = {
            let mut index = self.index.lock();
            let ids: Vec<String> = index
                .values()
                .filter(|e| match older_than {
                    None => true,
                    Some(age) => age_of(e, now) >= age,
                })
                .map(|e| e.id.clone())
                .collect();
            ids.iter().filter_map(|id| index.remove(id)).collect()
        };

        let mut first_error = None;
        for entry in &removed {
            if let Err(e) = self.delete_blobs(entry) {
                error!(id = %entry.id, error = %e, "Failed to delete cache entry blobs");
                first_error.get_or_insert(e);
            }
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "Cleared cache entries");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed.len()),
        }
    }

    /// Delete one entry. Returns false when the id is unknown.
    pub fn remove(&self, id: &str) -> StorageResult<bool> {
        let removed = self.index.lock().remove(id);
        match removed {
            Some(entry) => {
                self.delete_blobs(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_blobs(&self, entry: &CacheEntry) -> StorageResult<()> {
        // Metadata first, so a partial failure never resurrects the entry on reopen
        self.store.delete(&format!("{}{META_SUFFIX}", entry.id))?;
        self.store.delete(&entry.payload_key)
    }

    /// Periodically clear entries older than `max_age` until the returned
    /// handle is shut down.
    pub fn spawn_age_cleanup(self: &Arc<Self>, max_age: Duration, interval: Duration) -> CleanupTask {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let cache = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match cache.clear(Some(max_age)) {
                            Ok(0) => {}
                            Ok(n) => info!(removed = n, "Age cleanup removed cache entries"),
                            Err(e) => warn!(error = %e, "Age cleanup failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Cache age cleanup shutting down");
                        break;
                    }
                }
            }
        });

        CleanupTask {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

fn age_of(entry: &CacheEntry, now: DateTime<Utc>) -> Duration {
    (now - entry.created_at).to_std().unwrap_or(Duration::ZERO)
}

/// Content-derived id: the same query and payload always map to the same id.
fn content_id(query: &Query, payload: &[u8]) -> StorageResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(query.text.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(&query.parameters)?);
    hasher.update([0u8]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(ID_LEN);
    Ok(hex)
}

/// Handle to the background age cleanup task.
pub struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Signal the task to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
