//! Registry of engine calls currently holding a worker slot.
//!
//! A call whose caller timed out is marked abandoned rather than killed. When
//! it eventually finishes, its result is discarded instead of being delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct InFlightCall {
    /// First characters of the query text, for logs
    pub preview: String,
    pub started: Instant,
    pub abandoned: bool,
}

/// Point-in-time view of one call, for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InFlightSnapshot {
    pub id: u64,
    pub preview: String,
    pub running_millis: u64,
    pub abandoned: bool,
}

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    calls: DashMap<u64, InFlightCall>,
    next_id: AtomicU64,
}

const PREVIEW_CHARS: usize = 80;

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched call. The returned guard deregisters it on drop.
    pub fn register(self: &Arc<Self>, text: &str) -> InFlightGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        self.calls.insert(
            id,
            InFlightCall {
                preview,
                started: Instant::now(),
                abandoned: false,
            },
        );
        InFlightGuard {
            registry: Arc::clone(self),
            id,
            finished: false,
        }
    }

    /// Mark a call abandoned. Returns false when it already completed.
    pub fn abandon(&self, id: u64) -> bool {
        match self.calls.get_mut(&id) {
            Some(mut call) => {
                call.abandoned = true;
                true
            }
            None => false,
        }
    }

    fn complete(&self, id: u64) -> Option<InFlightCall> {
        self.calls.remove(&id).map(|(_, call)| call)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Number of calls whose caller has already given up
    pub fn abandoned_count(&self) -> usize {
        self.calls.iter().filter(|c| c.abandoned).count()
    }

    pub fn snapshot(&self) -> Vec<InFlightSnapshot> {
        let mut calls: Vec<InFlightSnapshot> = self
            .calls
            .iter()
            .map(|entry| InFlightSnapshot {
                id: *entry.key(),
                preview: entry.preview.clone(),
                running_millis: duration_millis(entry.started.elapsed()),
                abandoned: entry.abandoned,
            })
            .collect();
        calls.sort_by_key(|c| c.id);
        calls
    }
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Held by the task running one engine call.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    id: u64,
    finished: bool,
}

impl InFlightGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deregister the call, reporting whether its caller abandoned it
    /// (and for how long it ran).
    pub fn finish(mut self) -> Completion {
        self.finished = true;
        match self.registry.complete(self.id) {
            Some(call) if call.abandoned => Completion::Abandoned {
                ran_for: call.started.elapsed(),
                preview: call.preview,
            },
            _ => Completion::Deliver,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.complete(self.id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The caller is still waiting
    Deliver,
    /// The caller timed out; the result must be discarded
    Abandoned { ran_for: Duration, preview: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_finish() {
        let registry = Arc::new(InFlightRegistry::new());
        let guard = registry.register("SELECT * WHERE { ?s ?p ?o }");
        assert_eq!(registry.len(), 1);
        assert_eq!(guard.finish(), Completion::Deliver);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_call_is_discarded() {
        let registry = Arc::new(InFlightRegistry::new());
        let guard = registry.register("SELECT 1");
        assert!(registry.abandon(guard.id()));
        assert_eq!(registry.abandoned_count(), 1);

        assert!(matches!(guard.finish(), Completion::Abandoned { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_abandon_after_completion_is_noop() {
        let registry = Arc::new(InFlightRegistry::new());
        let guard = registry.register("SELECT 1");
        let id = guard.id();
        guard.finish();
        assert!(!registry.abandon(id));
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let registry = Arc::new(InFlightRegistry::new());
        {
            let _guard = registry.register("SELECT 1");
            assert_eq!(registry.snapshot().len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_preview_is_bounded() {
        let registry = Arc::new(InFlightRegistry::new());
        let long = "x".repeat(500);
        let _guard = registry.register(&long);
        assert_eq!(registry.snapshot()[0].preview.len(), PREVIEW_CHARS);
    }
}
