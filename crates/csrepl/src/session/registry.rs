//! Concurrent map of context id → metadata.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::Timestamp;

/// What the registry knows about one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    /// Opaque context id.
    pub context_id: String,
    /// First time the context was touched.
    pub created_at: Timestamp,
    /// Most recent touch.
    pub last_accessed_at: Timestamp,
    /// Executions attributed to the context.
    pub execution_count: u64,
    /// Set on the first touch and never cleared.
    pub is_initialized: bool,
}

impl ContextMetadata {
    fn new(context_id: &str, now: Timestamp) -> Self {
        Self {
            context_id: context_id.to_string(),
            created_at: now,
            last_accessed_at: now,
            execution_count: 0,
            is_initialized: false,
        }
    }
}

/// Bookkeeping for execution contexts. Entries are never evicted.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    contexts: DashMap<String, ContextMetadata>,
}

impl ContextRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an execution against `context_id`, creating the entry if needed.
    pub fn touch(&self, context_id: &str) -> ContextMetadata {
        let now = Timestamp::now();
        let mut entry = self
            .contexts
            .entry(context_id.to_string())
            .or_insert_with(|| ContextMetadata::new(context_id, now));
        entry.execution_count += 1;
        entry.last_accessed_at = now;
        entry.is_initialized = true;
        entry.value().clone()
    }

    /// Metadata for one context.
    #[must_use]
    pub fn get(&self, context_id: &str) -> Option<ContextMetadata> {
        self.contexts.get(context_id).map(|entry| entry.value().clone())
    }

    /// Ids of all known contexts, sorted.
    #[must_use]
    pub fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.contexts.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// All metadata, most recently used first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ContextMetadata> {
        let mut all: Vec<ContextMetadata> = self.contexts.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| {
            b.last_accessed_at
                .cmp(&a.last_accessed_at)
                .then_with(|| a.context_id.cmp(&b.context_id))
        });
        all
    }

    /// Forget one context. Returns whether it existed.
    pub fn remove(&self, context_id: &str) -> bool {
        self.contexts.remove(context_id).is_some()
    }

    /// Forget every context. Returns how many there were.
    pub fn clear(&self) -> usize {
        let ids = self.list_active();
        ids.iter().filter(|id| self.remove(id)).count()
    }

    /// Number of known contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no context is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_touch_creates_initialized_entry() {
        let registry = ContextRegistry::new();
        let meta = registry.touch("a");
        assert_eq!(meta.context_id, "a");
        assert_eq!(meta.execution_count, 1);
        assert!(meta.is_initialized);
        assert!(meta.created_at <= meta.last_accessed_at);
    }

    #[test]
    fn touch_counts_and_keeps_creation_time() {
        let registry = ContextRegistry::new();
        let first = registry.touch("a");
        registry.touch("a");
        let third = registry.touch("a");
        assert_eq!(third.execution_count, 3);
        assert_eq!(third.created_at, first.created_at);
        assert!(third.last_accessed_at >= first.last_accessed_at);
        assert_eq!(registry.get("a"), Some(third));
    }

    #[test]
    fn unknown_context_is_none() {
        assert!(ContextRegistry::new().get("missing").is_none());
    }

    #[test]
    fn list_is_sorted() {
        let registry = ContextRegistry::new();
        for id in ["c", "a", "b"] {
            registry.touch(id);
        }
        assert_eq!(registry.list_active(), ["a", "b", "c"]);
    }

    #[test]
    fn snapshot_is_most_recent_first() {
        let registry = ContextRegistry::new();
        registry.touch("old");
        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.touch("new");
        let ids: Vec<_> = registry.snapshot().into_iter().map(|m| m.context_id).collect();
        assert_eq!(ids, ["new", "old"]);
    }

    #[test]
    fn remove_and_clear() {
        let registry = ContextRegistry::new();
        registry.touch("a");
        registry.touch("b");
        registry.touch("c");
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn serializes_with_camel_case_and_epoch_timestamps() {
        let registry = ContextRegistry::new();
        let json = serde_json::to_value(registry.touch("ctx")).unwrap();
        assert_eq!(json["contextId"], "ctx");
        assert_eq!(json["executionCount"], 1);
        assert_eq!(json["isInitialized"], true);
        assert!(json["createdAt"]["secs_since_epoch"].is_u64());
        assert!(json["lastAccessedAt"]["nanos_since_epoch"].is_u64());
    }

    #[test]
    fn concurrent_touches_are_all_counted() {
        let registry = Arc::new(ContextRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.touch("shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.get("shared").unwrap().execution_count, 800);
    }
}
