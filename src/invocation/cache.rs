//! Short-TTL cache of each plugin's advertised tool list.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::transport::ToolDefinition;
use crate::types::SessionKey;

#[derive(Debug)]
struct CacheEntry {
    tools: Arc<Vec<ToolDefinition>>,
    expires_at: Instant,
    hits: u64,
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub key: String,
    pub tool_count: usize,
    pub hits: u64,
    pub expires_in_secs: u64,
}

/// Snapshot of the whole cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub entries: usize,
    pub total_hits: u64,
    pub ttl_secs: u64,
    pub items: Vec<CacheEntryInfo>,
}

/// Tool definitions per (user, plugin), served until their expiry.
#[derive(Debug)]
pub struct ToolCache {
    ttl: Duration,
    entries: DashMap<SessionKey, CacheEntry>,
    total_hits: AtomicU64,
}

impl ToolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            total_hits: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Unexpired tools for `key`. Expired entries are dropped, never served.
    pub fn get(&self, key: &SessionKey) -> Option<Arc<Vec<ToolDefinition>>> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.expires_at > now {
                entry.hits += 1;
                self.total_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.tools.clone());
            }
        }
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, key: SessionKey, tools: Vec<ToolDefinition>) -> Arc<Vec<ToolDefinition>> {
        let tools = Arc::new(tools);
        self.entries.insert(
            key,
            CacheEntry {
                tools: tools.clone(),
                expires_at: Instant::now() + self.ttl,
                hits: 0,
            },
        );
        tools
    }

    /// Remove entries matching the filter (`None` matches all). Returns the count removed.
    pub fn clear(&self, user_id: Option<&str>, plugin_name: Option<&str>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.matches(user_id, plugin_name));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let now = Instant::now();
        let mut items: Vec<CacheEntryInfo> = self
            .entries
            .iter()
            .map(|e| CacheEntryInfo {
                key: e.key().to_string(),
                tool_count: e.tools.len(),
                hits: e.hits,
                expires_in_secs: e.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        CacheSnapshot {
            entries: items.len(),
            total_hits: self.total_hits.load(Ordering::Relaxed),
            ttl_secs: self.ttl.as_secs(),
            items,
        }
    }
}
