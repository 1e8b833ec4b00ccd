use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::reconciler::PendingLink;

#[derive(Debug, Clone)]
struct PendingEntry {
    link: PendingLink,
    stored_at: DateTime<Utc>,
}

/// Single-slot holder for the first half of an in-progress link, keyed by
/// session id. Storing a second value overwrites the first (last write wins).
/// Entries expire after `ttl` via a background sweep; expiry leaves no durable
/// trace, so an abandoned link attempt never reaches the store.
#[derive(Clone)]
pub struct PendingRegistry {
    entries: Arc<DashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl PendingRegistry {
    pub fn new(ttl: Duration) -> Self {
        let registry = Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        };

        let sweeper = registry.clone();
        tokio::spawn(async move {
            let period = sweeper.ttl.max(Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                sweeper.sweep();
            }
        });

        registry
    }

    pub fn put(&self, session_id: &str, link: PendingLink) {
        debug!(%session_id, namespace = link.namespace.as_str(), "stashing pending link half");
        self.entries.insert(
            session_id.to_string(),
            PendingEntry {
                link,
                stored_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, session_id: &str) -> Option<PendingLink> {
        let entry = self.entries.get(session_id)?;
        if self.expired(&entry) {
            drop(entry);
            self.entries.remove(session_id);
            return None;
        }
        Some(entry.link.clone())
    }

    /// Consume the slot once the second namespace completes.
    pub fn clear(&self, session_id: &str) {
        self.entries.remove(session_id);
    }

    fn expired(&self, entry: &PendingEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.stored_at);
        age.to_std().map(|age| age > self.ttl).unwrap_or(false)
    }

    fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let age = Utc::now().signed_duration_since(entry.stored_at);
            age.to_std().map(|age| age <= self.ttl).unwrap_or(true)
        });
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!(swept, "expired pending link halves");
        }
    }
}
