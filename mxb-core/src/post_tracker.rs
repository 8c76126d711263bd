//! # Post Tracker
//!
//! Remembers the last-modified timestamp of recently bridged local posts so a
//! save that did not change anything is not sent to Matrix as an edit.
//!
//! The map is bounded. When full, entries older than the maximum age are
//! purged; a new entry is rejected only if that frees nothing. An
//! opportunistic sweep runs every `cleanup_every` puts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TrackingConfig;

#[derive(Debug, Clone, Copy)]
struct TrackedPost {
    last_modified: i64,
    recorded_at: Instant,
}

#[derive(Debug)]
pub struct PostTracker {
    entries: RwLock<HashMap<String, TrackedPost>>,
    capacity: usize,
    max_age: Duration,
    cleanup_every: u64,
    puts: AtomicU64,
}

impl PostTracker {
    pub fn new(capacity: usize, max_age: Duration, cleanup_every: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_age,
            cleanup_every: cleanup_every.max(1),
            puts: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(
            config.post_tracker_capacity,
            Duration::from_secs(config.post_tracker_max_age_secs),
            config.post_tracker_cleanup_every,
        )
    }

    /// Record `last_modified` for `post_id`. Returns `false` when the
    /// tracker is full of live entries.
    pub fn put(&self, post_id: &str, last_modified: i64) -> bool {
        let now = Instant::now();
        let stored = {
            let mut entries = self.entries.write();
            if !entries.contains_key(post_id) && entries.len() >= self.capacity {
                let before = entries.len();
                entries.retain(|_, e| now.saturating_duration_since(e.recorded_at) < self.max_age);
                debug!("Post tracker full, purged {} stale entries", before - entries.len());
            }

            if entries.contains_key(post_id) || entries.len() < self.capacity {
                entries.insert(
                    post_id.to_string(),
                    TrackedPost {
                        last_modified,
                        recorded_at: now,
                    },
                );
                true
            } else {
                false
            }
        };

        if !stored {
            warn!(
                "Post tracker at capacity ({}), not tracking {}",
                self.capacity, post_id
            );
            return false;
        }

        let puts = self.puts.fetch_add(1, Ordering::Relaxed) + 1;
        if puts % self.cleanup_every == 0 {
            self.cleanup();
        }
        true
    }

    pub fn get(&self, post_id: &str) -> Option<i64> {
        self.entries.read().get(post_id).map(|e| e.last_modified)
    }

    pub fn delete(&self, post_id: &str) -> bool {
        self.entries.write().remove(post_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop entries older than the maximum age; returns how many were removed
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.recorded_at) >= self.max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            let mut entries = self.entries.write();
            // may have been refreshed since the scan
            let still_expired = entries
                .get(&id)
                .is_some_and(|e| now.saturating_duration_since(e.recorded_at) >= self.max_age);
            if still_expired {
                entries.remove(&id);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Post tracker cleanup removed {} entries", removed);
        }
        removed
    }
}

impl Default for PostTracker {
    fn default() -> Self {
        Self::from_config(&TrackingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_put_get_delete() {
        let tracker = PostTracker::default();
        assert!(tracker.get("p1").is_none());

        assert!(tracker.put("p1", 100));
        assert_eq!(tracker.get("p1"), Some(100));

        assert!(tracker.put("p1", 200));
        assert_eq!(tracker.get("p1"), Some(200));
        assert_eq!(tracker.len(), 1);

        assert!(tracker.delete("p1"));
        assert!(!tracker.delete("p1"));
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_tracker_rejects_when_nothing_is_stale() {
        let tracker = PostTracker::new(2, HOUR, 1000);
        assert!(tracker.put("a", 1));
        assert!(tracker.put("b", 1));
        assert!(!tracker.put("c", 1));
        assert_eq!(tracker.len(), 2);

        // updating a tracked post is always allowed
        assert!(tracker.put("a", 2));
        assert_eq!(tracker.get("a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_tracker_purges_stale_entries() {
        let tracker = PostTracker::new(2, HOUR, 1000);
        assert!(tracker.put("old", 1));
        advance(HOUR + Duration::from_secs(1)).await;
        assert!(tracker.put("fresh", 1));

        assert!(tracker.put("new", 1));
        assert!(tracker.get("old").is_none());
        assert_eq!(tracker.get("fresh"), Some(1));
        assert_eq!(tracker.get("new"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_cleanup() {
        let tracker = PostTracker::new(100, HOUR, 3);
        tracker.put("a", 1);
        tracker.put("b", 1);
        advance(HOUR).await;

        // third put triggers the sweep
        tracker.put("c", 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("c"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_live_entries() {
        let tracker = PostTracker::new(100, HOUR, 1000);
        tracker.put("a", 1);
        advance(Duration::from_secs(1800)).await;
        tracker.put("b", 1);
        advance(Duration::from_secs(1800)).await;

        assert_eq!(tracker.cleanup(), 1);
        assert!(tracker.get("a").is_none());
        assert_eq!(tracker.get("b"), Some(1));
    }
}
