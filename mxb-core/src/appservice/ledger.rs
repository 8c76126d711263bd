//! Transaction id ledger for at-most-once processing of redelivered pushes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::config::TrackingConfig;

/// Transaction ids seen within the retention window.
///
/// An id older than the window counts as unseen, whether or not the sweep has
/// removed it yet.
#[derive(Debug)]
pub struct TransactionLedger {
    seen: RwLock<HashMap<String, Instant>>,
    retention: Duration,
    sweep_every: u64,
    inserts: AtomicU64,
}

impl TransactionLedger {
    pub fn new(retention: Duration, sweep_every: u64) -> Self {
        Self {
            seen: RwLock::new(HashMap::new()),
            retention,
            sweep_every: sweep_every.max(1),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(
            Duration::from_secs(config.transaction_retention_secs),
            config.transaction_sweep_every,
        )
    }

    /// Record `txn_id`; `false` means it is a redelivery inside the window
    pub fn try_record(&self, txn_id: &str) -> bool {
        let now = Instant::now();
        let recorded = {
            let mut seen = self.seen.write();
            match seen.get(txn_id) {
                Some(first_seen) if now.saturating_duration_since(*first_seen) < self.retention => {
                    false
                }
                _ => {
                    seen.insert(txn_id.to_string(), now);
                    true
                }
            }
        };

        if recorded {
            let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
            if inserts % self.sweep_every == 0 {
                self.sweep();
            }
        }
        recorded
    }

    pub fn contains(&self, txn_id: &str) -> bool {
        let now = Instant::now();
        self.seen
            .read()
            .get(txn_id)
            .is_some_and(|t| now.saturating_duration_since(*t) < self.retention)
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }

    /// Collect expired ids under the read lock, then remove each under the
    /// write lock after re-checking its age
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .seen
            .read()
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(**t) >= self.retention)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            let mut seen = self.seen.write();
            let still_expired = seen
                .get(&id)
                .is_some_and(|t| now.saturating_duration_since(*t) >= self.retention);
            if still_expired {
                seen.remove(&id);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Transaction ledger sweep removed {} ids", removed);
        }
        removed
    }
}

impl Default for TransactionLedger {
    fn default() -> Self {
        Self::from_config(&TrackingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_inside_window() {
        let ledger = TransactionLedger::new(HOUR, 100);
        assert!(ledger.try_record("t1"));
        assert!(!ledger.try_record("t1"));
        assert!(ledger.contains("t1"));

        advance(HOUR - Duration::from_secs(1)).await;
        assert!(!ledger.try_record("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_id_counts_as_unseen_before_sweep() {
        let ledger = TransactionLedger::new(HOUR, 100);
        assert!(ledger.try_record("t1"));

        advance(HOUR).await;
        assert!(!ledger.contains("t1"));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.try_record("t1"));
        // window restarts from the new record
        assert!(!ledger.try_record("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_every_n_inserts() {
        let ledger = TransactionLedger::new(HOUR, 3);
        ledger.try_record("a");
        ledger.try_record("b");
        advance(HOUR).await;

        assert_eq!(ledger.len(), 2);
        // third insertion sweeps a and b
        ledger.try_record("c");
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_fresh_ids() {
        let ledger = TransactionLedger::new(HOUR, 1000);
        ledger.try_record("old");
        advance(HOUR / 2).await;
        ledger.try_record("new");
        advance(HOUR / 2).await;

        assert_eq!(ledger.sweep(), 1);
        assert!(ledger.contains("new"));
        assert!(!ledger.contains("old"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_admit_once() {
        let ledger = Arc::new(TransactionLedger::default());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move { ledger.try_record("same") }));
        }

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);
    }
}
