//! Positions cache
//!
//! Short-lived per-user cache of exchange reads (positions, balances, open
//! orders). Entries expire after a TTL; any order placed for a user
//! invalidates that user's entries.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Positions,
    Balances,
    OpenOrders,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Positions => "positions",
            CacheKind::Balances => "balances",
            CacheKind::OpenOrders => "open_orders",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct PositionsCache {
    entries: Mutex<HashMap<(i64, CacheKind), Entry>>,
    default_ttl: Duration,
}

impl Default for PositionsCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PositionsCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fresh value or `None`; expired entries are dropped on read
    pub fn get(&self, user_id: i64, kind: CacheKind) -> Option<Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = (user_id, kind);
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, user_id: i64, kind: CacheKind, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (user_id, kind),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop one kind for a user, or every kind when `kind` is `None`
    pub fn invalidate(&self, user_id: i64, kind: Option<CacheKind>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(uid, k), _| !(*uid == user_id && kind.map_or(true, |want| *k == want)));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(user_id, removed, "Invalidated cached exchange reads");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Remove every expired entry
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically sweep until `shutdown` flips to true
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!("Positions cache sweep removed {} entries", removed);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let cache = PositionsCache::default();
        cache.set(1, CacheKind::Positions, json!([{"symbol": "BTCUSDT"}]), None);
        assert_eq!(
            cache.get(1, CacheKind::Positions),
            Some(json!([{"symbol": "BTCUSDT"}]))
        );
        assert!(cache.get(1, CacheKind::Balances).is_none());
        assert!(cache.get(2, CacheKind::Positions).is_none());
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let cache = PositionsCache::default();
        cache.set(1, CacheKind::Positions, json!([]), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(1, CacheKind::Positions).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_single_kind_and_all() {
        let cache = PositionsCache::default();
        cache.set(1, CacheKind::Positions, json!(1), None);
        cache.set(1, CacheKind::Balances, json!(2), None);
        cache.set(2, CacheKind::Positions, json!(3), None);

        assert_eq!(cache.invalidate(1, Some(CacheKind::Balances)), 1);
        assert!(cache.get(1, CacheKind::Positions).is_some());

        assert_eq!(cache.invalidate(1, None), 1);
        assert!(cache.get(1, CacheKind::Positions).is_none());
        assert!(cache.get(2, CacheKind::Positions).is_some());
    }

    #[test]
    fn test_sweep_and_clear() {
        let cache = PositionsCache::default();
        cache.set(1, CacheKind::Positions, json!(1), Some(Duration::from_millis(0)));
        cache.set(2, CacheKind::Positions, json!(2), Some(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let cache = Arc::new(PositionsCache::default());
        let (tx, rx) = watch::channel(false);
        let handle = cache.clone().spawn_sweeper(Duration::from_millis(5), rx);
        cache.set(1, CacheKind::Positions, json!(1), Some(Duration::from_millis(0)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
