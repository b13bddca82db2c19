//! Read-through snapshot of topics returned in recent epochs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::ConfigSource;
use crate::error::Result;
use crate::port::TopicsStore;
use crate::types::{Caller, Topic};

/// Caller → topics, most recent epoch first, at most one per epoch.
type Snapshot = HashMap<Caller, Vec<Topic>>;

pub struct CacheManager<S> {
    store: Arc<S>,
    config: Arc<dyn ConfigSource>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl<S: TopicsStore> CacheManager<S> {
    pub fn new(store: Arc<S>, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            store,
            config,
            snapshot: RwLock::new(Arc::default()),
        }
    }

    /// Rebuild the snapshot from the epochs before the current one and
    /// swap it in. Readers see either the old or the new snapshot.
    pub fn load_cache(&self) -> Result<()> {
        let config = self.config.load()?;
        let current = self.store.current_epoch_id(config.epoch_period_ms)?;

        let mut fresh = Snapshot::new();
        if let Some(latest) = current.checked_sub(1) {
            let by_epoch = self
                .store
                .returned_topics(latest, config.number_of_lookback_epochs)?;
            for topics in by_epoch.values().rev() {
                for (caller, topic) in topics {
                    fresh.entry(caller.clone()).or_default().push(*topic);
                }
            }
        }

        let callers = fresh.len();
        let fresh = Arc::new(fresh);
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::info!(epoch = current, callers, "topics cache loaded");
        Ok(())
    }

    /// Up to `lookback` topics for the caller, most recent first. Empty
    /// before the first load and for unknown callers.
    pub fn get_topics(&self, lookback: usize, app: &str, sdk: &str) -> Vec<Topic> {
        let snapshot = self.snapshot();
        snapshot
            .get(&Caller::new(app, sdk))
            .map(|topics| topics.iter().take(lookback).copied().collect())
            .unwrap_or_default()
    }

    /// Number of callers in the current snapshot.
    pub fn cached_callers(&self) -> usize {
        self.snapshot().len()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::TopicsConfig;
    use crate::memory::MemoryStore;
    use crate::time::ManualClock;
    use crate::types::{EpochArtifacts, ReturnedTopics};

    const PERIOD: u64 = 1_000;

    fn topic(id: i32) -> Topic {
        Topic::new(id, 1, 1)
    }

    fn config() -> Arc<dyn ConfigSource> {
        Arc::new(TopicsConfig {
            epoch_period_ms: PERIOD,
            ..Default::default()
        })
    }

    fn commit(store: &MemoryStore, epoch: u64, returned: &[(&str, &str, i32)]) {
        let returned_topics: ReturnedTopics = returned
            .iter()
            .map(|&(app, sdk, id)| (Caller::new(app, sdk), topic(id)))
            .collect();
        store
            .persist_epoch(
                epoch,
                &EpochArtifacts {
                    returned_topics,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    /// Store whose current epoch is `current`, with the origin pinned at 0.
    fn store_at(current: u64) -> (Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        store.current_epoch_id(PERIOD).unwrap();
        clock.set(current * PERIOD);
        (store, clock)
    }

    #[test]
    fn test_get_topics_before_load_is_empty() {
        let (store, _clock) = store_at(2);
        commit(&store, 1, &[("app1", "", 1)]);
        let cache = CacheManager::new(store, config());

        assert!(cache.get_topics(3, "app1", "").is_empty());
        assert_eq!(cache.cached_callers(), 0);
    }

    #[test]
    fn test_load_cache_most_recent_first() {
        let (store, _clock) = store_at(4);
        commit(&store, 0, &[("app1", "sdk1", 10)]);
        commit(&store, 1, &[("app1", "sdk1", 11)]);
        commit(&store, 2, &[("app1", "sdk1", 12), ("app2", "", 20)]);
        commit(&store, 3, &[("app1", "sdk1", 13)]);
        // current epoch is never served
        commit(&store, 4, &[("app1", "sdk1", 14)]);

        let cache = CacheManager::new(store, config());
        cache.load_cache().unwrap();

        assert_eq!(
            cache.get_topics(3, "app1", "sdk1"),
            vec![topic(13), topic(12), topic(11)]
        );
        assert_eq!(cache.get_topics(1, "app1", "sdk1"), vec![topic(13)]);
        assert_eq!(cache.get_topics(5, "app2", ""), vec![topic(20)]);
        assert!(cache.get_topics(0, "app1", "sdk1").is_empty());
        assert!(cache.get_topics(3, "app1", "").is_empty());
        assert!(cache.get_topics(3, "unknown", "sdk1").is_empty());
        assert_eq!(cache.cached_callers(), 2);
    }

    #[test]
    fn test_load_cache_in_first_epoch_is_empty() {
        let (store, _clock) = store_at(0);
        commit(&store, 0, &[("app1", "", 1)]);
        let cache = CacheManager::new(store, config());
        cache.load_cache().unwrap();
        assert_eq!(cache.cached_callers(), 0);
    }

    #[test]
    fn test_reload_replaces_snapshot() {
        let (store, clock) = store_at(1);
        commit(&store, 0, &[("app1", "", 1)]);
        let cache = CacheManager::new(store.clone(), config());
        cache.load_cache().unwrap();
        assert_eq!(cache.get_topics(3, "app1", ""), vec![topic(1)]);

        commit(&store, 1, &[("app2", "", 2)]);
        clock.set(2 * PERIOD);
        cache.load_cache().unwrap();
        assert_eq!(cache.get_topics(3, "app1", ""), vec![topic(1)]);
        assert_eq!(cache.get_topics(3, "app2", ""), vec![topic(2)]);

        // epoch 0 falls out of a 3-epoch window once current reaches 4
        clock.set(4 * PERIOD);
        cache.load_cache().unwrap();
        assert!(cache.get_topics(3, "app1", "").is_empty());
        assert_eq!(cache.get_topics(3, "app2", ""), vec![topic(2)]);
    }

    #[test]
    fn test_concurrent_readers_during_reload() {
        let (store, _clock) = store_at(3);
        commit(&store, 1, &[("app1", "sdk1", 1)]);
        commit(&store, 2, &[("app1", "sdk1", 2)]);
        let cache = Arc::new(CacheManager::new(store, config()));
        cache.load_cache().unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let topics = cache.get_topics(3, "app1", "sdk1");
                        assert_eq!(topics, vec![topic(2), topic(1)]);
                    }
                })
            })
            .collect();
        for _ in 0..20 {
            cache.load_cache().unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
