//! In-process [`TopicsStore`]. Backs the engine in tests and in embedders
//! that do not need durability.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, TopicsError};
use crate::port::{TopicsStore, epoch_window};
use crate::time::{Clock, SystemClock, epoch_at};
use crate::types::{
    CallersCanLearnMap, Caller, ClassificationMap, EpochArtifacts, EpochId, ReturnedTopics, Topic,
    UsageMap,
};

#[derive(Default)]
struct MemoryState {
    origin_ms: Option<u64>,
    usage: BTreeMap<EpochId, UsageMap>,
    app_usage: BTreeMap<EpochId, BTreeSet<String>>,
    epochs: BTreeMap<EpochId, EpochArtifacts>,
    returned: BTreeMap<EpochId, ReturnedTopics>,
}

impl MemoryState {
    fn split_off_before(&mut self, epoch: EpochId) {
        self.usage = self.usage.split_off(&epoch);
        self.app_usage = self.app_usage.split_off(&epoch);
        self.epochs = self.epochs.split_off(&epoch);
        self.returned = self.returned.split_off(&epoch);
    }
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicsStore for MemoryStore {
    fn current_epoch_id(&self, epoch_period_ms: u64) -> Result<EpochId> {
        let now = self.clock.now_millis();
        let mut state = self.state();
        let origin = *state.origin_ms.get_or_insert(now);
        Ok(epoch_at(origin, now, epoch_period_ms))
    }

    fn record_usage(&self, epoch: EpochId, app: &str, sdk: &str) -> Result<()> {
        let mut state = self.state();
        state.usage.entry(epoch).or_default().record(app, sdk);
        state
            .app_usage
            .entry(epoch)
            .or_default()
            .insert(app.to_string());
        Ok(())
    }

    fn usage_map(&self, epoch: EpochId) -> Result<UsageMap> {
        Ok(self.state().usage.get(&epoch).cloned().unwrap_or_default())
    }

    fn persist_epoch(&self, epoch: EpochId, artifacts: &EpochArtifacts) -> Result<()> {
        let mut state = self.state();
        if state.epochs.contains_key(&epoch) {
            return Err(TopicsError::storage(format!(
                "epoch {epoch} is already committed"
            )));
        }
        state.epochs.insert(epoch, artifacts.clone());
        state
            .returned
            .insert(epoch, artifacts.returned_topics.clone());
        if let Some(cutoff) = artifacts.delete_before {
            state.split_off_before(cutoff);
        }
        Ok(())
    }

    fn persist_returned_topics(&self, epoch: EpochId, topics: &ReturnedTopics) -> Result<()> {
        let mut state = self.state();
        let returned = state.returned.entry(epoch).or_default();
        for (caller, topic) in topics {
            returned.entry(caller.clone()).or_insert(*topic);
        }
        Ok(())
    }

    fn classification(&self, epoch: EpochId) -> Result<ClassificationMap> {
        Ok(self
            .state()
            .epochs
            .get(&epoch)
            .map(|a| a.classification.clone())
            .unwrap_or_default())
    }

    fn top_topics(&self, epoch: EpochId) -> Result<Vec<Topic>> {
        Ok(self
            .state()
            .epochs
            .get(&epoch)
            .map(|a| a.top_topics.clone())
            .unwrap_or_default())
    }

    fn callers_can_learn(&self, latest: EpochId, lookback: u64) -> Result<CallersCanLearnMap> {
        let state = self.state();
        let mut merged = CallersCanLearnMap::new();
        for (_, artifacts) in state.epochs.range(epoch_window(latest, lookback)) {
            for (topic, callers) in &artifacts.callers_can_learn {
                merged
                    .entry(*topic)
                    .or_default()
                    .extend(callers.iter().cloned());
            }
        }
        Ok(merged)
    }

    fn returned_topics(
        &self,
        latest: EpochId,
        lookback: u64,
    ) -> Result<BTreeMap<EpochId, ReturnedTopics>> {
        let state = self.state();
        Ok(state
            .returned
            .range(epoch_window(latest, lookback))
            .filter(|(_, topics)| !topics.is_empty())
            .map(|(epoch, topics)| (*epoch, topics.clone()))
            .collect())
    }

    fn apps_with_usage_history(&self) -> Result<BTreeSet<String>> {
        Ok(self.state().app_usage.values().flatten().cloned().collect())
    }

    fn apps_with_returned_topics(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .state()
            .returned
            .values()
            .flat_map(|topics| topics.keys().map(|c| c.app.clone()))
            .collect())
    }

    fn purge_apps(&self, apps: &[String]) -> Result<()> {
        let doomed: BTreeSet<&str> = apps.iter().map(String::as_str).collect();
        let keep = |caller: &Caller| !doomed.contains(caller.app.as_str());
        let mut state = self.state();

        for usage in state.usage.values_mut() {
            let remaining: UsageMap = usage
                .iter()
                .filter(|(app, _)| !doomed.contains(app))
                .flat_map(|(app, sdks)| sdks.iter().map(move |sdk| (app, sdk.as_str())))
                .collect();
            *usage = remaining;
        }
        for recorded in state.app_usage.values_mut() {
            recorded.retain(|app| !doomed.contains(app.as_str()));
        }
        for artifacts in state.epochs.values_mut() {
            artifacts
                .classification
                .retain(|app, _| !doomed.contains(app.as_str()));
            for callers in artifacts.callers_can_learn.values_mut() {
                callers.retain(|c| !doomed.contains(c.as_str()));
            }
            artifacts.callers_can_learn.retain(|_, c| !c.is_empty());
            artifacts.returned_topics.retain(|c, _| keep(c));
        }
        for returned in state.returned.values_mut() {
            returned.retain(|c, _| keep(c));
        }
        Ok(())
    }

    fn committed_epochs(&self) -> Result<Vec<EpochId>> {
        Ok(self.state().epochs.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn topic(id: i32) -> Topic {
        Topic::new(id, 1, 1)
    }

    #[test]
    fn test_epoch_id_advances_with_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());

        assert_eq!(store.current_epoch_id(100).unwrap(), 0);
        clock.advance(250);
        assert_eq!(store.current_epoch_id(100).unwrap(), 2);
    }

    #[test]
    fn test_persist_epoch_is_write_once() {
        let store = MemoryStore::new();
        store.persist_epoch(3, &EpochArtifacts::default()).unwrap();
        let err = store.persist_epoch(3, &EpochArtifacts::default());
        assert!(matches!(err, Err(TopicsError::Storage(_))));
    }

    #[test]
    fn test_persist_returned_topics_keeps_existing() {
        let store = MemoryStore::new();
        let caller = Caller::app_only("app");
        store
            .persist_returned_topics(1, &ReturnedTopics::from([(caller.clone(), topic(1))]))
            .unwrap();
        store
            .persist_returned_topics(1, &ReturnedTopics::from([(caller.clone(), topic(2))]))
            .unwrap();

        let returned = store.returned_topics(1, 1).unwrap();
        assert_eq!(returned[&1][&caller], topic(1));
    }

    #[test]
    fn test_commit_deletes_outdated_epochs() {
        let store = MemoryStore::new();
        for epoch in 0..3 {
            store.record_usage(epoch, "app", "").unwrap();
            store.persist_epoch(epoch, &EpochArtifacts::default()).unwrap();
        }
        let pruning = EpochArtifacts {
            delete_before: Some(2),
            ..Default::default()
        };

        assert!(store.persist_epoch(1, &pruning).is_err());
        assert_eq!(store.committed_epochs().unwrap(), vec![0, 1, 2]);

        store.persist_epoch(3, &pruning).unwrap();
        assert_eq!(store.committed_epochs().unwrap(), vec![2, 3]);
        assert!(store.usage_map(1).unwrap().is_empty());
    }
}
