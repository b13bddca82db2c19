//! Boundaries to the outside world: durable storage and the OS package
//! inventory. The engine only ever talks to these traits.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::Result;
use crate::types::{
    CallersCanLearnMap, ClassificationMap, EpochArtifacts, EpochId, ReturnedTopics, Topic,
    UsageMap,
};

/// Epoch-indexed storage for every artifact the engine reads or writes.
///
/// Implementations own transaction boundaries: each method either fully
/// applies or fails without side effects. Window reads cover the
/// `lookback` epochs ending at `latest`, i.e. `(latest - lookback, latest]`,
/// clamped at epoch 0.
pub trait TopicsStore: Send + Sync {
    /// Current epoch under `epoch_period_ms`. The store persists the epoch
    /// origin the first time it is asked.
    fn current_epoch_id(&self, epoch_period_ms: u64) -> Result<EpochId>;

    /// Append a usage fact to both usage tables.
    fn record_usage(&self, epoch: EpochId, app: &str, sdk: &str) -> Result<()>;

    /// Usage for one epoch, apps in first-recorded order.
    fn usage_map(&self, epoch: EpochId) -> Result<UsageMap>;

    /// Commit all artifacts of an epoch at once. Fails if the epoch was
    /// already committed.
    fn persist_epoch(&self, epoch: EpochId, artifacts: &EpochArtifacts) -> Result<()>;

    /// Add returned topics to an already committed epoch. Callers that
    /// already have a topic for that epoch keep it.
    fn persist_returned_topics(&self, epoch: EpochId, topics: &ReturnedTopics) -> Result<()>;

    fn classification(&self, epoch: EpochId) -> Result<ClassificationMap>;

    /// Stored top topics for one epoch, slot order preserved. Empty when
    /// the epoch has none.
    fn top_topics(&self, epoch: EpochId) -> Result<Vec<Topic>>;

    /// Union of learner sets over the window.
    fn callers_can_learn(&self, latest: EpochId, lookback: u64) -> Result<CallersCanLearnMap>;

    /// Returned topics per epoch over the window. Epochs with no rows are absent.
    fn returned_topics(
        &self,
        latest: EpochId,
        lookback: u64,
    ) -> Result<BTreeMap<EpochId, ReturnedTopics>>;

    /// Distinct apps present in the app usage history, any epoch.
    fn apps_with_usage_history(&self) -> Result<BTreeSet<String>>;

    /// Distinct apps with at least one returned topic, any epoch.
    fn apps_with_returned_topics(&self) -> Result<BTreeSet<String>>;

    /// Delete every derived row for `apps` across all epochs: classification,
    /// usage history, app usage history, learner entries naming the app, and
    /// returned topics. Unknown apps are ignored.
    fn purge_apps(&self, apps: &[String]) -> Result<()>;

    /// Committed epochs, oldest first.
    fn committed_epochs(&self) -> Result<Vec<EpochId>>;
}

/// The OS view of which apps are installed right now.
pub trait InstalledApps {
    fn installed_apps(&self) -> Result<HashSet<String>>;
}

impl InstalledApps for HashSet<String> {
    fn installed_apps(&self) -> Result<HashSet<String>> {
        Ok(self.clone())
    }
}

impl InstalledApps for BTreeSet<String> {
    fn installed_apps(&self) -> Result<HashSet<String>> {
        Ok(self.iter().cloned().collect())
    }
}

impl InstalledApps for [String] {
    fn installed_apps(&self) -> Result<HashSet<String>> {
        Ok(self.iter().cloned().collect())
    }
}

impl InstalledApps for Vec<String> {
    fn installed_apps(&self) -> Result<HashSet<String>> {
        self.as_slice().installed_apps()
    }
}

/// Window `(latest - lookback, latest]` as an inclusive range, clamped at 0.
pub fn epoch_window(latest: EpochId, lookback: u64) -> std::ops::RangeInclusive<EpochId> {
    let first = (latest + 1).saturating_sub(lookback);
    first..=latest
}
