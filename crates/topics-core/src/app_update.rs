//! Keeps stored topic data in step with the set of installed apps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ConfigSource, DRAW_RANGE, TopicsConfig};
use crate::epoch::check_top_topics_len;
use crate::error::Result;
use crate::port::{InstalledApps, TopicsStore, epoch_window};
use crate::random::RandomSource;
use crate::types::{CallersCanLearnMap, Caller, EpochId, ReturnedTopics, Topic};

pub struct AppUpdateManager<S, R> {
    store: Arc<S>,
    random: Mutex<R>,
    config: Arc<dyn ConfigSource>,
}

impl<S: TopicsStore, R: RandomSource> AppUpdateManager<S, R> {
    pub fn new(store: Arc<S>, random: R, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            store,
            random: Mutex::new(random),
            config,
        }
    }

    /// Purge every app that has stored data but is no longer installed.
    /// Returns the purged apps; a second call with the same inventory
    /// returns an empty set.
    pub fn reconcile_uninstalled_apps<I>(&self, installed: &I) -> Result<BTreeSet<String>>
    where
        I: InstalledApps + ?Sized,
    {
        let installed = installed.installed_apps()?;
        let mut known = self.store.apps_with_usage_history()?;
        known.extend(self.store.apps_with_returned_topics()?);

        let unhandled: BTreeSet<String> = known
            .into_iter()
            .filter(|app| !installed.contains(app))
            .collect();
        if unhandled.is_empty() {
            return Ok(unhandled);
        }

        tracing::info!(apps = unhandled.len(), "purging uninstalled apps");
        let apps: Vec<String> = unhandled.iter().cloned().collect();
        self.delete_app_data(&apps)?;
        Ok(unhandled)
    }

    /// Remove all derived data for `apps` in one storage transaction.
    pub fn delete_app_data(&self, apps: &[String]) -> Result<()> {
        if apps.is_empty() {
            return Ok(());
        }
        tracing::debug!(?apps, "deleting app data");
        self.store.purge_apps(apps)
    }

    /// Give apps installed since the last epochs were computed a topic in
    /// each of those epochs, so they are served immediately. Returns the
    /// apps that were considered.
    pub fn reconcile_installed_apps<I>(&self, installed: &I) -> Result<BTreeSet<String>>
    where
        I: InstalledApps + ?Sized,
    {
        let config = self.config.load()?;
        let installed = installed.installed_apps()?;
        let mut known = self.store.apps_with_usage_history()?;
        known.extend(self.store.apps_with_returned_topics()?);

        let unhandled: BTreeSet<String> = installed
            .into_iter()
            .filter(|app| !known.contains(app))
            .collect();
        if unhandled.is_empty() {
            return Ok(unhandled);
        }

        let current = self.store.current_epoch_id(config.epoch_period_ms)?;
        let Some(latest) = current.checked_sub(1) else {
            return Ok(unhandled);
        };

        let mut usable = Vec::new();
        for epoch in epoch_window(latest, config.number_of_lookback_epochs).rev() {
            let top_topics = self.store.top_topics(epoch)?;
            if top_topics.is_empty() {
                tracing::debug!(epoch, "no top topics, nothing to assign");
                continue;
            }
            if top_topics.len() != config.top_topics_len() {
                tracing::warn!(
                    epoch,
                    stored = top_topics.len(),
                    "stored top topics do not match current config, skipping epoch"
                );
                continue;
            }
            usable.push((epoch, top_topics));
        }

        // Draws go app by app, newest epoch first.
        let mut assigned: BTreeMap<EpochId, ReturnedTopics> = BTreeMap::new();
        let mut random = self.random.lock().unwrap_or_else(PoisonError::into_inner);
        for app in &unhandled {
            for (epoch, top_topics) in &usable {
                let topic = select_assigned_topic(top_topics, &config, &mut *random)?;
                tracing::trace!(epoch, app = app.as_str(), topic = topic.topic, "assigned topic");
                assigned
                    .entry(*epoch)
                    .or_default()
                    .insert(Caller::app_only(app.as_str()), topic);
            }
        }
        for (epoch, topics) in &assigned {
            self.store.persist_returned_topics(*epoch, topics)?;
        }

        tracing::info!(apps = unhandled.len(), "reconciled installed apps");
        Ok(unhandled)
    }

    /// An sdk calling for an app that was given topics at install time
    /// inherits the app's topic in each past epoch where it may learn it.
    /// Returns whether anything was written, so the caller knows the cache
    /// is stale. Sdks that already have a topic in the window are left alone.
    pub fn assign_topics_to_sdk_for_app_installation(&self, app: &str, sdk: &str) -> Result<bool> {
        if sdk.is_empty() {
            return Ok(false);
        }
        let config = self.config.load()?;
        let current = self.store.current_epoch_id(config.epoch_period_ms)?;
        let Some(latest) = current.checked_sub(1) else {
            return Ok(false);
        };
        let lookback = config.number_of_lookback_epochs;

        let past = self.store.returned_topics(latest, lookback)?;
        let app_sdk = Caller::new(app, sdk);
        if past.values().any(|topics| topics.contains_key(&app_sdk)) {
            return Ok(false);
        }

        let app_only = Caller::app_only(app);
        let mut assigned = false;
        for (epoch, topics) in past.iter().rev() {
            let Some(&topic) = topics.get(&app_only) else {
                continue;
            };
            // learners observed before this epoch
            let learners = match epoch.checked_sub(1) {
                Some(previous) => self.store.callers_can_learn(previous, lookback)?,
                None => CallersCanLearnMap::new(),
            };
            let top_topics = self.store.top_topics(*epoch)?;
            if !is_topic_learnable(topic, sdk, &learners, &top_topics, config.number_of_top_topics)
            {
                continue;
            }

            self.store
                .persist_returned_topics(*epoch, &ReturnedTopics::from([(app_sdk.clone(), topic)]))?;
            tracing::debug!(epoch, app, sdk, topic = topic.topic, "sdk inherited app topic");
            assigned = true;
        }
        Ok(assigned)
    }
}

/// Padding topics may be learned by anyone. A genuine topic only by the
/// callers recorded as its learners.
fn is_topic_learnable(
    topic: Topic,
    caller: &str,
    learners: &CallersCanLearnMap,
    top_topics: &[Topic],
    number_of_top_topics: usize,
) -> bool {
    let padding = top_topics
        .iter()
        .rposition(|t| *t == topic)
        .is_some_and(|slot| slot >= number_of_top_topics);
    padding || learners.get(&topic).is_some_and(|callers| callers.contains(caller))
}

/// Draw a topic for a newly installed app: one draw decides padding vs
/// genuine, a second picks the slot within that section.
pub fn select_assigned_topic(
    top_topics: &[Topic],
    config: &TopicsConfig,
    random: &mut impl RandomSource,
) -> Result<Topic> {
    check_top_topics_len(top_topics, config)?;

    let top = config.number_of_top_topics;
    let padding = config.number_of_random_topics;
    let draw = random.next_below(DRAW_RANGE);

    let idx = if (draw < config.percentage_for_random_topic && padding > 0) || top == 0 {
        top + random.next_below(padding as u32) as usize
    } else {
        random.next_below(top as u32) as usize
    };
    Ok(top_topics[idx])
}
