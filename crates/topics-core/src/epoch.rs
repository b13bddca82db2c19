//! Epoch computation: usage → classification → top topics → learner map →
//! per-caller assignment, committed as one artifact set per epoch.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::classifier::Classifier;
use crate::config::{ConfigSource, DRAW_RANGE, TopicsConfig};
use crate::error::{Result, TopicsError};
use crate::port::TopicsStore;
use crate::random::RandomSource;
use crate::types::{
    CallersCanLearnMap, Caller, ClassificationMap, EpochArtifacts, EpochId, ReturnedTopics, Topic,
    UsageMap, learner_id,
};

/// Outcome of one `process_epoch` run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EpochSummary {
    pub epoch: EpochId,
    pub active_apps: usize,
    pub top_topics: Vec<Topic>,
    pub returned_topics: usize,
    /// The classifier produced no top topics, so nobody was assigned one.
    pub skipped: bool,
}

pub struct EpochManager<S, C, R> {
    store: Arc<S>,
    classifier: C,
    random: Mutex<R>,
    config: Arc<dyn ConfigSource>,
}

impl<S, C, R> EpochManager<S, C, R>
where
    S: TopicsStore,
    C: Classifier,
    R: RandomSource,
{
    pub fn new(store: Arc<S>, classifier: C, random: R, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            store,
            classifier,
            random: Mutex::new(random),
            config,
        }
    }

    pub fn current_epoch_id(&self) -> Result<EpochId> {
        let config = self.config.load()?;
        self.store.current_epoch_id(config.epoch_period_ms)
    }

    /// Record that `app` (directly when `sdk` is empty) called for topics
    /// in the current epoch.
    pub fn record_usage(&self, app: &str, sdk: &str) -> Result<()> {
        if app.is_empty() {
            return Err(TopicsError::invalid_argument("app id must not be empty"));
        }
        let epoch = self.current_epoch_id()?;
        tracing::debug!(epoch, app, sdk, "recording usage");
        self.store.record_usage(epoch, app, sdk)
    }

    /// Compute and commit the current epoch. Any classifier or storage
    /// failure aborts the whole epoch.
    pub fn process_epoch(&self) -> Result<EpochSummary> {
        let config = self.config.load()?;
        let epoch = self.store.current_epoch_id(config.epoch_period_ms)?;
        let mut random = self.random.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(epoch, "processing epoch");

        let usage = self.store.usage_map(epoch)?;
        tracing::debug!(epoch, apps = usage.len(), "loaded usage");

        let classification = self.classifier.classify(&usage.app_ids())?;
        tracing::debug!(epoch, apps = classification.len(), "classified apps");

        let callers_can_learn = compute_callers_can_learn_map(&usage, &classification);
        tracing::debug!(epoch, topics = callers_can_learn.len(), "computed learner map");

        let top_topics = self.classifier.top_topics(
            &classification,
            config.number_of_top_topics,
            config.number_of_random_topics,
        )?;

        let delete_before = gc_cutoff(epoch, &config);

        if top_topics.is_empty() {
            tracing::warn!(epoch, "classifier returned no top topics, skipping assignment");
            self.store.persist_epoch(
                epoch,
                &EpochArtifacts {
                    classification,
                    callers_can_learn,
                    number_of_top_topics: config.number_of_top_topics,
                    delete_before,
                    ..Default::default()
                },
            )?;
            return Ok(EpochSummary {
                epoch,
                active_apps: usage.len(),
                top_topics: Vec::new(),
                returned_topics: 0,
                skipped: true,
            });
        }

        // Learners seen earlier in the lookback window still count.
        let mut learners = self
            .store
            .callers_can_learn(epoch, config.number_of_lookback_epochs)?;
        merge_callers_can_learn(&mut learners, &callers_can_learn);

        let returned_topics = compute_returned_topics(
            &learners,
            &usage,
            &top_topics,
            &config,
            &mut *random,
        )?;

        let summary = EpochSummary {
            epoch,
            active_apps: usage.len(),
            top_topics: top_topics.clone(),
            returned_topics: returned_topics.len(),
            skipped: false,
        };

        self.store.persist_epoch(
            epoch,
            &EpochArtifacts {
                classification,
                callers_can_learn,
                top_topics,
                number_of_top_topics: config.number_of_top_topics,
                returned_topics,
                delete_before,
            },
        )?;
        tracing::info!(
            epoch,
            returned = summary.returned_topics,
            "committed epoch"
        );
        Ok(summary)
    }
}

/// First epoch kept once `epoch` commits. `None` while nothing is old enough.
fn gc_cutoff(epoch: EpochId, config: &TopicsConfig) -> Option<EpochId> {
    let cutoff = epoch
        .checked_sub(config.epochs_to_keep_in_history)
        .filter(|cutoff| *cutoff > 0)?;
    tracing::debug!(epoch, cutoff, "outdated epoch data will be deleted");
    Some(cutoff)
}

fn merge_callers_can_learn(into: &mut CallersCanLearnMap, from: &CallersCanLearnMap) {
    for (topic, callers) in from {
        into.entry(*topic)
            .or_default()
            .extend(callers.iter().cloned());
    }
}

/// Topic → callers allowed to learn it. Each topic of an app is learnable
/// by the app itself (if it called directly) and by every sdk it called
/// through.
pub fn compute_callers_can_learn_map(
    usage: &UsageMap,
    classification: &ClassificationMap,
) -> CallersCanLearnMap {
    let mut can_learn = CallersCanLearnMap::new();

    for (app, topics) in classification {
        let Some(sdks) = usage.sdks(app) else {
            tracing::debug!(app = app.as_str(), "classified app has no usage, skipping");
            continue;
        };
        for topic in topics {
            let learners = can_learn.entry(*topic).or_default();
            for sdk in sdks {
                learners.insert(learner_id(app, sdk).to_string());
            }
        }
    }

    can_learn
}

/// Assign one drawn topic per app, in usage order, then keep only the
/// (app, sdk) pairs whose caller may learn that topic.
///
/// Exactly one draw is taken per app regardless of how many sdks it has,
/// so all sdks of an app see the same topic within an epoch.
pub fn compute_returned_topics(
    callers_can_learn: &CallersCanLearnMap,
    usage: &UsageMap,
    top_topics: &[Topic],
    config: &TopicsConfig,
    random: &mut impl RandomSource,
) -> Result<ReturnedTopics> {
    check_top_topics_len(top_topics, config)?;

    let mut returned = ReturnedTopics::new();
    for (app, sdks) in usage.iter() {
        let topic = select_random_topic(top_topics, config, random)?;
        let Some(learners) = callers_can_learn.get(&topic) else {
            continue;
        };
        for sdk in sdks {
            if learners.contains(learner_id(app, sdk)) {
                tracing::trace!(app, sdk, topic = topic.topic, "returning topic");
                returned.insert(Caller::new(app, sdk.as_str()), topic);
            }
        }
    }

    Ok(returned)
}

/// Draw one topic. A draw in `[0, 100)` below the configured percentage
/// lands on a padding slot, anything else on a genuine slot.
pub fn select_random_topic(
    top_topics: &[Topic],
    config: &TopicsConfig,
    random: &mut impl RandomSource,
) -> Result<Topic> {
    check_top_topics_len(top_topics, config)?;

    let top = config.number_of_top_topics;
    let padding = config.number_of_random_topics;
    let draw = random.next_below(DRAW_RANGE);

    let use_padding = (draw < config.percentage_for_random_topic && padding > 0) || top == 0;
    let idx = if use_padding {
        top + draw as usize % padding
    } else {
        draw as usize % top
    };
    Ok(top_topics[idx])
}

pub(crate) fn check_top_topics_len(top_topics: &[Topic], config: &TopicsConfig) -> Result<()> {
    let expected = config.top_topics_len();
    if expected == 0 || top_topics.len() != expected {
        return Err(TopicsError::invalid_argument(format!(
            "expected {expected} top topics, got {}",
            top_topics.len()
        )));
    }
    Ok(())
}
