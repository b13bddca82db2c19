use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Epoch identifier. Epochs start at 0 and only move forward.
pub type EpochId = u64;

/// appId → classification topics for one epoch.
pub type ClassificationMap = HashMap<String, Vec<Topic>>;

/// Topic → caller identifiers (app id or sdk id) allowed to learn it.
pub type CallersCanLearnMap = HashMap<Topic, HashSet<String>>;

/// Caller → topic assigned for one epoch.
pub type ReturnedTopics = HashMap<Caller, Topic>;

/// A classification label together with the taxonomy and model that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub topic: i32,
    pub taxonomy_version: i64,
    pub model_version: i64,
}

impl Topic {
    pub fn new(topic: i32, taxonomy_version: i64, model_version: i64) -> Self {
        Self {
            topic,
            taxonomy_version,
            model_version,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (taxonomy v{}, model v{})",
            self.topic, self.taxonomy_version, self.model_version
        )
    }
}

/// An (app, sdk) pair. An empty sdk means the app called directly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Caller {
    pub app: String,
    pub sdk: String,
}

impl Caller {
    pub fn new(app: impl Into<String>, sdk: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            sdk: sdk.into(),
        }
    }

    pub fn app_only(app: impl Into<String>) -> Self {
        Self::new(app, "")
    }

    pub fn is_app_only(&self) -> bool {
        self.sdk.is_empty()
    }

    /// Identifier checked against learner sets: the sdk, or the app when
    /// the app called directly.
    pub fn learner_id(&self) -> &str {
        learner_id(&self.app, &self.sdk)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sdk.is_empty() {
            write!(f, "{}", self.app)
        } else {
            write!(f, "{}/{}", self.app, self.sdk)
        }
    }
}

pub(crate) fn learner_id<'a>(app: &'a str, sdk: &'a str) -> &'a str {
    if sdk.is_empty() { app } else { sdk }
}

/// Apps active in one epoch with the sdks they called through.
///
/// Apps iterate in the order they were first recorded. Random topic
/// draws consume the injected random source in this order, so it must
/// survive the round trip through storage.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UsageMap {
    entries: Vec<AppUsage>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppUsage {
    pub app: String,
    pub sdks: Vec<String>,
}

impl UsageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a usage fact. Duplicates are ignored.
    pub fn record(&mut self, app: &str, sdk: &str) {
        let idx = match self.index.get(app) {
            Some(&idx) => idx,
            None => {
                self.entries.push(AppUsage {
                    app: app.to_string(),
                    sdks: Vec::new(),
                });
                let idx = self.entries.len() - 1;
                self.index.insert(app.to_string(), idx);
                idx
            }
        };
        let sdks = &mut self.entries[idx].sdks;
        if !sdks.iter().any(|s| s == sdk) {
            sdks.push(sdk.to_string());
        }
    }

    pub fn sdks(&self, app: &str) -> Option<&[String]> {
        self.index
            .get(app)
            .map(|&idx| self.entries[idx].sdks.as_slice())
    }

    pub fn contains_app(&self, app: &str) -> bool {
        self.index.contains_key(app)
    }

    /// App ids in insertion order.
    pub fn app_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.app.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|e| (e.app.as_str(), e.sdks.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for UsageMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for UsageMap {}

impl<A: AsRef<str>, S: AsRef<str>> FromIterator<(A, S)> for UsageMap {
    fn from_iter<I: IntoIterator<Item = (A, S)>>(iter: I) -> Self {
        let mut usage = UsageMap::new();
        for (app, sdk) in iter {
            usage.record(app.as_ref(), sdk.as_ref());
        }
        usage
    }
}

/// Everything `process_epoch` derives for one epoch, persisted together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpochArtifacts {
    pub classification: ClassificationMap,
    pub callers_can_learn: CallersCanLearnMap,
    pub top_topics: Vec<Topic>,
    /// How many leading entries of `top_topics` are genuine; the rest are padding.
    pub number_of_top_topics: usize,
    pub returned_topics: ReturnedTopics,
    /// Epochs strictly before this one are deleted in the same commit.
    pub delete_before: Option<EpochId>,
}
