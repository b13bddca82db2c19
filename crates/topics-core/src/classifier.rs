//! Classification of active apps into topics.
//!
//! The engine only depends on the [`Classifier`] trait. The bundled
//! [`PrecomputedClassifier`] answers from a lookup table shipped with the
//! taxonomy and pads the ranked list with random taxonomy labels.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TopicsError};
use crate::random::RandomSource;
use crate::types::{ClassificationMap, Topic};

pub trait Classifier: Send + Sync {
    /// Topics for each app. Every requested app appears in the result,
    /// possibly with an empty list.
    fn classify(&self, apps: &[String]) -> Result<ClassificationMap>;

    /// Ranked genuine topics followed by padding, exactly
    /// `number_of_top_topics + number_of_random_topics` long, or empty when
    /// nothing could be classified.
    fn top_topics(
        &self,
        classification: &ClassificationMap,
        number_of_top_topics: usize,
        number_of_random_topics: usize,
    ) -> Result<Vec<Topic>>;
}

/// Taxonomy labels plus precomputed app → label assignments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierAssets {
    pub taxonomy_version: i64,
    pub model_version: i64,
    /// Every valid topic id in the taxonomy, in taxonomy order.
    pub labels: Vec<i32>,
    #[serde(default)]
    pub apps: HashMap<String, Vec<i32>>,
}

impl ClassifierAssets {
    fn topic(&self, id: i32) -> Topic {
        Topic::new(id, self.taxonomy_version, self.model_version)
    }
}

pub struct PrecomputedClassifier<R> {
    assets: ClassifierAssets,
    valid_labels: HashSet<i32>,
    random: Mutex<R>,
}

impl<R: RandomSource> PrecomputedClassifier<R> {
    pub fn new(assets: ClassifierAssets, random: R) -> Self {
        let valid_labels = assets.labels.iter().copied().collect();
        Self {
            assets,
            valid_labels,
            random: Mutex::new(random),
        }
    }

    pub fn assets(&self) -> &ClassifierAssets {
        &self.assets
    }

    /// Draw a taxonomy label not yet in `chosen`. Rejection sampling keeps
    /// the draw uniform; after too many collisions it probes forward from
    /// the last draw so the loop always ends.
    fn draw_padding(&self, random: &mut R, chosen: &HashSet<Topic>) -> Result<Topic> {
        let labels = &self.assets.labels;
        let available = labels
            .iter()
            .filter(|&&l| !chosen.contains(&self.assets.topic(l)))
            .count();
        if available == 0 {
            return Err(TopicsError::invalid_argument(format!(
                "taxonomy of {} labels cannot supply another distinct padding topic",
                labels.len()
            )));
        }

        let bound = labels.len() as u32;
        let max_attempts = labels.len() * 4;
        let mut idx = 0;
        for _ in 0..max_attempts {
            idx = random.next_below(bound) as usize;
            let topic = self.assets.topic(labels[idx]);
            if !chosen.contains(&topic) {
                return Ok(topic);
            }
        }

        (1..=labels.len())
            .map(|step| self.assets.topic(labels[(idx + step) % labels.len()]))
            .find(|t| !chosen.contains(t))
            .ok_or_else(|| TopicsError::invalid_argument("no distinct padding topic left"))
    }
}

impl<R: RandomSource> Classifier for PrecomputedClassifier<R> {
    fn classify(&self, apps: &[String]) -> Result<ClassificationMap> {
        let mut classification = ClassificationMap::with_capacity(apps.len());
        for app in apps {
            let topics = self
                .assets
                .apps
                .get(app)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| self.valid_labels.contains(id))
                        .map(|&id| self.assets.topic(id))
                        .collect()
                })
                .unwrap_or_default();
            classification.insert(app.clone(), topics);
        }
        Ok(classification)
    }

    fn top_topics(
        &self,
        classification: &ClassificationMap,
        number_of_top_topics: usize,
        number_of_random_topics: usize,
    ) -> Result<Vec<Topic>> {
        if number_of_top_topics == 0 || number_of_random_topics == 0 {
            return Err(TopicsError::invalid_argument(format!(
                "need at least one top and one random topic, got {number_of_top_topics} and {number_of_random_topics}"
            )));
        }

        let mut counts: HashMap<Topic, usize> = HashMap::new();
        for topics in classification.values() {
            for topic in topics {
                *counts.entry(*topic).or_default() += 1;
            }
        }
        if counts.is_empty() {
            return Ok(Vec::new());
        }

        let mut ranked: Vec<(Topic, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut top: Vec<Topic> = ranked
            .into_iter()
            .take(number_of_top_topics)
            .map(|(t, _)| t)
            .collect();
        let mut chosen: HashSet<Topic> = top.iter().copied().collect();

        let mut random = self.random.lock().unwrap_or_else(PoisonError::into_inner);

        // Too few genuine topics: fill the genuine slots from the taxonomy.
        while top.len() < number_of_top_topics + number_of_random_topics {
            let topic = self.draw_padding(&mut random, &chosen)?;
            chosen.insert(topic);
            top.push(topic);
        }

        Ok(top)
    }
}
