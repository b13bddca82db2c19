use serde::{Deserialize, Serialize};

use crate::error::{Result, TopicsError};

/// Genuine (classifier-ranked) topics per epoch
pub const DEFAULT_NUMBER_OF_TOP_TOPICS: usize = 5;

/// Padding topics appended after the genuine ones
pub const DEFAULT_NUMBER_OF_RANDOM_TOPICS: usize = 1;

/// Committed epochs consulted when serving topics
pub const DEFAULT_NUMBER_OF_LOOKBACK_EPOCHS: u64 = 3;

/// Chance (out of 100) that an assignment picks a padding topic
pub const DEFAULT_PERCENTAGE_FOR_RANDOM_TOPIC: u32 = 5;

/// Epochs of history kept before garbage collection
pub const DEFAULT_EPOCHS_TO_KEEP_IN_HISTORY: u64 = 3;

/// One week
pub const DEFAULT_EPOCH_PERIOD_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Range of a single assignment draw. `percentage_for_random_topic` is
/// measured against it.
pub const DRAW_RANGE: u32 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub number_of_top_topics: usize,
    pub number_of_random_topics: usize,
    pub number_of_lookback_epochs: u64,
    pub percentage_for_random_topic: u32,
    pub epochs_to_keep_in_history: u64,
    pub epoch_period_ms: u64,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            number_of_top_topics: DEFAULT_NUMBER_OF_TOP_TOPICS,
            number_of_random_topics: DEFAULT_NUMBER_OF_RANDOM_TOPICS,
            number_of_lookback_epochs: DEFAULT_NUMBER_OF_LOOKBACK_EPOCHS,
            percentage_for_random_topic: DEFAULT_PERCENTAGE_FOR_RANDOM_TOPIC,
            epochs_to_keep_in_history: DEFAULT_EPOCHS_TO_KEEP_IN_HISTORY,
            epoch_period_ms: DEFAULT_EPOCH_PERIOD_MS,
        }
    }
}

impl TopicsConfig {
    /// Exact length every top-topics list must have.
    pub fn top_topics_len(&self) -> usize {
        self.number_of_top_topics + self.number_of_random_topics
    }

    pub fn validate(&self) -> Result<()> {
        if self.number_of_top_topics == 0 {
            return Err(TopicsError::Config(
                "number_of_top_topics must be at least 1".to_string(),
            ));
        }
        if self.number_of_random_topics == 0 {
            return Err(TopicsError::Config(
                "number_of_random_topics must be at least 1".to_string(),
            ));
        }
        if self.number_of_lookback_epochs == 0 {
            return Err(TopicsError::Config(
                "number_of_lookback_epochs must be at least 1".to_string(),
            ));
        }
        if self.percentage_for_random_topic > DRAW_RANGE {
            return Err(TopicsError::Config(format!(
                "percentage_for_random_topic must be at most {DRAW_RANGE}, got {}",
                self.percentage_for_random_topic
            )));
        }
        if self.epoch_period_ms == 0 {
            return Err(TopicsError::Config(
                "epoch_period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where configuration comes from. Components call `load` at the start of
/// every operation and never keep the result across calls.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<TopicsConfig>;
}

impl ConfigSource for TopicsConfig {
    fn load(&self) -> Result<TopicsConfig> {
        self.validate()?;
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TopicsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.top_topics_len(), 6);
    }

    #[test]
    fn test_rejects_zero_counts() {
        let config = TopicsConfig {
            number_of_top_topics: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TopicsError::Config(_))));

        let config = TopicsConfig {
            number_of_random_topics: 0,
            ..Default::default()
        };
        assert!(config.load().is_err());
    }

    #[test]
    fn test_rejects_percentage_over_range() {
        let config = TopicsConfig {
            percentage_for_random_topic: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: TopicsConfig =
            serde_json::from_str(r#"{"number_of_top_topics": 3}"#).unwrap();
        assert_eq!(config.number_of_top_topics, 3);
        assert_eq!(config.number_of_random_topics, DEFAULT_NUMBER_OF_RANDOM_TOPICS);
        assert_eq!(config.epoch_period_ms, DEFAULT_EPOCH_PERIOD_MS);
    }
}
