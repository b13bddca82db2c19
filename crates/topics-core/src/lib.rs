//! Epoch-based interest topics engine.
//!
//! Once per epoch the engine classifies the apps that asked for topics,
//! picks the top topics plus random padding, decides which callers may
//! learn each topic and assigns one topic per caller. Assignments from
//! recent epochs are served from an in-memory lookback cache, and data for
//! uninstalled apps is purged.
//!
//! No I/O here: storage, classification, time and randomness all come in
//! through traits. `topics-store` supplies the SQLite adapter.

pub mod app_update;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod epoch;
pub mod error;
pub mod memory;
pub mod port;
pub mod random;
pub mod time;
pub mod types;
pub mod worker;

pub use app_update::{AppUpdateManager, select_assigned_topic};
pub use cache::CacheManager;
pub use classifier::{Classifier, ClassifierAssets, PrecomputedClassifier};
pub use config::{ConfigSource, TopicsConfig};
pub use epoch::{
    EpochManager, EpochSummary, compute_callers_can_learn_map, compute_returned_topics,
    select_random_topic,
};
pub use error::{BoxError, Result, TopicsError};
pub use memory::MemoryStore;
pub use port::{InstalledApps, TopicsStore, epoch_window};
pub use random::{RandomSource, RngSource, SequenceRandom};
pub use time::{Clock, ManualClock, SystemClock, epoch_at, millis_to_iso8601};
pub use types::{
    Caller, CallersCanLearnMap, ClassificationMap, EpochArtifacts, EpochId, ReturnedTopics, Topic,
    UsageMap,
};
pub use worker::{MaintenanceReport, TopicsWorker};
