//! SQLite persistence and TOML-file configuration for `topics-core`.

pub mod config_file;
pub mod error;
pub mod schema;
pub mod store;

pub use config_file::{TomlConfigFile, load_classifier_assets};
pub use error::{Result, StoreError};
pub use store::SqliteStore;
