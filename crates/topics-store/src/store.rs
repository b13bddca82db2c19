use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row, params};

use topics_core::port::epoch_window;
use topics_core::{
    Caller, CallersCanLearnMap, ClassificationMap, Clock, EpochArtifacts, EpochId, ReturnedTopics,
    SystemClock, Topic, TopicsStore, UsageMap, epoch_at, millis_to_iso8601,
};

use crate::error::{Result, StoreError};
use crate::schema;

const EPOCH_ORIGIN_KEY: &str = "epoch_origin_ms";

/// SQLite-backed [`TopicsStore`]. One connection guarded by a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::InvalidData("connection lock poisoned".to_string()))
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Fold the WAL back into the main database file and truncate it.
    pub fn checkpoint_truncate(&self) -> Result<()> {
        self.conn()?
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Milliseconds since the Unix epoch at which epoch 0 began, if any
    /// epoch id was ever requested.
    pub fn epoch_origin(&self) -> Result<Option<u64>> {
        self.get_metadata(EPOCH_ORIGIN_KEY)?
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| StoreError::InvalidData(format!("bad epoch origin {v:?}: {e}")))
            })
            .transpose()
    }

    // --- Epochs ---

    pub fn epoch_id(&self, epoch_period_ms: u64) -> Result<EpochId> {
        let now = self.clock.now_millis();
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
            params![EPOCH_ORIGIN_KEY, now.to_string()],
        )?;
        let origin: String = conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [EPOCH_ORIGIN_KEY],
            |row| row.get(0),
        )?;
        let origin = origin
            .parse::<u64>()
            .map_err(|e| StoreError::InvalidData(format!("bad epoch origin {origin:?}: {e}")))?;
        Ok(epoch_at(origin, now, epoch_period_ms))
    }

    pub fn insert_usage(&self, epoch: EpochId, app: &str, sdk: &str) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO usage_history (epoch, app, sdk) VALUES (?1, ?2, ?3)",
            params![to_sql(epoch)?, app, sdk],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO app_usage_history (epoch, app) VALUES (?1, ?2)",
            params![to_sql(epoch)?, app],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_usage(&self, epoch: EpochId) -> Result<UsageMap> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT app, sdk FROM usage_history WHERE epoch = ?1 ORDER BY id")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([to_sql(epoch)?], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows.into_iter().collect())
    }

    pub fn save_epoch(&self, epoch: EpochId, artifacts: &EpochArtifacts) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let key = to_sql(epoch)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO epochs (epoch, number_of_top_topics, committed_at)
             VALUES (?1, ?2, ?3)",
            params![
                key,
                artifacts.number_of_top_topics as i64,
                millis_to_iso8601(self.clock.now_millis()),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::EpochCommitted(epoch));
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO app_classification_topics
                 (epoch, app, position, topic, taxonomy_version, model_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (app, topics) in &artifacts.classification {
                if topics.is_empty() {
                    // keeps apps that classified to nothing
                    insert.execute(params![key, app, -1, None::<i32>, None::<i64>, None::<i64>])?;
                }
                for (position, t) in topics.iter().enumerate() {
                    insert.execute(params![
                        key,
                        app,
                        position as i64,
                        t.topic,
                        t.taxonomy_version,
                        t.model_version
                    ])?;
                }
            }
        }

        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO caller_can_learn_topics
                 (epoch, topic, taxonomy_version, model_version, caller)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (t, callers) in &artifacts.callers_can_learn {
                for caller in callers {
                    insert.execute(params![
                        key,
                        t.topic,
                        t.taxonomy_version,
                        t.model_version,
                        caller
                    ])?;
                }
            }
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO top_topics
                 (epoch, slot, topic, taxonomy_version, model_version, is_padding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (slot, t) in artifacts.top_topics.iter().enumerate() {
                insert.execute(params![
                    key,
                    slot as i64,
                    t.topic,
                    t.taxonomy_version,
                    t.model_version,
                    slot >= artifacts.number_of_top_topics,
                ])?;
            }
        }

        insert_returned(&tx, key, &artifacts.returned_topics)?;

        if let Some(cutoff) = artifacts.delete_before {
            delete_rows_before(&tx, to_sql(cutoff)?)?;
        }

        tx.commit()?;
        tracing::debug!(epoch, "epoch artifacts written");
        Ok(())
    }

    pub fn save_returned_topics(&self, epoch: EpochId, topics: &ReturnedTopics) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        insert_returned(&tx, to_sql(epoch)?, topics)?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_classification(&self, epoch: EpochId) -> Result<ClassificationMap> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT app, topic, taxonomy_version, model_version
             FROM app_classification_topics WHERE epoch = ?1 ORDER BY app, position",
        )?;
        let rows: Vec<(String, Option<Topic>)> = stmt
            .query_map([to_sql(epoch)?], |row| {
                let topic: Option<i32> = row.get(1)?;
                let topic = match topic {
                    Some(id) => Some(Topic::new(id, row.get(2)?, row.get(3)?)),
                    None => None,
                };
                Ok((row.get(0)?, topic))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut classification = ClassificationMap::new();
        for (app, topic) in rows {
            let topics = classification.entry(app).or_default();
            topics.extend(topic);
        }
        Ok(classification)
    }

    pub fn load_top_topics(&self, epoch: EpochId) -> Result<Vec<Topic>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT topic, taxonomy_version, model_version
             FROM top_topics WHERE epoch = ?1 ORDER BY slot",
        )?;
        let topics = stmt
            .query_map([to_sql(epoch)?], |row| topic_at(row, 0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(topics)
    }

    pub fn load_callers_can_learn(
        &self,
        latest: EpochId,
        lookback: u64,
    ) -> Result<CallersCanLearnMap> {
        let window = epoch_window(latest, lookback);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT topic, taxonomy_version, model_version, caller
             FROM caller_can_learn_topics WHERE epoch BETWEEN ?1 AND ?2",
        )?;
        let rows: Vec<(Topic, String)> = stmt
            .query_map(
                params![to_sql(*window.start())?, to_sql(*window.end())?],
                |row| Ok((topic_at(row, 0)?, row.get(3)?)),
            )?
            .collect::<std::result::Result<_, _>>()?;

        let mut can_learn = CallersCanLearnMap::new();
        for (topic, caller) in rows {
            can_learn.entry(topic).or_default().insert(caller);
        }
        Ok(can_learn)
    }

    pub fn load_returned_topics(
        &self,
        latest: EpochId,
        lookback: u64,
    ) -> Result<BTreeMap<EpochId, ReturnedTopics>> {
        let window = epoch_window(latest, lookback);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT epoch, app, sdk, topic, taxonomy_version, model_version
             FROM returned_topics WHERE epoch BETWEEN ?1 AND ?2",
        )?;
        let rows: Vec<(i64, Caller, Topic)> = stmt
            .query_map(
                params![to_sql(*window.start())?, to_sql(*window.end())?],
                |row| {
                    Ok((
                        row.get(0)?,
                        Caller::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                        topic_at(row, 3)?,
                    ))
                },
            )?
            .collect::<std::result::Result<_, _>>()?;

        let mut by_epoch: BTreeMap<EpochId, ReturnedTopics> = BTreeMap::new();
        for (epoch, caller, topic) in rows {
            by_epoch
                .entry(from_sql(epoch)?)
                .or_default()
                .insert(caller, topic);
        }
        Ok(by_epoch)
    }

    pub fn distinct_apps(&self, table: AppTable) -> Result<BTreeSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(match table {
            AppTable::AppUsage => "SELECT DISTINCT app FROM app_usage_history",
            AppTable::Returned => "SELECT DISTINCT app FROM returned_topics",
        })?;
        let apps = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(apps)
    }

    pub fn delete_apps(&self, apps: &[String]) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for app in apps {
            tx.execute("DELETE FROM app_classification_topics WHERE app = ?1", [app])?;
            tx.execute("DELETE FROM usage_history WHERE app = ?1", [app])?;
            tx.execute("DELETE FROM app_usage_history WHERE app = ?1", [app])?;
            tx.execute("DELETE FROM caller_can_learn_topics WHERE caller = ?1", [app])?;
            tx.execute("DELETE FROM returned_topics WHERE app = ?1", [app])?;
        }
        tx.commit()?;
        tracing::debug!(apps = apps.len(), "purged app rows");
        Ok(())
    }

    pub fn epochs(&self) -> Result<Vec<EpochId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT epoch FROM epochs ORDER BY epoch")?;
        let rows: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(from_sql).collect()
    }
}

/// Tables that record which apps the store knows about.
#[derive(Clone, Copy, Debug)]
pub enum AppTable {
    AppUsage,
    Returned,
}

fn insert_returned(conn: &Connection, epoch: i64, topics: &ReturnedTopics) -> Result<()> {
    let mut insert = conn.prepare(
        "INSERT OR IGNORE INTO returned_topics
         (epoch, app, sdk, topic, taxonomy_version, model_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (caller, t) in topics {
        insert.execute(params![
            epoch,
            caller.app,
            caller.sdk,
            t.topic,
            t.taxonomy_version,
            t.model_version
        ])?;
    }
    Ok(())
}

fn delete_rows_before(conn: &Connection, cutoff: i64) -> Result<()> {
    for table in [
        "usage_history",
        "app_usage_history",
        "app_classification_topics",
        "caller_can_learn_topics",
        "top_topics",
        "returned_topics",
        "epochs",
    ] {
        conn.execute(&format!("DELETE FROM {table} WHERE epoch < ?1"), [cutoff])?;
    }
    Ok(())
}

fn topic_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Topic> {
    Ok(Topic::new(
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
    ))
}

fn to_sql(epoch: EpochId) -> Result<i64> {
    i64::try_from(epoch).map_err(|_| StoreError::InvalidData(format!("epoch {epoch} out of range")))
}

fn from_sql(epoch: i64) -> Result<EpochId> {
    EpochId::try_from(epoch)
        .map_err(|_| StoreError::InvalidData(format!("negative epoch {epoch} in database")))
}

impl TopicsStore for SqliteStore {
    fn current_epoch_id(&self, epoch_period_ms: u64) -> topics_core::Result<EpochId> {
        Ok(self.epoch_id(epoch_period_ms)?)
    }

    fn record_usage(&self, epoch: EpochId, app: &str, sdk: &str) -> topics_core::Result<()> {
        Ok(self.insert_usage(epoch, app, sdk)?)
    }

    fn usage_map(&self, epoch: EpochId) -> topics_core::Result<UsageMap> {
        Ok(self.load_usage(epoch)?)
    }

    fn persist_epoch(&self, epoch: EpochId, artifacts: &EpochArtifacts) -> topics_core::Result<()> {
        Ok(self.save_epoch(epoch, artifacts)?)
    }

    fn persist_returned_topics(
        &self,
        epoch: EpochId,
        topics: &ReturnedTopics,
    ) -> topics_core::Result<()> {
        Ok(self.save_returned_topics(epoch, topics)?)
    }

    fn classification(&self, epoch: EpochId) -> topics_core::Result<ClassificationMap> {
        Ok(self.load_classification(epoch)?)
    }

    fn top_topics(&self, epoch: EpochId) -> topics_core::Result<Vec<Topic>> {
        Ok(self.load_top_topics(epoch)?)
    }

    fn callers_can_learn(
        &self,
        latest: EpochId,
        lookback: u64,
    ) -> topics_core::Result<CallersCanLearnMap> {
        Ok(self.load_callers_can_learn(latest, lookback)?)
    }

    fn returned_topics(
        &self,
        latest: EpochId,
        lookback: u64,
    ) -> topics_core::Result<BTreeMap<EpochId, ReturnedTopics>> {
        Ok(self.load_returned_topics(latest, lookback)?)
    }

    fn apps_with_usage_history(&self) -> topics_core::Result<BTreeSet<String>> {
        Ok(self.distinct_apps(AppTable::AppUsage)?)
    }

    fn apps_with_returned_topics(&self) -> topics_core::Result<BTreeSet<String>> {
        Ok(self.distinct_apps(AppTable::Returned)?)
    }

    fn purge_apps(&self, apps: &[String]) -> topics_core::Result<()> {
        Ok(self.delete_apps(apps)?)
    }

    fn committed_epochs(&self) -> topics_core::Result<Vec<EpochId>> {
        Ok(self.epochs()?)
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        let conn = match self.conn.get_mut() {
            Ok(conn) => conn,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!("WAL checkpoint on close failed: {e}");
        }
    }
}
