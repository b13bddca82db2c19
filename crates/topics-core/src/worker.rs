//! Single entry point wiring the epoch engine, the lookback cache and the
//! app reconciler over one shared store.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use serde::Serialize;

use crate::app_update::AppUpdateManager;
use crate::cache::CacheManager;
use crate::classifier::Classifier;
use crate::config::ConfigSource;
use crate::epoch::{EpochManager, EpochSummary};
use crate::error::Result;
use crate::port::{InstalledApps, TopicsStore};
use crate::random::{RandomSource, RngSource};
use crate::types::{EpochId, Topic};

/// What one maintenance pass did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub purged_apps: BTreeSet<String>,
    pub installed_apps: BTreeSet<String>,
    /// `None` when the current epoch had already been computed.
    pub epoch: Option<EpochSummary>,
    pub cached_callers: usize,
}

pub struct TopicsWorker<S, C, R> {
    store: Arc<S>,
    config: Arc<dyn ConfigSource>,
    epochs: EpochManager<S, C, R>,
    cache: CacheManager<S>,
    apps: AppUpdateManager<S, R>,
}

impl<S, C> TopicsWorker<S, C, RngSource<StdRng>>
where
    S: TopicsStore,
    C: Classifier,
{
    /// Production wiring: both random sources seeded from the OS.
    pub fn with_os_rng(store: Arc<S>, classifier: C, config: Arc<dyn ConfigSource>) -> Self {
        Self::new(
            store,
            classifier,
            config,
            RngSource::from_os_rng(),
            RngSource::from_os_rng(),
        )
    }
}

impl<S, C, R> TopicsWorker<S, C, R>
where
    S: TopicsStore,
    C: Classifier,
    R: RandomSource,
{
    pub fn new(
        store: Arc<S>,
        classifier: C,
        config: Arc<dyn ConfigSource>,
        epoch_random: R,
        app_random: R,
    ) -> Self {
        Self {
            epochs: EpochManager::new(
                Arc::clone(&store),
                classifier,
                epoch_random,
                Arc::clone(&config),
            ),
            cache: CacheManager::new(Arc::clone(&store), Arc::clone(&config)),
            apps: AppUpdateManager::new(Arc::clone(&store), app_random, Arc::clone(&config)),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn current_epoch_id(&self) -> Result<EpochId> {
        self.epochs.current_epoch_id()
    }

    /// Whether the current epoch has already been computed.
    pub fn epoch_committed(&self) -> Result<bool> {
        let current = self.current_epoch_id()?;
        Ok(self.store.committed_epochs()?.contains(&current))
    }

    pub fn record_usage(&self, app: &str, sdk: &str) -> Result<()> {
        self.epochs.record_usage(app, sdk)
    }

    /// Compute the current epoch, then refresh the cache.
    pub fn compute_epoch(&self) -> Result<EpochSummary> {
        let summary = self.epochs.process_epoch()?;
        self.cache.load_cache()?;
        Ok(summary)
    }

    pub fn reload_cache(&self) -> Result<()> {
        self.cache.load_cache()
    }

    pub fn get_topics(&self, lookback: usize, app: &str, sdk: &str) -> Vec<Topic> {
        self.cache.get_topics(lookback, app, sdk)
    }

    /// Topics for the caller over the configured lookback. An sdk calling
    /// for a newly installed app first inherits the app's topics.
    pub fn get_topics_default(&self, app: &str, sdk: &str) -> Result<Vec<Topic>> {
        self.assign_topics_to_sdk_for_app_installation(app, sdk)?;
        let lookback = self.config.load()?.number_of_lookback_epochs;
        Ok(self.get_topics(usize::try_from(lookback).unwrap_or(usize::MAX), app, sdk))
    }

    /// Reloads the cache when the sdk was given anything.
    pub fn assign_topics_to_sdk_for_app_installation(&self, app: &str, sdk: &str) -> Result<bool> {
        let assigned = self.apps.assign_topics_to_sdk_for_app_installation(app, sdk)?;
        if assigned {
            self.cache.load_cache()?;
        }
        Ok(assigned)
    }

    pub fn cached_callers(&self) -> usize {
        self.cache.cached_callers()
    }

    pub fn reconcile_uninstalled_apps<I>(&self, installed: &I) -> Result<BTreeSet<String>>
    where
        I: InstalledApps + ?Sized,
    {
        let purged = self.apps.reconcile_uninstalled_apps(installed)?;
        if !purged.is_empty() {
            self.cache.load_cache()?;
        }
        Ok(purged)
    }

    pub fn reconcile_installed_apps<I>(&self, installed: &I) -> Result<BTreeSet<String>>
    where
        I: InstalledApps + ?Sized,
    {
        let handled = self.apps.reconcile_installed_apps(installed)?;
        if !handled.is_empty() {
            self.cache.load_cache()?;
        }
        Ok(handled)
    }

    pub fn delete_app_data(&self, apps: &[String]) -> Result<()> {
        self.apps.delete_app_data(apps)?;
        self.cache.load_cache()
    }

    /// Periodic job: reconcile against the inventory, compute the current
    /// epoch unless it is already committed, reload the cache.
    pub fn run_maintenance<I>(&self, installed: &I) -> Result<MaintenanceReport>
    where
        I: InstalledApps + ?Sized,
    {
        let purged_apps = self.apps.reconcile_uninstalled_apps(installed)?;
        let installed_apps = self.apps.reconcile_installed_apps(installed)?;
        let epoch = if self.epoch_committed()? {
            tracing::debug!("current epoch already committed");
            None
        } else {
            Some(self.epochs.process_epoch()?)
        };
        self.cache.load_cache()?;

        let report = MaintenanceReport {
            purged_apps,
            installed_apps,
            epoch,
            cached_callers: self.cache.cached_callers(),
        };
        tracing::info!(
            computed = report.epoch.as_ref().map(|e| e.epoch),
            purged = report.purged_apps.len(),
            installed = report.installed_apps.len(),
            cached = report.cached_callers,
            "maintenance complete"
        );
        Ok(report)
    }
}
