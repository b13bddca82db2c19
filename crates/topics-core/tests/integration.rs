//! End-to-end flow across several epochs:
//! record usage → compute epoch → serve from cache → reconcile apps → maintenance.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use topics_core::{
    ClassifierAssets, ConfigSource, ManualClock, MemoryStore, PrecomputedClassifier, RngSource,
    SequenceRandom, Topic, TopicsConfig, TopicsStore, TopicsWorker,
};

const PERIOD: u64 = 60_000;

type Worker = TopicsWorker<
    MemoryStore,
    PrecomputedClassifier<RngSource<rand::rngs::StdRng>>,
    SequenceRandom,
>;

fn topic(id: i32) -> Topic {
    Topic::new(id, 2, 7)
}

fn assets() -> ClassifierAssets {
    ClassifierAssets {
        taxonomy_version: 2,
        model_version: 7,
        labels: (1..=40).collect(),
        apps: [
            ("app1", vec![1, 2]),
            ("app2", vec![2, 3]),
            ("app3", vec![4]),
            ("app4", vec![5]),
        ]
        .into_iter()
        .map(|(app, ids)| (app.to_string(), ids))
        .collect(),
    }
}

fn setup() -> (Worker, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let config: Arc<dyn ConfigSource> = Arc::new(TopicsConfig {
        epoch_period_ms: PERIOD,
        ..Default::default()
    });
    let worker = TopicsWorker::new(
        store.clone(),
        PrecomputedClassifier::new(assets(), RngSource::seeded(7)),
        config,
        // 10 is never below the 5% padding threshold: always genuine slot 0
        SequenceRandom::new([10]),
        SequenceRandom::new([10, 0]),
    );
    (worker, store, clock)
}

fn apps(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn topics_flow_across_epochs() {
    let (worker, store, clock) = setup();

    // epoch 0
    worker.record_usage("app1", "").unwrap();
    worker.record_usage("app1", "sdk1").unwrap();
    worker.record_usage("app2", "sdk1").unwrap();
    let summary = worker.compute_epoch().unwrap();
    assert_eq!(summary.epoch, 0);
    assert_eq!(summary.active_apps, 2);
    assert_eq!(&summary.top_topics[..3], &[topic(2), topic(1), topic(3)]);
    assert_eq!(summary.top_topics.len(), 6);
    assert_eq!(summary.returned_topics, 3);

    let distinct: HashSet<_> = summary.top_topics.iter().collect();
    assert_eq!(distinct.len(), 6, "padding never repeats a topic");

    // the epoch being computed is not served yet
    assert!(worker.get_topics(3, "app1", "").is_empty());

    // epoch 1
    clock.advance(PERIOD);
    worker.reload_cache().unwrap();
    assert_eq!(worker.get_topics(3, "app1", ""), vec![topic(2)]);
    assert_eq!(worker.get_topics(3, "app1", "sdk1"), vec![topic(2)]);
    assert_eq!(worker.get_topics(3, "app2", "sdk1"), vec![topic(2)]);

    worker.record_usage("app3", "sdk2").unwrap();
    let summary = worker.compute_epoch().unwrap();
    assert_eq!(summary.epoch, 1);
    assert_eq!(summary.top_topics[0], topic(4));

    // epoch 2
    clock.advance(PERIOD);
    worker.record_usage("app1", "").unwrap();
    let summary = worker.compute_epoch().unwrap();
    assert_eq!(summary.epoch, 2);
    assert_eq!(&summary.top_topics[..2], &[topic(1), topic(2)]);

    // epoch 3
    clock.advance(PERIOD);
    worker.reload_cache().unwrap();
    assert_eq!(worker.get_topics(3, "app1", ""), vec![topic(1), topic(2)]);
    assert_eq!(worker.get_topics(1, "app1", ""), vec![topic(1)]);
    assert_eq!(worker.get_topics(3, "app3", "sdk2"), vec![topic(4)]);
    assert_eq!(worker.get_topics_default("app3", "sdk2").unwrap(), vec![topic(4)]);
    assert!(worker.get_topics(3, "app3", "").is_empty());

    let inventory = apps(&["app1", "app3", "app9"]);

    let purged = worker.reconcile_uninstalled_apps(&inventory).unwrap();
    assert_eq!(purged, BTreeSet::from(["app2".to_string()]));
    assert!(worker.get_topics(3, "app2", "sdk1").is_empty());
    assert!(!store.apps_with_usage_history().unwrap().contains("app2"));
    assert!(worker.reconcile_uninstalled_apps(&inventory).unwrap().is_empty());

    let installed = worker.reconcile_installed_apps(&inventory).unwrap();
    assert_eq!(installed, BTreeSet::from(["app9".to_string()]));
    assert_eq!(
        worker.get_topics(3, "app9", ""),
        vec![topic(1), topic(4), topic(2)]
    );
    assert!(worker.reconcile_installed_apps(&inventory).unwrap().is_empty());

    // sdk1 learned topic 1 before epoch 2, so it inherits app9's topic there
    assert_eq!(
        worker.get_topics_default("app9", "sdk1").unwrap(),
        vec![topic(1)]
    );
    assert!(worker.get_topics_default("app9", "sdk2").unwrap().is_empty());

    // epoch 4: nothing recorded, old epochs age out
    clock.advance(PERIOD);
    let report = worker.run_maintenance(&inventory).unwrap();
    assert!(report.purged_apps.is_empty());
    assert!(report.installed_apps.is_empty());
    let epoch = report.epoch.expect("epoch 4 was not computed yet");
    assert_eq!(epoch.epoch, 4);
    assert!(epoch.skipped);

    assert_eq!(store.committed_epochs().unwrap(), vec![1, 2, 4]);
    assert_eq!(worker.get_topics(3, "app9", ""), vec![topic(1), topic(4)]);
    assert_eq!(worker.get_topics(3, "app1", ""), vec![topic(1)]);
    assert!(worker.get_topics(3, "app1", "sdk1").is_empty());
    assert_eq!(worker.cached_callers(), report.cached_callers);

    let again = worker.run_maintenance(&inventory).unwrap();
    assert!(again.epoch.is_none(), "epoch 4 is already committed");
}

#[test]
fn compute_epoch_twice_in_one_epoch_fails() {
    let (worker, _store, _clock) = setup();
    worker.record_usage("app1", "").unwrap();
    worker.compute_epoch().unwrap();
    assert!(worker.epoch_committed().unwrap());
    assert!(worker.compute_epoch().is_err());
}

#[test]
fn unknown_apps_classify_to_nothing() {
    let (worker, store, clock) = setup();
    worker.record_usage("stranger", "sdk1").unwrap();
    let summary = worker.compute_epoch().unwrap();
    assert!(summary.skipped);
    assert!(store.classification(0).unwrap()["stranger"].is_empty());

    clock.advance(PERIOD);
    worker.reload_cache().unwrap();
    assert!(worker.get_topics(3, "stranger", "sdk1").is_empty());
}
