// Racing writers against the threshold store and the feature cache.

use ndarray::Array2;
use phenocount::cache::{FeatureCache, PutOutcome};
use phenocount::channels::ChannelTable;
use phenocount::config::EngineConfig;
use phenocount::intensity::IntensityTable;
use phenocount::matcher::PhenotypeCriterion;
use phenocount::pipeline::{FeaturePipeline, FeatureRequest, SampleJob};
use phenocount::threshold::{ThresholdStore, ThresholdUpdate};
use phenocount::types::{ChannelId, FeatureId, FeatureValue, SampleId};
use std::sync::{Arc, Barrier};
use std::thread;

const WRITERS: usize = 16;

#[test]
fn racing_puts_store_exactly_one_value() {
    let cache = Arc::new(FeatureCache::new());
    let barrier = Arc::new(Barrier::new(WRITERS));

    let outcomes: Vec<(u64, PutOutcome)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS as u64)
            .map(|count| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                scope.spawn(move || {
                    barrier.wait();
                    let outcome = cache.put(FeatureValue {
                        feature: FeatureId::from("CD15+"),
                        sample: SampleId::from("WCM1"),
                        count,
                    });
                    (count, outcome)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let stored: Vec<u64> = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == PutOutcome::Stored)
        .map(|(count, _)| *count)
        .collect();
    assert_eq!(stored.len(), 1, "exactly one writer may win");
    let winner = stored[0];

    for (count, outcome) in &outcomes {
        if let Some(conflict) = outcome.conflict() {
            assert_eq!(conflict.existing.count, winner);
            assert_eq!(conflict.attempted.count, *count);
        }
    }
    assert_eq!(
        cache
            .get(&FeatureId::from("CD15+"), &SampleId::from("WCM1"))
            .map(|v| v.count),
        Some(winner)
    );
}

#[test]
fn late_commit_from_an_older_run_is_stale() {
    let store = ThresholdStore::new(1e-6);
    let sample = SampleId::from("WCM1");
    let channel = ChannelId::from("CD15");

    let older = store.begin_run(&sample, &channel);
    let newer = store.begin_run(&sample, &channel);
    assert!(newer.generation() > older.generation());

    assert_eq!(
        store.commit(newer, 29.64304469917444, "newer").unwrap(),
        ThresholdUpdate::Inserted
    );
    match store.commit(older, 30.515562807722702, "older").unwrap() {
        ThresholdUpdate::Stale { current, discarded } => {
            assert_eq!(current.value, 29.64304469917444);
            assert_eq!(discarded, 30.515562807722702);
        }
        other => panic!("expected a stale write, got {other:?}"),
    }
    assert_eq!(store.get(&sample, &channel).unwrap().value, 29.64304469917444);
}

#[test]
fn concurrent_runs_leave_the_newest_value() {
    let store = Arc::new(ThresholdStore::new(1e-6));
    let sample = SampleId::from("WCM1");
    let channel = ChannelId::from("CD15");

    let generations: Vec<u64> = thread::scope(|scope| {
        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let store = store.clone();
                let sample = sample.clone();
                let channel = channel.clone();
                scope.spawn(move || {
                    let ticket = store.begin_run(&sample, &channel);
                    let generation = ticket.generation();
                    store.commit(ticket, i as f64, format!("run-{i}")).unwrap();
                    generation
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let newest = generations.iter().copied().max().unwrap();
    assert_eq!(newest, WRITERS as u64);
    let current = store.get(&sample, &channel).unwrap();
    assert_eq!(current.provenance.generation, newest);
}

fn sample_table(name: &str, offset: usize) -> IntensityTable {
    let cells = 5000;
    let values = Array2::from_shape_fn((cells, 2), |(cell, column)| {
        ((cell * (column + 7) + offset) % 100) as f64
    });
    IntensityTable::new(
        SampleId::from(name),
        vec![ChannelId::from("CD3"), ChannelId::from("CD15")],
        values,
        cells,
    )
    .unwrap()
}

#[test]
fn parallel_samples_match_sequential_results() {
    let channels = Arc::new(
        ChannelTable::new(1, ["CD3", "CD15"].into_iter().map(ChannelId::from)).unwrap(),
    );
    let samples: Vec<IntensityTable> = (0..8)
        .map(|i| sample_table(&format!("WCM{i}"), i * 13))
        .collect();

    let store = Arc::new(ThresholdStore::new(1e-6));
    for table in &samples {
        store.record(table.sample(), &ChannelId::from("CD3"), 40.0, "fixed").unwrap();
        store.record(table.sample(), &ChannelId::from("CD15"), 55.5, "fixed").unwrap();
    }

    let request = FeatureRequest::new(PhenotypeCriterion::new(
        [ChannelId::from("CD15")],
        [ChannelId::from("CD3")],
    ));
    let config = EngineConfig::default();

    let parallel = FeaturePipeline::new(
        channels.clone(),
        &config,
        store.clone(),
        Arc::new(FeatureCache::new()),
    );
    let jobs: Vec<SampleJob<'_>> = samples
        .iter()
        .map(|table| SampleJob {
            request: &request,
            table,
        })
        .collect();
    let parallel_counts: Vec<u64> = parallel
        .compute_many(&jobs)
        .into_iter()
        .map(|r| r.unwrap().value.count)
        .collect();

    let sequential = FeaturePipeline::new(channels, &config, store, Arc::new(FeatureCache::new()));
    let sequential_counts: Vec<u64> = samples
        .iter()
        .map(|table| sequential.compute(&request, table).unwrap().value.count)
        .collect();

    assert_eq!(parallel_counts, sequential_counts);
    assert_eq!(parallel.cache().len(), samples.len());
}
