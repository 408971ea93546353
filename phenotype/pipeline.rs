// ========================================================================================
//
//                 The feature pipeline: thresholds -> bitmasks -> count -> cache
//
// ========================================================================================
//
// This module composes the components for the serving layer. One call computes one
// feature for one sample: freeze the sample's thresholds, encode every cell, count the
// cells matching the criterion, and offer the count to the feature cache. Every failure
// aborts only that computation and names the sample, the stage and, when there is one,
// the channel involved. Nothing is retried here.
//
// Samples share no mutable state beyond the threshold store and the feature cache, so
// independent jobs run in parallel on the rayon pool.

use crate::cache::{FeatureCache, PutOutcome};
use crate::channels::ChannelTable;
use crate::config::EngineConfig;
use crate::encode::{BitmaskArray, BitmaskEncoder, EncodeError};
use crate::intensity::IntensityTable;
use crate::matcher::{CompiledCriterion, MatchError, PhenotypeCriterion, PhenotypeMatcher};
use crate::optimize::{OptimizeError, OptimizedThreshold, ThresholdOptimizer};
use crate::threshold::{ThresholdError, ThresholdStore, ThresholdUpdate};
use crate::types::{ChannelId, FeatureId, FeatureValue, SampleId};
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Optimize,
    Threshold,
    Encode,
    Match,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Optimize => "optimize",
            Stage::Threshold => "threshold",
            Stage::Encode => "encode",
            Stage::Match => "match",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

impl StageError {
    /// The channel the failure is about, if it is about one.
    pub fn channel(&self) -> Option<&ChannelId> {
        match self {
            StageError::Threshold(ThresholdError::MissingThreshold { channel, .. })
            | StageError::Threshold(ThresholdError::NonFiniteValue { channel, .. })
            | StageError::Encode(EncodeError::MissingThreshold { channel, .. })
            | StageError::Encode(EncodeError::MissingColumn { channel, .. })
            | StageError::Match(MatchError::UnknownChannel(channel)) => Some(channel),
            StageError::Match(MatchError::ContradictoryCriterion { channels }) => channels.first(),
            _ => None,
        }
    }
}

fn describe_target(feature: &Option<FeatureId>, channel: &Option<ChannelId>) -> String {
    let mut text = String::new();
    if let Some(feature) = feature {
        text.push_str(&format!(", feature '{feature}'"));
    }
    if let Some(channel) = channel {
        text.push_str(&format!(", channel '{channel}'"));
    }
    text
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} stage failed for sample '{sample}'{}: {source}", describe_target(.feature, .channel))]
pub struct PipelineError {
    pub sample: SampleId,
    pub feature: Option<FeatureId>,
    pub channel: Option<ChannelId>,
    pub stage: Stage,
    pub source: StageError,
}

impl PipelineError {
    fn new(
        sample: &SampleId,
        feature: Option<&FeatureId>,
        stage: Stage,
        source: impl Into<StageError>,
    ) -> Self {
        let source = source.into();
        Self {
            sample: sample.clone(),
            feature: feature.cloned(),
            channel: source.channel().cloned(),
            stage,
            source,
        }
    }

    fn with_channel(mut self, channel: &ChannelId) -> Self {
        self.channel = Some(channel.clone());
        self
    }

    fn with_feature(mut self, feature: &FeatureId) -> Self {
        self.feature = Some(feature.clone());
        self
    }
}

/// What the serving layer asks for: a criterion, and optionally the feature id to file
/// the result under.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRequest {
    pub feature: Option<FeatureId>,
    pub criterion: PhenotypeCriterion,
}

impl FeatureRequest {
    pub fn new(criterion: PhenotypeCriterion) -> Self {
        Self {
            feature: None,
            criterion,
        }
    }

    pub fn with_feature(mut self, feature: FeatureId) -> Self {
        self.feature = Some(feature);
        self
    }

    /// The explicit id, or one derived from the criterion's canonical name.
    pub fn feature_id(&self) -> FeatureId {
        self.feature
            .clone()
            .unwrap_or_else(|| FeatureId::new(self.criterion.canonical_name()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureOutcome {
    pub value: FeatureValue,
    pub total_cells: usize,
    pub write: PutOutcome,
}

impl FeatureOutcome {
    pub fn fraction(&self) -> Option<f64> {
        (self.total_cells > 0).then(|| self.value.count as f64 / self.total_cells as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOptimization {
    pub optimized: OptimizedThreshold,
    pub update: ThresholdUpdate,
}

/// One unit of parallel work: a request against one sample's intensities.
#[derive(Debug, Clone, Copy)]
pub struct SampleJob<'a> {
    pub request: &'a FeatureRequest,
    pub table: &'a IntensityTable,
}

pub struct FeaturePipeline {
    channels: Arc<ChannelTable>,
    encoder: BitmaskEncoder,
    matcher: PhenotypeMatcher,
    optimizer: ThresholdOptimizer,
    thresholds: Arc<ThresholdStore>,
    cache: Arc<FeatureCache>,
}

impl FeaturePipeline {
    pub fn new(
        channels: Arc<ChannelTable>,
        config: &EngineConfig,
        thresholds: Arc<ThresholdStore>,
        cache: Arc<FeatureCache>,
    ) -> Self {
        let chunk_size = config.compute.chunk_size;
        Self {
            encoder: BitmaskEncoder::new(channels.clone(), chunk_size),
            matcher: PhenotypeMatcher::new(channels.clone(), chunk_size),
            optimizer: ThresholdOptimizer::new(config.optimizer.clone(), chunk_size),
            channels,
            thresholds,
            cache,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelTable> {
        &self.channels
    }

    pub fn thresholds(&self) -> &ThresholdStore {
        &self.thresholds
    }

    pub fn cache(&self) -> &FeatureCache {
        &self.cache
    }

    /// Runs the optimizer for one channel of one sample and commits the result. The run
    /// is registered before the computation starts, so a run that started later but
    /// finished earlier still outranks this one.
    pub fn optimize_channel(
        &self,
        table: &IntensityTable,
        channel: &ChannelId,
        seeds: &[bool],
        origin: &str,
    ) -> Result<ChannelOptimization, PipelineError> {
        let sample = table.sample();
        let values = table
            .column(channel)
            .ok_or_else(|| {
                PipelineError::new(
                    sample,
                    None,
                    Stage::Optimize,
                    EncodeError::MissingColumn {
                        sample: sample.clone(),
                        channel: channel.clone(),
                    },
                )
            })?
            .to_vec();

        let ticket = self.thresholds.begin_run(sample, channel);
        let optimized = self
            .optimizer
            .optimize(&values, seeds)
            .map_err(|e| PipelineError::new(sample, None, Stage::Optimize, e).with_channel(channel))?;
        let update = self
            .thresholds
            .commit(ticket, optimized.value, origin)
            .map_err(|e| PipelineError::new(sample, None, Stage::Threshold, e))?;

        log::info!(
            "Sample '{sample}', channel '{channel}': threshold {} after {} iterations",
            optimized.value,
            optimized.iterations
        );
        Ok(ChannelOptimization { optimized, update })
    }

    /// Freezes the sample's thresholds and encodes every cell.
    pub fn encode_sample(&self, table: &IntensityTable) -> Result<BitmaskArray, PipelineError> {
        let sample = table.sample();
        let snapshot = self
            .thresholds
            .snapshot(sample, &self.channels)
            .map_err(|e| PipelineError::new(sample, None, Stage::Threshold, e))?;
        self.encoder
            .encode(table, &snapshot)
            .map_err(|e| PipelineError::new(sample, None, Stage::Encode, e))
    }

    pub fn compute(
        &self,
        request: &FeatureRequest,
        table: &IntensityTable,
    ) -> Result<FeatureOutcome, PipelineError> {
        let feature = request.feature_id();
        // A malformed criterion is a caller error and is rejected before any encoding.
        let compiled = self.compile(table.sample(), &feature, &request.criterion)?;
        let bitmasks = self
            .encode_sample(table)
            .map_err(|e| e.with_feature(&feature))?;
        self.count_and_store(feature, &compiled, &bitmasks)
    }

    /// Evaluates several criteria against one sample, encoding its cells once. Each
    /// request succeeds or fails on its own.
    pub fn compute_all(
        &self,
        requests: &[FeatureRequest],
        table: &IntensityTable,
    ) -> Vec<Result<FeatureOutcome, PipelineError>> {
        let bitmasks = match self.encode_sample(table) {
            Ok(bitmasks) => bitmasks,
            Err(err) => {
                return requests
                    .iter()
                    .map(|request| Err(err.clone().with_feature(&request.feature_id())))
                    .collect();
            }
        };
        requests
            .iter()
            .map(|request| {
                let feature = request.feature_id();
                let compiled = self.compile(bitmasks.sample(), &feature, &request.criterion)?;
                self.count_and_store(feature, &compiled, &bitmasks)
            })
            .collect()
    }

    /// Runs independent jobs in parallel. Results come back in job order.
    pub fn compute_many(&self, jobs: &[SampleJob<'_>]) -> Vec<Result<FeatureOutcome, PipelineError>> {
        jobs.par_iter()
            .map(|job| self.compute(job.request, job.table))
            .collect()
    }

    fn compile(
        &self,
        sample: &SampleId,
        feature: &FeatureId,
        criterion: &PhenotypeCriterion,
    ) -> Result<CompiledCriterion, PipelineError> {
        self.matcher
            .compile(criterion)
            .map_err(|e| PipelineError::new(sample, Some(feature), Stage::Match, e))
    }

    fn count_and_store(
        &self,
        feature: FeatureId,
        compiled: &CompiledCriterion,
        bitmasks: &BitmaskArray,
    ) -> Result<FeatureOutcome, PipelineError> {
        let sample = bitmasks.sample();
        let count = self
            .matcher
            .count(compiled, bitmasks)
            .map_err(|e| PipelineError::new(sample, Some(&feature), Stage::Match, e))?;

        let value = FeatureValue {
            feature,
            sample: sample.clone(),
            count,
        };
        let write = self.cache.put(value.clone());
        match &write {
            PutOutcome::Stored => log::info!(
                "Stored feature '{}' for sample '{sample}': {count} of {} cells",
                value.feature,
                bitmasks.len()
            ),
            PutOutcome::AlreadyComputed(conflict) => log::info!(
                "Feature '{}' for sample '{sample}' was already computed ({} stored, {} now)",
                value.feature,
                conflict.existing.count,
                count
            ),
        }

        Ok(FeatureOutcome {
            value,
            total_cells: bitmasks.len(),
            write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn pipeline() -> FeaturePipeline {
        let channels = Arc::new(
            ChannelTable::new(1, ["CD3", "CD15"].into_iter().map(ChannelId::from)).unwrap(),
        );
        FeaturePipeline::new(
            channels,
            &EngineConfig::default(),
            Arc::new(ThresholdStore::new(1e-6)),
            Arc::new(FeatureCache::new()),
        )
    }

    fn table() -> IntensityTable {
        IntensityTable::new(
            SampleId::from("WCM1"),
            vec![ChannelId::from("CD3"), ChannelId::from("CD15")],
            array![[1.0, 31.0], [9.0, 30.0], [9.0, 2.0], [1.0, 1.0]],
            4,
        )
        .unwrap()
    }

    fn cd15_positive() -> FeatureRequest {
        FeatureRequest::new(PhenotypeCriterion::new([ChannelId::from("CD15")], []))
    }

    fn record_thresholds(pipeline: &FeaturePipeline) {
        let sample = SampleId::from("WCM1");
        pipeline
            .thresholds()
            .record(&sample, &ChannelId::from("CD3"), 5.0, "test")
            .unwrap();
        pipeline
            .thresholds()
            .record(&sample, &ChannelId::from("CD15"), 30.0, "test")
            .unwrap();
    }

    #[test]
    fn computes_counts_and_caches_them() {
        let pipeline = pipeline();
        record_thresholds(&pipeline);
        let outcome = pipeline.compute(&cd15_positive(), &table()).unwrap();

        assert_eq!(outcome.value.feature.as_str(), "CD15+");
        assert_eq!(outcome.value.count, 2);
        assert_eq!(outcome.total_cells, 4);
        assert_eq!(outcome.fraction(), Some(0.5));
        assert_eq!(outcome.write, PutOutcome::Stored);
        assert_eq!(
            pipeline
                .cache()
                .get(&FeatureId::from("CD15+"), &SampleId::from("WCM1"))
                .map(|v| v.count),
            Some(2)
        );
    }

    #[test]
    fn missing_threshold_names_stage_and_channel() {
        let pipeline = pipeline();
        pipeline
            .thresholds()
            .record(&SampleId::from("WCM1"), &ChannelId::from("CD15"), 30.0, "test")
            .unwrap();
        let err = pipeline.compute(&cd15_positive(), &table()).unwrap_err();
        assert_eq!(err.stage, Stage::Threshold);
        assert_eq!(err.channel, Some(ChannelId::from("CD3")));
        assert_eq!(err.feature, Some(FeatureId::from("CD15+")));
        assert_eq!(
            err.to_string(),
            "threshold stage failed for sample 'WCM1', feature 'CD15+', channel 'CD3': no threshold is recorded for channel 'CD3' on sample 'WCM1'"
        );
        assert!(pipeline.cache().is_empty());
    }

    #[test]
    fn contradictory_request_fails_before_thresholds_are_read() {
        let pipeline = pipeline();
        let request = FeatureRequest::new(PhenotypeCriterion::new(
            [ChannelId::from("CD15")],
            [ChannelId::from("CD15")],
        ));
        // No thresholds recorded: a threshold-stage error would mean the criterion
        // was not checked first.
        let err = pipeline.compute(&request, &table()).unwrap_err();
        assert_eq!(err.stage, Stage::Match);
        assert!(matches!(
            err.source,
            StageError::Match(MatchError::ContradictoryCriterion { .. })
        ));
    }

    #[test]
    fn compute_all_encodes_once_for_many_criteria() {
        let pipeline = pipeline();
        record_thresholds(&pipeline);
        let requests = vec![
            cd15_positive(),
            FeatureRequest::new(PhenotypeCriterion::default()),
            FeatureRequest::new(PhenotypeCriterion::new(
                [ChannelId::from("CD3")],
                [ChannelId::from("CD15")],
            ))
            .with_feature(FeatureId::from("tumor")),
            FeatureRequest::new(PhenotypeCriterion::new([ChannelId::from("CD8")], [])),
        ];
        let results = pipeline.compute_all(&requests, &table());
        assert_eq!(results[0].as_ref().unwrap().value.count, 2);
        assert_eq!(results[1].as_ref().unwrap().value.count, 4);
        assert_eq!(results[1].as_ref().unwrap().value.feature.as_str(), "all cells");
        assert_eq!(results[2].as_ref().unwrap().value.count, 1);
        assert_eq!(results[2].as_ref().unwrap().value.feature.as_str(), "tumor");
        let err = results[3].as_ref().unwrap_err();
        assert_eq!(err.stage, Stage::Match);
        assert_eq!(err.feature, Some(FeatureId::from("CD8+")));
        assert_eq!(err.channel, Some(ChannelId::from("CD8")));
        assert_eq!(pipeline.cache().len(), 3);
    }

    #[test]
    fn optimized_thresholds_feed_the_store() {
        let pipeline = pipeline();
        let table = table();
        let run = pipeline
            .optimize_channel(
                &table,
                &ChannelId::from("CD15"),
                &[true, true, false, false],
                "optimizer",
            )
            .unwrap();
        assert_eq!(run.update, ThresholdUpdate::Inserted);
        assert_eq!(
            pipeline
                .thresholds()
                .get(&SampleId::from("WCM1"), &ChannelId::from("CD15"))
                .unwrap()
                .value,
            run.optimized.value
        );

        let err = pipeline
            .optimize_channel(&table, &ChannelId::from("CD20"), &[true; 4], "optimizer")
            .unwrap_err();
        assert_eq!(err.stage, Stage::Optimize);
        assert_eq!(err.channel, Some(ChannelId::from("CD20")));
    }
}
