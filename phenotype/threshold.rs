// ========================================================================================
//
//                   The threshold store: one authoritative cutoff per key
//
// ========================================================================================
//
// A (sample, channel) pair has exactly one current threshold. Every write is made on
// behalf of an optimization run, identified by a ticket whose generation is issued
// under the key's lock. A run may replace the value of any older run, but a run that
// finishes after a newer run has already committed is stale and its value is dropped.
// Replacements that move the value further than the drift tolerance are logged with
// the provenance of both values.

use crate::channels::ChannelTable;
use crate::types::{ChannelId, SampleId, ThresholdRecord};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("no threshold is recorded for channel '{channel}' on sample '{sample}'")]
    MissingThreshold { sample: SampleId, channel: ChannelId },
    #[error("threshold {value} for channel '{channel}' on sample '{sample}' is not finite")]
    NonFiniteValue {
        sample: SampleId,
        channel: ChannelId,
        value: f64,
    },
}

/// Who produced a threshold, when, and for which run.
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub origin: String,
    pub recorded_at: SystemTime,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEntry {
    pub value: f64,
    pub provenance: Provenance,
}

/// Proof that a run was registered for a key. Consumed by [`ThresholdStore::commit`].
#[derive(Debug)]
pub struct RunTicket {
    sample: SampleId,
    channel: ChannelId,
    generation: u64,
}

impl RunTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drift {
    pub delta: f64,
    pub exceeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdUpdate {
    Inserted,
    Replaced { previous: ThresholdEntry, drift: Drift },
    /// A newer run had already committed; the offered value was discarded.
    Stale { current: ThresholdEntry, discarded: f64 },
}

#[derive(Debug, Default)]
struct KeyState {
    issued: u64,
    current: Option<ThresholdEntry>,
}

/// The thresholds of one sample, frozen in channel-table bit order.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSnapshot {
    sample: SampleId,
    table_version: u32,
    channels: Arc<[ChannelId]>,
    values: Vec<f64>,
    generations: Vec<u64>,
}

impl ThresholdSnapshot {
    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn table_version(&self) -> u32 {
        self.table_version
    }

    /// The channel order the values were frozen in.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Threshold values indexed by bit position.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The run generation behind each value, indexed by bit position.
    pub fn generations(&self) -> &[u64] {
        &self.generations
    }
}

#[derive(Debug)]
pub struct ThresholdStore {
    entries: DashMap<(SampleId, ChannelId), KeyState>,
    drift_tolerance: f64,
}

impl ThresholdStore {
    pub fn new(drift_tolerance: f64) -> Self {
        Self {
            entries: DashMap::new(),
            drift_tolerance,
        }
    }

    /// Registers a new run for a key. Later tickets outrank earlier ones.
    pub fn begin_run(&self, sample: &SampleId, channel: &ChannelId) -> RunTicket {
        let mut state = self
            .entries
            .entry((sample.clone(), channel.clone()))
            .or_default();
        state.issued += 1;
        RunTicket {
            sample: sample.clone(),
            channel: channel.clone(),
            generation: state.issued,
        }
    }

    /// Offers the result of a run. The key's lock is held only for the comparison
    /// and the single write.
    pub fn commit(
        &self,
        ticket: RunTicket,
        value: f64,
        origin: impl Into<String>,
    ) -> Result<ThresholdUpdate, ThresholdError> {
        let RunTicket {
            sample,
            channel,
            generation,
        } = ticket;
        if !value.is_finite() {
            return Err(ThresholdError::NonFiniteValue {
                sample,
                channel,
                value,
            });
        }

        let incoming = ThresholdEntry {
            value,
            provenance: Provenance {
                origin: origin.into(),
                recorded_at: SystemTime::now(),
                generation,
            },
        };

        let update = {
            let mut state = self
                .entries
                .entry((sample.clone(), channel.clone()))
                .or_default();
            match state.current.take() {
                None => {
                    state.current = Some(incoming.clone());
                    ThresholdUpdate::Inserted
                }
                Some(current) if current.provenance.generation > generation => {
                    state.current = Some(current.clone());
                    ThresholdUpdate::Stale {
                        current,
                        discarded: value,
                    }
                }
                Some(previous) => {
                    let delta = (value - previous.value).abs();
                    state.current = Some(incoming.clone());
                    ThresholdUpdate::Replaced {
                        drift: Drift {
                            delta,
                            exceeded: delta > self.drift_tolerance,
                        },
                        previous,
                    }
                }
            }
        };

        match &update {
            ThresholdUpdate::Inserted => log::debug!(
                "Threshold for {sample}/{channel} set to {value} by '{}' (run {generation})",
                incoming.provenance.origin
            ),
            ThresholdUpdate::Replaced { previous, drift } if drift.exceeded => log::warn!(
                "Threshold for {sample}/{channel} drifted by {}: {} from '{}' (run {}) replaced by {} from '{}' (run {})",
                drift.delta,
                previous.value,
                previous.provenance.origin,
                previous.provenance.generation,
                value,
                incoming.provenance.origin,
                generation
            ),
            ThresholdUpdate::Replaced { previous, .. } => log::debug!(
                "Threshold for {sample}/{channel} recomputed by '{}' (run {generation}), unchanged within tolerance of {}",
                incoming.provenance.origin,
                previous.value
            ),
            ThresholdUpdate::Stale { current, .. } => log::warn!(
                "Discarding stale threshold {value} for {sample}/{channel} from '{}' (run {generation}); run {} already committed {}",
                incoming.provenance.origin,
                current.provenance.generation,
                current.value
            ),
        }

        Ok(update)
    }

    /// Registers and commits in one step, for thresholds imported from elsewhere.
    pub fn record(
        &self,
        sample: &SampleId,
        channel: &ChannelId,
        value: f64,
        origin: impl Into<String>,
    ) -> Result<ThresholdUpdate, ThresholdError> {
        let ticket = self.begin_run(sample, channel);
        self.commit(ticket, value, origin)
    }

    pub fn get(&self, sample: &SampleId, channel: &ChannelId) -> Option<ThresholdEntry> {
        self.entries
            .get(&(sample.clone(), channel.clone()))
            .and_then(|state| state.current.clone())
    }

    /// Freezes the thresholds a sample needs for every channel in `table`.
    pub fn snapshot(
        &self,
        sample: &SampleId,
        table: &ChannelTable,
    ) -> Result<ThresholdSnapshot, ThresholdError> {
        let mut values = Vec::with_capacity(table.len());
        let mut generations = Vec::with_capacity(table.len());
        for (_, channel) in table.iter() {
            let entry = self
                .get(sample, channel)
                .ok_or_else(|| ThresholdError::MissingThreshold {
                    sample: sample.clone(),
                    channel: channel.clone(),
                })?;
            values.push(entry.value);
            generations.push(entry.provenance.generation);
        }
        Ok(ThresholdSnapshot {
            sample: sample.clone(),
            table_version: table.version(),
            channels: table.layout().clone(),
            values,
            generations,
        })
    }

    /// All current thresholds, in natural sample then channel order.
    pub fn records(&self) -> Vec<ThresholdRecord> {
        let mut records: Vec<ThresholdRecord> = self
            .entries
            .iter()
            .filter_map(|item| {
                let (sample, channel) = item.key();
                item.value().current.as_ref().map(|entry| ThresholdRecord {
                    sample: sample.clone(),
                    channel: channel.clone(),
                    value: entry.value,
                })
            })
            .collect();
        records.sort_by(|a, b| {
            match natord::compare(a.sample.as_str(), b.sample.as_str()) {
                Ordering::Equal => natord::compare(a.channel.as_str(), b.channel.as_str()),
                other => other,
            }
        });
        records
    }
}
