// ========================================================================================
//
//                  The bitmask encoder: dichotomize and pack every cell
//
// ========================================================================================
//
// A pure transform. For every cell and every channel of the channel table, the bit at
// that channel's position is set iff `intensity >= threshold`. Ties are positive: a cell
// whose intensity equals the threshold exactly counts as expressing the marker, and
// every component of the engine uses the same rule.
//
// A channel without a threshold or without an intensity column fails the whole sample.
// No bit is ever left unset for lack of data.

use crate::channels::ChannelTable;
use crate::intensity::IntensityTable;
use crate::threshold::ThresholdSnapshot;
use crate::types::{Bitmask, ChannelId, SampleId};
use ndarray::ArrayView1;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("no threshold for channel '{channel}' on sample '{sample}'")]
    MissingThreshold { sample: SampleId, channel: ChannelId },
    #[error("intensity table for sample '{sample}' has no column for channel '{channel}'")]
    MissingColumn { sample: SampleId, channel: ChannelId },
    #[error("thresholds belong to sample '{found}', but the intensities belong to '{expected}'")]
    SampleMismatch { expected: SampleId, found: SampleId },
    #[error("thresholds were frozen against channel table v{found}, the encoder uses v{expected}")]
    TableVersionMismatch { expected: u32, found: u32 },
    #[error("thresholds were frozen against a different channel order under channel table v{version}")]
    ChannelOrderMismatch { version: u32 },
}

/// Per-cell bitmasks of one sample, tied to the channel table and the threshold
/// generations that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct BitmaskArray {
    sample: SampleId,
    table_version: u32,
    channels: Arc<[ChannelId]>,
    threshold_generations: Vec<u64>,
    masks: Vec<Bitmask>,
}

impl BitmaskArray {
    /// Wraps bitmasks computed elsewhere. They carry no threshold generations.
    pub fn from_raw_masks(sample: SampleId, table: &ChannelTable, masks: Vec<Bitmask>) -> Self {
        Self {
            sample,
            table_version: table.version(),
            channels: table.layout().clone(),
            threshold_generations: Vec::new(),
            masks,
        }
    }

    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    pub fn table_version(&self) -> u32 {
        self.table_version
    }

    /// The channel order the bits follow.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn threshold_generations(&self) -> &[u64] {
        &self.threshold_generations
    }

    pub fn masks(&self) -> &[Bitmask] {
        &self.masks
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// One entry per channel-table bit: which column to read and what to compare it to.
#[derive(Debug, Clone, Copy)]
struct BitPlan {
    bit: u8,
    column: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
pub struct BitmaskEncoder {
    channels: Arc<ChannelTable>,
    chunk_size: usize,
}

impl BitmaskEncoder {
    pub fn new(channels: Arc<ChannelTable>, chunk_size: usize) -> Self {
        Self {
            channels,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn channels(&self) -> &Arc<ChannelTable> {
        &self.channels
    }

    pub fn encode(
        &self,
        table: &IntensityTable,
        snapshot: &ThresholdSnapshot,
    ) -> Result<BitmaskArray, EncodeError> {
        let plan = self.plan(table, snapshot)?;
        let values = table.values();

        let masks: Vec<Bitmask> = (0..table.num_cells())
            .into_par_iter()
            .with_min_len(self.chunk_size)
            .map(|row| encode_cell(values.row(row), &plan))
            .collect();

        log::debug!(
            "Encoded {} cells of sample '{}' across {} channels",
            masks.len(),
            table.sample(),
            plan.len()
        );

        Ok(BitmaskArray {
            sample: table.sample().clone(),
            table_version: self.channels.version(),
            channels: self.channels.layout().clone(),
            threshold_generations: snapshot.generations().to_vec(),
            masks,
        })
    }

    fn plan(
        &self,
        table: &IntensityTable,
        snapshot: &ThresholdSnapshot,
    ) -> Result<Vec<BitPlan>, EncodeError> {
        if snapshot.sample() != table.sample() {
            return Err(EncodeError::SampleMismatch {
                expected: table.sample().clone(),
                found: snapshot.sample().clone(),
            });
        }
        if snapshot.table_version() != self.channels.version() {
            return Err(EncodeError::TableVersionMismatch {
                expected: self.channels.version(),
                found: snapshot.table_version(),
            });
        }
        if !self.channels.has_layout(snapshot.channels()) {
            return Err(EncodeError::ChannelOrderMismatch {
                version: self.channels.version(),
            });
        }

        let mut plan = Vec::with_capacity(self.channels.len());
        for (bit, channel) in self.channels.iter() {
            let threshold = snapshot.values().get(bit as usize).copied().ok_or_else(|| {
                EncodeError::MissingThreshold {
                    sample: table.sample().clone(),
                    channel: channel.clone(),
                }
            })?;
            let column =
                table
                    .column_index(channel)
                    .ok_or_else(|| EncodeError::MissingColumn {
                        sample: table.sample().clone(),
                        channel: channel.clone(),
                    })?;
            plan.push(BitPlan {
                bit,
                column,
                threshold,
            });
        }

        let ignored: Vec<&str> = table
            .channels()
            .iter()
            .filter(|c| self.channels.bit_of(c).is_none())
            .map(|c| c.as_str())
            .collect();
        if !ignored.is_empty() {
            log::debug!(
                "Ignoring intensity columns outside the channel table: {}",
                ignored.join(", ")
            );
        }

        Ok(plan)
    }
}

#[inline(always)]
fn encode_cell(cell: ArrayView1<'_, f64>, plan: &[BitPlan]) -> Bitmask {
    let mut mask = Bitmask::default();
    for step in plan {
        if cell[step.column] >= step.threshold {
            mask = mask.with_bit(step.bit);
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::ThresholdStore;
    use ndarray::array;

    fn channel_table() -> Arc<ChannelTable> {
        Arc::new(
            ChannelTable::new(1, vec![ChannelId::from("CD3"), ChannelId::from("CD15")])
                .unwrap(),
        )
    }

    fn sample() -> SampleId {
        SampleId::from("WCM1")
    }

    fn thresholds(cd3: f64, cd15: f64) -> ThresholdStore {
        let store = ThresholdStore::new(1e-6);
        store
            .record(&sample(), &ChannelId::from("CD3"), cd3, "test")
            .unwrap();
        store
            .record(&sample(), &ChannelId::from("CD15"), cd15, "test")
            .unwrap();
        store
    }

    #[test]
    fn equal_intensity_counts_as_positive() {
        let channels = channel_table();
        // Columns deliberately in a different order from the channel table.
        let table = IntensityTable::new(
            sample(),
            vec![ChannelId::from("CD15"), ChannelId::from("CD3")],
            array![[30.0, 1.0], [29.999, 5.0], [31.0, 4.999], [0.0, 0.0]],
            4,
        )
        .unwrap();
        let snapshot = thresholds(5.0, 30.0).snapshot(&sample(), &channels).unwrap();

        let encoded = BitmaskEncoder::new(channels, 2)
            .encode(&table, &snapshot)
            .unwrap();
        let raw: Vec<u64> = encoded.masks().iter().map(|m| m.0).collect();
        // bit 0 = CD3, bit 1 = CD15
        assert_eq!(raw, vec![0b10, 0b01, 0b10, 0b00]);
        assert_eq!(encoded.threshold_generations(), &[1, 1]);
        assert_eq!(encoded.table_version(), 1);
    }

    #[test]
    fn missing_column_fails_fast() {
        let channels = channel_table();
        let table = IntensityTable::new(
            sample(),
            vec![ChannelId::from("CD3"), ChannelId::from("DAPI")],
            array![[1.0, 2.0]],
            1,
        )
        .unwrap();
        let snapshot = thresholds(1.0, 1.0).snapshot(&sample(), &channels).unwrap();
        let err = BitmaskEncoder::new(channels, 16)
            .encode(&table, &snapshot)
            .unwrap_err();
        assert_eq!(
            err,
            EncodeError::MissingColumn {
                sample: sample(),
                channel: ChannelId::from("CD15"),
            }
        );
    }

    #[test]
    fn thresholds_from_another_sample_or_layout_are_rejected() {
        let channels = channel_table();
        let table = IntensityTable::new(
            SampleId::from("WCM2"),
            vec![ChannelId::from("CD3"), ChannelId::from("CD15")],
            array![[1.0, 2.0]],
            1,
        )
        .unwrap();
        let snapshot = thresholds(1.0, 1.0).snapshot(&sample(), &channels).unwrap();
        let encoder = BitmaskEncoder::new(channels, 16);
        assert!(matches!(
            encoder.encode(&table, &snapshot),
            Err(EncodeError::SampleMismatch { .. })
        ));

        let relabelled = Arc::new(
            ChannelTable::new(2, vec![ChannelId::from("CD3"), ChannelId::from("CD15")])
                .unwrap(),
        );
        let own_table = IntensityTable::new(
            sample(),
            vec![ChannelId::from("CD3"), ChannelId::from("CD15")],
            array![[1.0, 2.0]],
            1,
        )
        .unwrap();
        assert_eq!(
            BitmaskEncoder::new(relabelled, 16)
                .encode(&own_table, &snapshot)
                .unwrap_err(),
            EncodeError::TableVersionMismatch {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn same_version_with_reordered_channels_is_rejected() {
        let frozen_against = channel_table();
        let reordered = Arc::new(
            ChannelTable::new(1, vec![ChannelId::from("CD15"), ChannelId::from("CD3")])
                .unwrap(),
        );
        let table = IntensityTable::new(
            sample(),
            vec![ChannelId::from("CD3"), ChannelId::from("CD15")],
            array![[6.0, 29.0]],
            1,
        )
        .unwrap();
        let snapshot = thresholds(5.0, 30.0)
            .snapshot(&sample(), &frozen_against)
            .unwrap();
        assert_eq!(snapshot.channels(), &frozen_against.layout()[..]);

        assert_eq!(
            BitmaskEncoder::new(reordered.clone(), 16)
                .encode(&table, &snapshot)
                .unwrap_err(),
            EncodeError::ChannelOrderMismatch { version: 1 }
        );

        // Frozen against its own order, the same cell encodes correctly.
        let own = thresholds(5.0, 30.0).snapshot(&sample(), &reordered).unwrap();
        let encoded = BitmaskEncoder::new(reordered, 16)
            .encode(&table, &own)
            .unwrap();
        // bit 0 = CD15 (29 < 30), bit 1 = CD3 (6 >= 5)
        assert_eq!(encoded.masks()[0].0, 0b10);
        assert_eq!(
            encoded.channels(),
            &[ChannelId::from("CD15"), ChannelId::from("CD3")]
        );
    }

    #[test]
    fn repeated_encoding_is_bit_identical() {
        let channels = channel_table();
        let rows: Vec<f64> = (0..2000)
            .flat_map(|i| [((i * 7) % 13) as f64, ((i * 11) % 17) as f64])
            .collect();
        let table = IntensityTable::new(
            sample(),
            vec![ChannelId::from("CD3"), ChannelId::from("CD15")],
            ndarray::Array2::from_shape_vec((2000, 2), rows).unwrap(),
            2000,
        )
        .unwrap();
        let snapshot = thresholds(6.0, 8.0).snapshot(&sample(), &channels).unwrap();
        let encoder = BitmaskEncoder::new(channels, 64);
        assert_eq!(
            encoder.encode(&table, &snapshot).unwrap(),
            encoder.encode(&table, &snapshot).unwrap()
        );
    }
}
