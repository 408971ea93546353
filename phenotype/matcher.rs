// ========================================================================================
//
//                 The phenotype matcher: criterion evaluation over bitmasks
//
// ========================================================================================
//
// A criterion is compiled once into two masks against the channel table. A cell then
// matches iff
//
//     (bitmask & positive_mask) == positive_mask  &&  (bitmask & negative_mask) == 0
//
// Each cell is judged on its own, so a count is a plain sum of per-chunk counts. The
// result depends only on the bitmasks and the criterion.
//
// The empty criterion (no positive and no negative channels) matches every cell and
// therefore returns the sample's total cell count. This is intended and tested.

use crate::channels::ChannelTable;
use crate::encode::BitmaskArray;
use crate::types::{Bitmask, ChannelId};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("criterion requires channels to be both positive and negative: {}", join_channels(.channels))]
    ContradictoryCriterion { channels: Vec<ChannelId> },
    #[error("criterion names channel '{0}', which is not in the channel table")]
    UnknownChannel(ChannelId),
    #[error("bitmasks were encoded against channel table v{found}, the matcher uses v{expected}")]
    TableVersionMismatch { expected: u32, found: u32 },
    #[error("bitmasks or criterion follow a different channel order under channel table v{version}")]
    ChannelOrderMismatch { version: u32 },
}

fn join_channels(channels: &[ChannelId]) -> String {
    channels.iter().join(", ")
}

/// Channels required positive and channels required negative. A channel in neither set
/// is a "don't care".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PhenotypeCriterion {
    #[serde(default)]
    pub required_positive: BTreeSet<ChannelId>,
    #[serde(default)]
    pub required_negative: BTreeSet<ChannelId>,
}

impl PhenotypeCriterion {
    pub fn new(
        positive: impl IntoIterator<Item = ChannelId>,
        negative: impl IntoIterator<Item = ChannelId>,
    ) -> Self {
        Self {
            required_positive: positive.into_iter().collect(),
            required_negative: negative.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.required_positive.is_empty() && self.required_negative.is_empty()
    }

    /// A stable textual form, e.g. `CD15+ CD20+ CD3-`, used to derive feature ids.
    pub fn canonical_name(&self) -> String {
        if self.is_empty() {
            return "all cells".to_string();
        }
        let positives = self
            .required_positive
            .iter()
            .map(ChannelId::as_str)
            .sorted_by(|a, b| natord::compare(a, b))
            .map(|c| format!("{c}+"));
        let negatives = self
            .required_negative
            .iter()
            .map(ChannelId::as_str)
            .sorted_by(|a, b| natord::compare(a, b))
            .map(|c| format!("{c}-"));
        positives.chain(negatives).join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCriterion {
    positive_mask: u64,
    negative_mask: u64,
    table_version: u32,
    channels: Arc<[ChannelId]>,
}

impl CompiledCriterion {
    #[inline(always)]
    pub fn matches(&self, mask: Bitmask) -> bool {
        (mask.0 & self.positive_mask) == self.positive_mask && (mask.0 & self.negative_mask) == 0
    }

    pub fn positive_mask(&self) -> u64 {
        self.positive_mask
    }

    pub fn negative_mask(&self) -> u64 {
        self.negative_mask
    }
}

#[derive(Debug, Clone)]
pub struct PhenotypeMatcher {
    channels: Arc<ChannelTable>,
    chunk_size: usize,
}

impl PhenotypeMatcher {
    pub fn new(channels: Arc<ChannelTable>, chunk_size: usize) -> Self {
        Self {
            channels,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Validates the criterion and turns it into bit masks. A contradictory criterion
    /// is rejected here, before any cell is looked at.
    pub fn compile(&self, criterion: &PhenotypeCriterion) -> Result<CompiledCriterion, MatchError> {
        let overlap: Vec<ChannelId> = criterion
            .required_positive
            .intersection(&criterion.required_negative)
            .cloned()
            .collect();
        if !overlap.is_empty() {
            return Err(MatchError::ContradictoryCriterion { channels: overlap });
        }

        Ok(CompiledCriterion {
            positive_mask: self.mask_of(&criterion.required_positive)?,
            negative_mask: self.mask_of(&criterion.required_negative)?,
            table_version: self.channels.version(),
            channels: self.channels.layout().clone(),
        })
    }

    fn mask_of(&self, channels: &BTreeSet<ChannelId>) -> Result<u64, MatchError> {
        channels.iter().try_fold(0u64, |mask, channel| {
            self.channels
                .bit_of(channel)
                .map(|bit| mask | (1u64 << bit))
                .ok_or_else(|| MatchError::UnknownChannel(channel.clone()))
        })
    }

    fn check_layout(
        &self,
        compiled: &CompiledCriterion,
        bitmasks: &BitmaskArray,
    ) -> Result<(), MatchError> {
        let expected = self.channels.version();
        for (found, channels) in [
            (compiled.table_version, &compiled.channels[..]),
            (bitmasks.table_version(), bitmasks.channels()),
        ] {
            if found != expected {
                return Err(MatchError::TableVersionMismatch { expected, found });
            }
            if !self.channels.has_layout(channels) {
                return Err(MatchError::ChannelOrderMismatch { version: expected });
            }
        }
        Ok(())
    }

    pub fn count(
        &self,
        compiled: &CompiledCriterion,
        bitmasks: &BitmaskArray,
    ) -> Result<u64, MatchError> {
        self.check_layout(compiled, bitmasks)?;
        Ok(bitmasks
            .masks()
            .par_chunks(self.chunk_size)
            .map(|chunk| chunk.iter().filter(|&&m| compiled.matches(m)).count() as u64)
            .sum())
    }

    /// Compiles and counts in one step.
    pub fn count_criterion(
        &self,
        criterion: &PhenotypeCriterion,
        bitmasks: &BitmaskArray,
    ) -> Result<u64, MatchError> {
        let compiled = self.compile(criterion)?;
        self.count(&compiled, bitmasks)
    }

    /// Ordinal indices of the matching cells, ascending.
    pub fn matching_cells(
        &self,
        compiled: &CompiledCriterion,
        bitmasks: &BitmaskArray,
    ) -> Result<Vec<usize>, MatchError> {
        self.check_layout(compiled, bitmasks)?;
        Ok(bitmasks
            .masks()
            .par_iter()
            .enumerate()
            .with_min_len(self.chunk_size)
            .filter(|(_, m)| compiled.matches(**m))
            .map(|(idx, _)| idx)
            .collect())
    }
}
