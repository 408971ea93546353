//! # Intensity Tables
//!
//! A validated, immutable cells × channels matrix of continuous intensities for one
//! sample. A cell is identified only by its ordinal row index.
//!
//! The constructor demands the number of cells the caller expects to find. Row counts
//! taken from a file usually include the header line, and a table that silently
//! accepted "cells + 1" or "cells − 1" would shift every downstream count.

use crate::types::{ChannelId, SampleId};
use ahash::AHashMap;
use ndarray::{Array2, ArrayView1, Axis};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum IntensityError {
    #[error(
        "sample '{sample}' has {found} cells, but {expected} were expected. A header row counted as a cell is the usual cause."
    )]
    CellCountMismatch {
        sample: SampleId,
        expected: usize,
        found: usize,
    },
    #[error("intensity matrix has {found} columns, but {expected} channel names were given")]
    ColumnCountMismatch { expected: usize, found: usize },
    #[error("channel '{0}' names more than one intensity column")]
    DuplicateColumn(ChannelId),
    #[error("non-finite intensity at cell {row}, channel '{channel}'")]
    NonFinite { row: usize, channel: ChannelId },
}

#[derive(Debug, Clone)]
pub struct IntensityTable {
    sample: SampleId,
    channels: Vec<ChannelId>,
    columns: AHashMap<ChannelId, usize>,
    values: Array2<f64>,
}

impl IntensityTable {
    /// Builds a table from a `[cells, channels]` matrix whose columns are named by
    /// `channels`, in order.
    pub fn new(
        sample: SampleId,
        channels: Vec<ChannelId>,
        values: Array2<f64>,
        expected_cells: usize,
    ) -> Result<Self, IntensityError> {
        if values.ncols() != channels.len() {
            return Err(IntensityError::ColumnCountMismatch {
                expected: channels.len(),
                found: values.ncols(),
            });
        }
        if values.nrows() != expected_cells {
            return Err(IntensityError::CellCountMismatch {
                sample,
                expected: expected_cells,
                found: values.nrows(),
            });
        }

        let mut columns = AHashMap::with_capacity(channels.len());
        for (idx, channel) in channels.iter().enumerate() {
            if columns.insert(channel.clone(), idx).is_some() {
                return Err(IntensityError::DuplicateColumn(channel.clone()));
            }
        }

        for (row, cell) in values.axis_iter(Axis(0)).enumerate() {
            if let Some(col) = cell.iter().position(|v| !v.is_finite()) {
                return Err(IntensityError::NonFinite {
                    row,
                    channel: channels[col].clone(),
                });
            }
        }

        Ok(Self {
            sample,
            channels,
            columns,
            values,
        })
    }

    #[inline]
    pub fn sample(&self) -> &SampleId {
        &self.sample
    }

    /// Column channel names, in matrix order.
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    #[inline]
    pub fn num_cells(&self) -> usize {
        self.values.nrows()
    }

    pub fn column(&self, channel: &ChannelId) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .get(channel)
            .map(|&idx| self.values.column(idx))
    }

    pub(crate) fn column_index(&self, channel: &ChannelId) -> Option<usize> {
        self.columns.get(channel).copied()
    }

    pub(crate) fn values(&self) -> &Array2<f64> {
        &self.values
    }
}
