//! # Tabular I/O
//!
//! Delimited-text readers and writers for the three artifacts that cross the boundary
//! of the engine: per-sample intensity tables, threshold records and feature-value
//! snapshots. The core itself never touches the filesystem; this module is used by the
//! command-line driver.
//!
//! Files ending in `.csv` are comma-separated, everything else is tab-separated. The
//! first line is always a header. It names columns and is never counted as a cell.

use crate::intensity::{IntensityError, IntensityTable};
use crate::types::{ChannelId, FeatureValue, SampleId, ThresholdRecord};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::Array2;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableIoError {
    #[error("Error from the delimited-text reader: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{path} has no header row")]
    MissingHeader { path: String },
    #[error("{path}, line {line}: column '{column}' holds '{value}', which is not a number")]
    NotANumber {
        path: String,
        line: u64,
        column: String,
        value: String,
    },
    #[error("Failed to shape intensity matrix: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Intensity(#[from] IntensityError),
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

/// Reads one sample's intensity table. `expected_cells` counts cells only, not the
/// header line.
pub fn read_intensity_table(
    path: &Path,
    sample: SampleId,
    expected_cells: usize,
) -> Result<IntensityTable, TableIoError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .has_headers(true)
        .from_path(path)?;

    let channels: Vec<ChannelId> = reader
        .headers()?
        .iter()
        .map(|name| ChannelId::new(name.trim()))
        .collect();
    if channels.is_empty() || channels.iter().all(|c| c.as_str().is_empty()) {
        return Err(TableIoError::MissingHeader {
            path: path.display().to_string(),
        });
    }

    // Sized by what the file holds, never by the caller's expectation.
    let mut values = Vec::new();
    let mut cells = 0usize;
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line());
        for (field, channel) in record.iter().zip(&channels) {
            let parsed: f64 = field
                .trim()
                .parse()
                .map_err(|_| TableIoError::NotANumber {
                    path: path.display().to_string(),
                    line,
                    column: channel.to_string(),
                    value: field.to_string(),
                })?;
            values.push(parsed);
        }
        cells += 1;
    }

    log::info!(
        "Read {cells} cells x {} channels for sample '{sample}' from {}",
        channels.len(),
        path.display()
    );
    let matrix = Array2::from_shape_vec((cells, channels.len()), values)?;
    Ok(IntensityTable::new(sample, channels, matrix, expected_cells)?)
}

fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, TableIoError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let records = reader.deserialize().collect::<Result<Vec<T>, _>>()?;
    Ok(records)
}

fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<(), TableIoError> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter_for(path))
        .from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads `sample  channel  value` records.
pub fn read_thresholds(path: &Path) -> Result<Vec<ThresholdRecord>, TableIoError> {
    read_records(path)
}

pub fn write_thresholds(path: &Path, records: &[ThresholdRecord]) -> Result<(), TableIoError> {
    write_records(path, records)
}

/// Reads `feature  sample  count` records.
pub fn read_feature_values(path: &Path) -> Result<Vec<FeatureValue>, TableIoError> {
    read_records(path)
}

pub fn write_feature_values(path: &Path, values: &[FeatureValue]) -> Result<(), TableIoError> {
    write_records(path, values)
}
