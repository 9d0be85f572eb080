//! # Tab-Separated Data Loading
//!
//! The schema is fixed: a header row, a `target` column with the response,
//! an optional `sample_id` column, and every other column a numeric feature
//! taken in header order. Every feature cell must parse as a finite number.

use ndarray::{Array1, Array2};
use std::path::Path;
use thiserror::Error;

pub const TARGET_COLUMN: &str = "target";
pub const SAMPLE_ID_COLUMN: &str = "sample_id";

/// Smallest number of rows accepted for training.
const MINIMUM_TRAINING_ROWS: usize = 2;

/// A validated table, ready for training or prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Shape `[n_samples, feature_names.len()]`.
    pub features: Array2<f64>,
    pub feature_names: Vec<String>,
    /// Present whenever the file has a `target` column.
    pub target: Option<Array1<f64>>,
    /// From the `sample_id` column, or 1-based row numbers when it is absent.
    pub sample_ids: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse the tab-separated file: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error("The input file has no feature columns besides 'target' and 'sample_id'.")]
    NoFeatures,
    #[error("Row {row}, column '{column}': '{value}' is not a number.")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },
    #[error("Row {row}, column '{column}' holds a non-finite value.")]
    NonFinite { row: usize, column: String },
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("The file has {found} feature columns, but {expected} were expected.")]
    FeatureCountMismatch { expected: usize, found: usize },
}

/// Loads a table for training; the `target` column is required.
pub fn load_training_tsv(path: &Path) -> Result<Dataset, DataError> {
    let data = load_tsv(path)?;
    if data.target.is_none() {
        return Err(DataError::ColumnNotFound(TARGET_COLUMN.to_string()));
    }
    if data.features.nrows() < MINIMUM_TRAINING_ROWS {
        return Err(DataError::InsufficientRows {
            found: data.features.nrows(),
            required: MINIMUM_TRAINING_ROWS,
        });
    }
    Ok(data)
}

/// Loads a table for prediction, checking it against the trained feature
/// count. A `target` column, if present, is kept for scoring.
pub fn load_prediction_tsv(path: &Path, expected_features: usize) -> Result<Dataset, DataError> {
    let data = load_tsv(path)?;
    if data.feature_names.len() != expected_features {
        return Err(DataError::FeatureCountMismatch {
            expected: expected_features,
            found: data.feature_names.len(),
        });
    }
    Ok(data)
}

fn parse_cell(raw: &str, row: usize, column: &str) -> Result<f64, DataError> {
    let value: f64 = raw.trim().parse().map_err(|_| DataError::NotNumeric {
        row,
        column: column.to_string(),
        value: raw.to_string(),
    })?;
    if !value.is_finite() {
        return Err(DataError::NonFinite {
            row,
            column: column.to_string(),
        });
    }
    Ok(value)
}

/// Reads and validates a tab-separated table.
pub fn load_tsv(path: &Path) -> Result<Dataset, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

    let target_index = headers.iter().position(|h| h == TARGET_COLUMN);
    let id_index = headers.iter().position(|h| h == SAMPLE_ID_COLUMN);
    let feature_columns: Vec<usize> = (0..headers.len())
        .filter(|&i| Some(i) != target_index && Some(i) != id_index)
        .collect();
    if feature_columns.is_empty() {
        return Err(DataError::NoFeatures);
    }

    let mut values = Vec::new();
    let mut target = Vec::new();
    let mut sample_ids = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        // Data rows are numbered from 1, after the header.
        let row = row_index + 1;
        for &col in &feature_columns {
            values.push(parse_cell(record.get(col).unwrap_or(""), row, &headers[col])?);
        }
        if let Some(col) = target_index {
            target.push(parse_cell(record.get(col).unwrap_or(""), row, TARGET_COLUMN)?);
        }
        sample_ids.push(match id_index {
            Some(col) => record.get(col).unwrap_or("").to_string(),
            None => row.to_string(),
        });
    }

    let n_rows = sample_ids.len();
    if n_rows == 0 {
        return Err(DataError::InsufficientRows {
            found: 0,
            required: 1,
        });
    }
    let features = Array2::from_shape_vec((n_rows, feature_columns.len()), values).map_err(|_| {
        DataError::FeatureCountMismatch {
            expected: feature_columns.len(),
            found: 0,
        }
    })?;

    log::info!(
        "Loaded {} rows with {} features from {}",
        n_rows,
        feature_columns.len(),
        path.display()
    );
    Ok(Dataset {
        features,
        feature_names: feature_columns.iter().map(|&i| headers[i].clone()).collect(),
        target: target_index.map(|_| Array1::from(target)),
        sample_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tsv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_features_in_header_order() {
        let file = write_tsv("b\ttarget\tsample_id\ta\n1.0\t2.5\tfirst\t-1\n3\t4.5\tsecond\t0.25\n");
        let data = load_training_tsv(file.path()).unwrap();
        assert_eq!(data.feature_names, vec!["b", "a"]);
        assert_eq!(data.features, ndarray::array![[1.0, -1.0], [3.0, 0.25]]);
        assert_eq!(data.target, Some(ndarray::array![2.5, 4.5]));
        assert_eq!(data.sample_ids, vec!["first", "second"]);
    }

    #[test]
    fn sample_ids_default_to_row_numbers() {
        let file = write_tsv("x\n0.1\n0.2\n0.3\n");
        let data = load_prediction_tsv(file.path(), 1).unwrap();
        assert!(data.target.is_none());
        assert_eq!(data.sample_ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn training_requires_a_target() {
        let file = write_tsv("x\n0.1\n0.2\n");
        assert!(matches!(
            load_training_tsv(file.path()),
            Err(DataError::ColumnNotFound(c)) if c == "target"
        ));
    }

    #[test]
    fn bad_cells_are_located() {
        let file = write_tsv("x\ttarget\n0.1\t1\nabc\t2\n");
        match load_training_tsv(file.path()) {
            Err(DataError::NotNumeric { row, column, value }) => {
                assert_eq!(row, 2);
                assert_eq!(column, "x");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let file = write_tsv("x\ttarget\n0.1\tNaN\n0.2\t1\n");
        assert!(matches!(
            load_training_tsv(file.path()),
            Err(DataError::NonFinite { row: 1, .. })
        ));
    }

    #[test]
    fn feature_count_is_checked_for_prediction() {
        let file = write_tsv("x\ty\n0.1\t0.2\n");
        assert!(matches!(
            load_prediction_tsv(file.path(), 1),
            Err(DataError::FeatureCountMismatch { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn too_few_training_rows() {
        let file = write_tsv("x\ttarget\n0.1\t1\n");
        assert!(matches!(
            load_training_tsv(file.path()),
            Err(DataError::InsufficientRows { found: 1, .. })
        ));
    }
}
