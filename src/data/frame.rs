//! Labelled tabular frame on top of polars
//!
//! Feature columns are stored as `Float64` series next to a `UInt64` row-label
//! column. Row labels need not be contiguous after a selection, which is why
//! train/valid/test index arrays resolve against labels while CV folds
//! resolve positionally. Conversion to `Array2` happens only at the estimator
//! boundary.

use std::collections::HashMap;

use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Result, RunnerError};

/// Name of the row-label column carried by every frame
pub const INDEX_COLUMN: &str = "__row_label";

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "FrameRecord")]
pub struct LabeledFrame {
    columns: Vec<String>,
    df: DataFrame,
}

impl LabeledFrame {
    /// Frame with a default `0..n` row index
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self> {
        let index = (0..values.nrows()).collect();
        Self::with_index(columns, index, values)
    }

    pub fn with_index(columns: Vec<String>, index: Vec<usize>, values: Array2<f64>) -> Result<Self> {
        if columns.len() != values.ncols() {
            return Err(RunnerError::ShapeError {
                expected: format!("{} column names", values.ncols()),
                actual: format!("{} column names", columns.len()),
            });
        }
        if index.len() != values.nrows() {
            return Err(RunnerError::ShapeError {
                expected: format!("{} row labels", values.nrows()),
                actual: format!("{} row labels", index.len()),
            });
        }
        let mut series: Vec<Column> = columns
            .iter()
            .enumerate()
            .map(|(j, name)| Series::new(name.as_str().into(), values.column(j).to_vec()).into())
            .collect();
        series.push(label_series(&index).into());
        Ok(Self {
            columns,
            df: DataFrame::new(series)?,
        })
    }

    /// Wrap a polars frame; every column except the row labels becomes a
    /// `Float64` feature, and a missing label column defaults to `0..n`
    pub fn from_polars(df: DataFrame) -> Result<Self> {
        let columns: Vec<String> = df
            .get_column_names()
            .into_iter()
            .filter(|name| name.as_str() != INDEX_COLUMN)
            .map(|s| s.to_string())
            .collect();
        let mut out: Vec<Column> = columns
            .iter()
            .map(|name| Ok(df.column(name)?.cast(&DataType::Float64)?))
            .collect::<Result<_>>()?;
        let labels = match df.column(INDEX_COLUMN) {
            Ok(col) => col.cast(&DataType::UInt64)?,
            Err(_) => label_series(&(0..df.height()).collect::<Vec<_>>()).into(),
        };
        out.push(labels);
        Ok(Self {
            columns,
            df: DataFrame::new(out)?,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Underlying polars frame, row-label column included
    pub fn as_polars(&self) -> &DataFrame {
        &self.df
    }

    pub fn nrows(&self) -> usize {
        self.df.height()
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Row labels in row order
    pub fn index(&self) -> Result<Vec<usize>> {
        Ok(self
            .df
            .column(INDEX_COLUMN)?
            .u64()?
            .into_iter()
            .map(|v| v.unwrap_or_default() as usize)
            .collect())
    }

    /// Labels of the rows at `positions`
    pub fn labels_at(&self, positions: &[usize]) -> Result<Vec<usize>> {
        let index = self.index()?;
        positions
            .iter()
            .map(|&p| {
                index.get(p).copied().ok_or_else(|| {
                    RunnerError::DataError(format!("row position {} out of bounds for {} rows", p, index.len()))
                })
            })
            .collect()
    }

    /// Positions of the rows carrying `labels`
    pub fn positions_of(&self, labels: &[usize]) -> Result<Vec<usize>> {
        let positions: HashMap<usize, usize> = self
            .index()?
            .into_iter()
            .enumerate()
            .map(|(pos, label)| (label, pos))
            .collect();
        labels
            .iter()
            .map(|label| {
                positions
                    .get(label)
                    .copied()
                    .ok_or_else(|| RunnerError::DataError(format!("row label {} not found in frame", label)))
            })
            .collect()
    }

    /// Positional row selection (`iloc`)
    pub fn iloc(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.nrows()) {
            return Err(RunnerError::DataError(format!(
                "row position {} out of bounds for {} rows",
                bad,
                self.nrows()
            )));
        }
        let idx = IdxCa::from_vec("rows".into(), rows.iter().map(|&r| r as IdxSize).collect());
        Ok(Self {
            columns: self.columns.clone(),
            df: self.df.take(&idx)?,
        })
    }

    /// Row selection by label (`loc`)
    pub fn loc(&self, labels: &[usize]) -> Result<Self> {
        self.iloc(&self.positions_of(labels)?)
    }

    pub fn select_columns(&self, columns: &[usize]) -> Result<Self> {
        if let Some(&bad) = columns.iter().find(|&&c| c >= self.ncols()) {
            return Err(RunnerError::DataError(format!(
                "column {} out of bounds for {} columns",
                bad,
                self.ncols()
            )));
        }
        let names: Vec<String> = columns.iter().map(|&c| self.columns[c].clone()).collect();
        let mut selection = names.clone();
        selection.push(INDEX_COLUMN.to_string());
        Ok(Self {
            columns: names,
            df: self.df.select(selection)?,
        })
    }

    /// Position of a named column
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Values of the feature column at `position`; nulls read as NaN
    pub fn column_values(&self, position: usize) -> Result<Vec<f64>> {
        let name = self.columns.get(position).ok_or_else(|| {
            RunnerError::DataError(format!("column {} out of bounds for {} columns", position, self.ncols()))
        })?;
        Ok(self
            .df
            .column(name)?
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }

    /// Append the rows of `other`, keeping both row indexes
    pub fn vstack(&self, other: &LabeledFrame) -> Result<Self> {
        if self.columns != other.columns {
            return Err(RunnerError::ShapeError {
                expected: format!("columns {:?}", self.columns),
                actual: format!("columns {:?}", other.columns),
            });
        }
        Ok(Self {
            columns: self.columns.clone(),
            df: self.df.vstack(&other.df)?,
        })
    }

    /// Row-major feature block, built column by column
    pub fn to_array(&self) -> Result<Array2<f64>> {
        let col_data: Vec<Vec<f64>> = (0..self.ncols())
            .map(|j| self.column_values(j))
            .collect::<Result<_>>()?;
        Ok(Array2::from_shape_fn((self.nrows(), self.ncols()), |(r, c)| col_data[c][r]))
    }

    /// Count of NaN or null feature cells
    pub fn num_missing(&self) -> Result<usize> {
        let mut missing = 0;
        for j in 0..self.ncols() {
            missing += self.column_values(j)?.iter().filter(|v| v.is_nan()).count();
        }
        Ok(missing)
    }
}

fn label_series(index: &[usize]) -> Series {
    Series::new(INDEX_COLUMN.into(), index.iter().map(|&i| i as u64).collect::<Vec<u64>>())
}

impl PartialEq for LabeledFrame {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns && self.df.equals_missing(&other.df)
    }
}

/// Wire form of a frame; bincode cannot carry a polars frame directly
#[derive(Serialize, Deserialize)]
struct FrameRecord {
    columns: Vec<String>,
    index: Vec<usize>,
    values: Array2<f64>,
}

impl TryFrom<FrameRecord> for LabeledFrame {
    type Error = RunnerError;

    fn try_from(record: FrameRecord) -> Result<Self> {
        LabeledFrame::with_index(record.columns, record.index, record.values)
    }
}

impl Serialize for LabeledFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let record = FrameRecord {
            columns: self.columns.clone(),
            index: self.index().map_err(serde::ser::Error::custom)?,
            values: self.to_array().map_err(serde::ser::Error::custom)?,
        };
        record.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use polars::df;

    fn frame() -> LabeledFrame {
        let df = df!(
            "a" => &[1.0, 3.0, 5.0],
            "b" => &[2.0, 4.0, 6.0],
            INDEX_COLUMN => &[10u64, 20, 30]
        )
        .unwrap();
        LabeledFrame::from_polars(df).unwrap()
    }

    #[test]
    fn test_loc_uses_labels() {
        let f = frame();
        let picked = f.loc(&[30, 10]).unwrap();
        assert_eq!(picked.to_array().unwrap(), array![[5.0, 6.0], [1.0, 2.0]]);
        assert_eq!(picked.index().unwrap(), vec![30, 10]);
        assert!(f.loc(&[1]).is_err());
    }

    #[test]
    fn test_iloc_uses_positions() {
        let f = frame();
        let picked = f.iloc(&[1]).unwrap();
        assert_eq!(picked.to_array().unwrap(), array![[3.0, 4.0]]);
        assert_eq!(picked.index().unwrap(), vec![20]);
        assert!(f.iloc(&[3]).is_err());
    }

    #[test]
    fn test_vstack_requires_same_columns() {
        let f = frame();
        let other = LabeledFrame::new(vec!["x".to_string(), "y".to_string()], array![[0.0, 0.0]]).unwrap();
        assert!(f.vstack(&other).is_err());
        let stacked = f.vstack(&f.iloc(&[0]).unwrap()).unwrap();
        assert_eq!(stacked.nrows(), 4);
        assert_eq!(stacked.index().unwrap(), vec![10, 20, 30, 10]);
    }

    #[test]
    fn test_integer_columns_become_features_with_default_labels() {
        let df = df!("n" => &[1i32, 2, 3], "m" => &[0.5, 1.5, 2.5]).unwrap();
        let f = LabeledFrame::from_polars(df).unwrap();
        assert_eq!(f.columns(), &["n".to_string(), "m".to_string()]);
        assert_eq!(f.index().unwrap(), vec![0, 1, 2]);
        assert_eq!(f.column_values(0).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_select_columns_keeps_labels() {
        let f = frame().select_columns(&[1]).unwrap();
        assert_eq!(f.columns(), &["b".to_string()]);
        assert_eq!(f.to_array().unwrap(), array![[2.0], [4.0], [6.0]]);
        assert_eq!(f.index().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_bincode_keeps_labels_and_values() {
        let f = frame().iloc(&[2, 0]).unwrap();
        let bytes = bincode::serialize(&f).unwrap();
        let back: LabeledFrame = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, f);
        assert_eq!(back.index().unwrap(), vec![30, 10]);
    }

    #[test]
    fn test_missing_cells_counted() {
        let df = df!("a" => &[Some(1.0), None, Some(f64::NAN)]).unwrap();
        let f = LabeledFrame::from_polars(df).unwrap();
        assert_eq!(f.num_missing().unwrap(), 2);
    }
}
