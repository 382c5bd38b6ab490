//! Tabular data views
//!
//! [`TabularView`] hides whether `X` is a dense matrix, a CSR sparse matrix or
//! a labelled frame. Row selection comes in two flavours: positional, used by
//! matrices and by CV folds, and label-based, used by frames for the
//! train/valid/test index arrays.

mod frame;
mod sparse;

pub use frame::{LabeledFrame, INDEX_COLUMN};
pub use sparse::CsrMatrix;

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// How an index array addresses rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSelection {
    Position,
    Label,
}

/// Feature matrix backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TabularView {
    Dense(Array2<f64>),
    Sparse(CsrMatrix),
    Frame(LabeledFrame),
}

impl From<Array2<f64>> for TabularView {
    fn from(values: Array2<f64>) -> Self {
        TabularView::Dense(values)
    }
}

impl From<CsrMatrix> for TabularView {
    fn from(values: CsrMatrix) -> Self {
        TabularView::Sparse(values)
    }
}

impl From<LabeledFrame> for TabularView {
    fn from(values: LabeledFrame) -> Self {
        TabularView::Frame(values)
    }
}

impl TabularView {
    pub fn nrows(&self) -> usize {
        match self {
            TabularView::Dense(m) => m.nrows(),
            TabularView::Sparse(m) => m.nrows(),
            TabularView::Frame(f) => f.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            TabularView::Dense(m) => m.ncols(),
            TabularView::Sparse(m) => m.ncols(),
            TabularView::Frame(f) => f.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, TabularView::Sparse(_))
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, TabularView::Frame(_))
    }

    /// Column names when the backend carries them
    pub fn column_names(&self) -> Option<&[String]> {
        match self {
            TabularView::Frame(f) => Some(f.columns()),
            _ => None,
        }
    }

    /// Materialize as a dense matrix
    pub fn to_dense(&self) -> Result<Array2<f64>> {
        match self {
            TabularView::Dense(m) => Ok(m.clone()),
            TabularView::Sparse(m) => Ok(m.to_dense()),
            TabularView::Frame(f) => f.to_array(),
        }
    }

    /// Values of one feature column
    pub fn column(&self, position: usize) -> Result<Vec<f64>> {
        if position >= self.ncols() {
            return Err(RunnerError::DataError(format!(
                "column {} out of bounds for {} columns",
                position,
                self.ncols()
            )));
        }
        match self {
            TabularView::Dense(m) => Ok(m.column(position).to_vec()),
            TabularView::Sparse(m) => Ok(m.to_dense().column(position).to_vec()),
            TabularView::Frame(f) => f.column_values(position),
        }
    }

    /// Positional row selection for every backend
    pub fn take_rows(&self, rows: &[usize]) -> Result<Self> {
        match self {
            TabularView::Dense(m) => {
                if let Some(&bad) = rows.iter().find(|&&r| r >= m.nrows()) {
                    return Err(RunnerError::DataError(format!(
                        "row {} out of bounds for {} rows",
                        bad,
                        m.nrows()
                    )));
                }
                Ok(TabularView::Dense(m.select(Axis(0), rows)))
            }
            TabularView::Sparse(m) => Ok(TabularView::Sparse(m.take_rows(rows)?)),
            TabularView::Frame(f) => Ok(TabularView::Frame(f.iloc(rows)?)),
        }
    }

    /// Row selection following the requested addressing mode
    ///
    /// Label addressing only differs from positional addressing for frames.
    pub fn select_rows(&self, rows: &[usize], mode: RowSelection) -> Result<Self> {
        match (self, mode) {
            (TabularView::Frame(f), RowSelection::Label) => Ok(TabularView::Frame(f.loc(rows)?)),
            _ => self.take_rows(rows),
        }
    }

    /// Positions of the rows named by `rows` under `mode`
    pub fn resolve_positions(&self, rows: &[usize], mode: RowSelection) -> Result<Vec<usize>> {
        match (self, mode) {
            (TabularView::Frame(f), RowSelection::Label) => f.positions_of(rows),
            _ => Ok(rows.to_vec()),
        }
    }

    pub fn select_columns(&self, columns: &[usize]) -> Result<Self> {
        match self {
            TabularView::Dense(m) => {
                if let Some(&bad) = columns.iter().find(|&&c| c >= m.ncols()) {
                    return Err(RunnerError::DataError(format!(
                        "column {} out of bounds for {} columns",
                        bad,
                        m.ncols()
                    )));
                }
                Ok(TabularView::Dense(m.select(Axis(1), columns)))
            }
            TabularView::Sparse(m) => Ok(TabularView::Sparse(m.select_columns(columns)?)),
            TabularView::Frame(f) => Ok(TabularView::Frame(f.select_columns(columns)?)),
        }
    }

    /// Stack `other` below `self`; sparse inputs stay sparse
    pub fn vstack(&self, other: &TabularView) -> Result<Self> {
        match (self, other) {
            (TabularView::Sparse(a), TabularView::Sparse(b)) => Ok(TabularView::Sparse(a.vstack(b)?)),
            (TabularView::Sparse(a), b) => {
                Ok(TabularView::Sparse(a.vstack(&CsrMatrix::from_dense(&b.to_dense()?))?))
            }
            (TabularView::Frame(a), TabularView::Frame(b)) => Ok(TabularView::Frame(a.vstack(b)?)),
            (a, b) => {
                if a.ncols() != b.ncols() {
                    return Err(RunnerError::ShapeError {
                        expected: format!("{} columns", a.ncols()),
                        actual: format!("{} columns", b.ncols()),
                    });
                }
                let (da, db) = (a.to_dense()?, b.to_dense()?);
                Ok(TabularView::Dense(ndarray::concatenate(
                    Axis(0),
                    &[da.view(), db.view()],
                )?))
            }
        }
    }

    /// Count of NaN cells
    pub fn num_missing(&self) -> Result<usize> {
        match self {
            TabularView::Dense(m) => Ok(m.iter().filter(|v| v.is_nan()).count()),
            TabularView::Sparse(m) => Ok(m.data().iter().filter(|v| v.is_nan()).count()),
            TabularView::Frame(f) => f.num_missing(),
        }
    }

    /// Stable byte image used for dataset identifiers
    pub fn hash_bytes(&self) -> Result<Vec<u8>> {
        match self {
            TabularView::Sparse(m) => Ok(m.hash_bytes()),
            TabularView::Dense(m) => Ok(dense_bytes(m)),
            TabularView::Frame(f) => {
                let mut bytes = dense_bytes(&f.to_array()?);
                for name in f.columns() {
                    bytes.extend_from_slice(name.as_bytes());
                }
                Ok(bytes)
            }
        }
    }
}

fn dense_bytes(m: &Array2<f64>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 * m.len());
    for v in m.iter() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Gather vector entries by position
pub fn take_values(values: &Array1<f64>, rows: &[usize]) -> Result<Array1<f64>> {
    if let Some(&bad) = rows.iter().find(|&&r| r >= values.len()) {
        return Err(RunnerError::DataError(format!(
            "row {} out of bounds for {} values",
            bad,
            values.len()
        )));
    }
    Ok(values.select(Axis(0), rows))
}

/// Concatenate two vectors
pub fn concat_values(a: &Array1<f64>, b: &Array1<f64>) -> Array1<f64> {
    a.iter().chain(b.iter()).copied().collect()
}

/// Byte image of a vector, for hashing
pub fn vector_bytes(values: &Array1<f64>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 * values.len());
    for v in values.iter() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Byte image of an index array, for hashing
pub fn index_bytes(indices: &[usize]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 * indices.len());
    for i in indices {
        bytes.extend_from_slice(&(*i as u64).to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use polars::df;

    #[test]
    fn test_label_selection_only_affects_frames() {
        let dense = TabularView::Dense(array![[1.0], [2.0], [3.0]]);
        let picked = dense.select_rows(&[2], RowSelection::Label).unwrap();
        assert_eq!(picked.to_dense().unwrap(), array![[3.0]]);

        let df = df!("a" => &[1.0, 2.0, 3.0], INDEX_COLUMN => &[5u64, 6, 7]).unwrap();
        let frame = TabularView::Frame(LabeledFrame::from_polars(df).unwrap());
        let picked = frame.select_rows(&[7], RowSelection::Label).unwrap();
        assert_eq!(picked.to_dense().unwrap(), array![[3.0]]);
        assert!(frame.select_rows(&[2], RowSelection::Label).is_err());
        assert_eq!(frame.select_rows(&[2], RowSelection::Position).unwrap().to_dense().unwrap(), array![[3.0]]);
        assert_eq!(frame.resolve_positions(&[6, 5], RowSelection::Label).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_vstack_keeps_sparse() {
        let a = TabularView::Sparse(CsrMatrix::from_dense(&array![[1.0, 0.0]]));
        let b = TabularView::Dense(array![[0.0, 2.0]]);
        let stacked = a.vstack(&b).unwrap();
        assert!(stacked.is_sparse());
        assert_eq!(stacked.to_dense().unwrap(), array![[1.0, 0.0], [0.0, 2.0]]);
    }

    #[test]
    fn test_num_missing() {
        let view = TabularView::Dense(array![[f64::NAN, 1.0], [2.0, f64::NAN]]);
        assert_eq!(view.num_missing().unwrap(), 2);
    }
}
