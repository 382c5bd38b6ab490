//! Compressed sparse row matrix

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};

/// CSR matrix of `f64`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrMatrix {
    /// Build from raw CSR buffers, validating their consistency
    pub fn new(
        nrows: usize,
        ncols: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        data: Vec<f64>,
    ) -> Result<Self> {
        if indptr.len() != nrows + 1 {
            return Err(RunnerError::ShapeError {
                expected: format!("indptr length = {}", nrows + 1),
                actual: format!("indptr length = {}", indptr.len()),
            });
        }
        if indices.len() != data.len() {
            return Err(RunnerError::ShapeError {
                expected: format!("indices length = {}", data.len()),
                actual: format!("indices length = {}", indices.len()),
            });
        }
        if indptr.last().copied().unwrap_or(0) != data.len() {
            return Err(RunnerError::DataError(
                "indptr does not terminate at nnz".to_string(),
            ));
        }
        if indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(RunnerError::DataError("indptr is not monotonic".to_string()));
        }
        if let Some(&bad) = indices.iter().find(|&&c| c >= ncols) {
            return Err(RunnerError::DataError(format!(
                "column index {} out of bounds for {} columns",
                bad, ncols
            )));
        }
        Ok(Self {
            nrows,
            ncols,
            indptr,
            indices,
            data,
        })
    }

    /// Compress a dense matrix, dropping exact zeros
    pub fn from_dense(dense: &Array2<f64>) -> Self {
        let mut indptr = Vec::with_capacity(dense.nrows() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in dense.rows() {
            for (j, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    indices.push(j);
                    data.push(v);
                }
            }
            indptr.push(data.len());
        }
        Self {
            nrows: dense.nrows(),
            ncols: dense.ncols(),
            indptr,
            indices,
            data,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Stored entries of one row as `(column, value)` pairs
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (start, end) = (self.indptr[i], self.indptr[i + 1]);
        self.indices[start..end]
            .iter()
            .copied()
            .zip(self.data[start..end].iter().copied())
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.nrows, self.ncols));
        for i in 0..self.nrows {
            for (j, v) in self.row(i) {
                out[[i, j]] = v;
            }
        }
        out
    }

    /// Gather rows by position
    pub fn take_rows(&self, rows: &[usize]) -> Result<Self> {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &r in rows {
            if r >= self.nrows {
                return Err(RunnerError::DataError(format!(
                    "row {} out of bounds for {} rows",
                    r, self.nrows
                )));
            }
            for (j, v) in self.row(r) {
                indices.push(j);
                data.push(v);
            }
            indptr.push(data.len());
        }
        Ok(Self {
            nrows: rows.len(),
            ncols: self.ncols,
            indptr,
            indices,
            data,
        })
    }

    /// Keep the listed columns, renumbered in the order given
    pub fn select_columns(&self, columns: &[usize]) -> Result<Self> {
        let mut remap = vec![None; self.ncols];
        for (new, &old) in columns.iter().enumerate() {
            if old >= self.ncols {
                return Err(RunnerError::DataError(format!(
                    "column {} out of bounds for {} columns",
                    old, self.ncols
                )));
            }
            remap[old] = Some(new);
        }
        let mut indptr = Vec::with_capacity(self.nrows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for i in 0..self.nrows {
            let mut entries: Vec<(usize, f64)> = self
                .row(i)
                .filter_map(|(j, v)| remap[j].map(|nj| (nj, v)))
                .collect();
            entries.sort_by_key(|(j, _)| *j);
            for (j, v) in entries {
                indices.push(j);
                data.push(v);
            }
            indptr.push(data.len());
        }
        Ok(Self {
            nrows: self.nrows,
            ncols: columns.len(),
            indptr,
            indices,
            data,
        })
    }

    /// Stack `other` below `self`
    pub fn vstack(&self, other: &CsrMatrix) -> Result<Self> {
        if self.ncols != other.ncols {
            return Err(RunnerError::ShapeError {
                expected: format!("{} columns", self.ncols),
                actual: format!("{} columns", other.ncols),
            });
        }
        let offset = self.data.len();
        let mut indptr = self.indptr.clone();
        indptr.extend(other.indptr.iter().skip(1).map(|p| p + offset));
        let mut indices = self.indices.clone();
        indices.extend_from_slice(&other.indices);
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Ok(Self {
            nrows: self.nrows + other.nrows,
            ncols: self.ncols,
            indptr,
            indices,
            data,
        })
    }

    /// Raw buffers in a stable order, for hashing
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 * (self.indptr.len() + 2 * self.data.len()));
        for p in &self.indptr {
            bytes.extend_from_slice(&(*p as u64).to_le_bytes());
        }
        for c in &self.indices {
            bytes.extend_from_slice(&(*c as u64).to_le_bytes());
        }
        for v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }
}
