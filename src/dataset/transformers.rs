//! Fitted transformers travelling with a dataset

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::SplitData;
use crate::data::{take_values, TabularView};
use crate::error::{Result, RunnerError};
use crate::estimators::Preprocessor;
use crate::problem_info::TimeseriesParams;

/// Fitted featurizer applied to X before it reached the dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Featurizer {
    pub feature_names: Vec<String>,
    pub step: Preprocessor,
}

/// Maps original class labels to the encoded labels stored in `y`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<f64>,
}

impl LabelEncoder {
    /// Encoder over the sorted distinct values of `y`
    pub fn fit(y: &Array1<f64>) -> Self {
        let mut classes: Vec<f64> = y.iter().copied().collect();
        classes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        classes.dedup();
        Self { classes }
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    pub fn transform(&self, y: &Array1<f64>) -> Result<Array1<f64>> {
        y.iter()
            .map(|v| {
                self.classes
                    .iter()
                    .position(|c| c == v)
                    .map(|p| p as f64)
                    .ok_or_else(|| RunnerError::DataError(format!("unknown label {}", v)))
            })
            .collect()
    }

    /// Decode encoded labels; out-of-range codes become NaN
    pub fn inverse_transform(&self, encoded: &Array1<f64>) -> Array1<f64> {
        encoded.mapv(|code| {
            if code.is_finite() && code >= 0.0 {
                self.classes.get(code as usize).copied().unwrap_or(f64::NAN)
            } else {
                f64::NAN
            }
        })
    }
}

/// Featurization state for timeseries datasets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesTransformer {
    pub params: TimeseriesParams,
    pub feature_names: Vec<String>,
    /// Column holding 1.0 where the target was imputed
    pub imputed_target_column: Option<usize>,
    /// Column holding the grain identifier
    pub grain_column: Option<usize>,
    pub horizon_column: Option<usize>,
}

impl TimeseriesTransformer {
    pub fn new(params: TimeseriesParams, feature_names: Vec<String>) -> Self {
        let position = |name: &Option<String>| {
            name.as_ref()
                .and_then(|n| feature_names.iter().position(|f| f == n))
        };
        let imputed_target_column = position(&params.target_imputed_column);
        let grain_column = params
            .grain_column_names
            .first()
            .and_then(|g| feature_names.iter().position(|f| f == g));
        let horizon_column = position(&params.horizon_column);
        Self {
            params,
            feature_names,
            imputed_target_column,
            grain_column,
            horizon_column,
        }
    }

    /// Drop rows whose target was imputed during featurization
    pub fn remove_imputed_rows(&self, data: SplitData) -> Result<SplitData> {
        let column = match self.imputed_target_column {
            Some(c) => c,
            None => return Ok(data),
        };
        if column >= data.x.ncols() {
            return Err(RunnerError::DataError(format!(
                "imputed-target column {} missing from {} features",
                column,
                data.x.ncols()
            )));
        }
        let keep: Vec<usize> = data
            .x
            .column(column)?
            .iter()
            .enumerate()
            .filter(|(_, &flag)| flag != 1.0)
            .map(|(i, _)| i)
            .collect();
        if keep.len() == data.y.len() {
            return Ok(data);
        }
        Ok(SplitData {
            x: data.x.take_rows(&keep)?,
            y: take_values(&data.y, &keep)?,
            sample_weight: data
                .sample_weight
                .as_ref()
                .map(|w| take_values(w, &keep))
                .transpose()?,
        })
    }

    /// Grain identifier per row, when a grain column is known
    pub fn grain_ids(&self, x: &TabularView) -> Option<Vec<f64>> {
        column_values(x, self.grain_column?)
    }

    /// Forecast horizon per row; NaN marks an unknown horizon
    pub fn horizons(&self, x: &TabularView) -> Option<Vec<f64>> {
        column_values(x, self.horizon_column?)
    }
}

fn column_values(x: &TabularView, column: usize) -> Option<Vec<f64>> {
    x.column(column).ok()
}

/// Named transformers fitted upstream of the dataset; each may be absent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetTransformers {
    pub x_transformer: Option<Featurizer>,
    pub y_transformer: Option<LabelEncoder>,
    pub timeseries_transformer: Option<TimeseriesTransformer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_label_encoder_roundtrip() {
        let enc = LabelEncoder::fit(&array![5.0, 2.0, 5.0, 9.0]);
        assert_eq!(enc.classes(), &[2.0, 5.0, 9.0]);
        let codes = enc.transform(&array![9.0, 2.0]).unwrap();
        assert_eq!(codes, array![2.0, 0.0]);
        assert_eq!(enc.inverse_transform(&codes), array![9.0, 2.0]);
        assert!(enc.inverse_transform(&array![7.0])[0].is_nan());
    }

    #[test]
    fn test_remove_imputed_rows() {
        let mut params = TimeseriesParams::new("t");
        params.target_imputed_column = Some("imputed".to_string());
        let ts = TimeseriesTransformer::new(params, vec!["lag".to_string(), "imputed".to_string()]);
        let data = SplitData {
            x: TabularView::Dense(array![[1.0, 0.0], [2.0, 1.0], [3.0, 0.0]]),
            y: array![10.0, 20.0, 30.0],
            sample_weight: None,
        };
        let kept = ts.remove_imputed_rows(data).unwrap();
        assert_eq!(kept.y, array![10.0, 30.0]);
        assert_eq!(kept.x.nrows(), 2);
    }
}
