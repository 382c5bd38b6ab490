//! Target transforms wrapped around a chain

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};
use crate::pipeline::Params;

/// Applied to `y` before fit, inverted on predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum YTransformer {
    /// `ln(1 + y)`
    Log1p,
    /// `(y - mean) / std`, statistics learned on fit
    Standardize { mean: Option<f64>, std: Option<f64> },
}

impl YTransformer {
    pub fn name(&self) -> &'static str {
        match self {
            YTransformer::Log1p => "Log1pTransformer",
            YTransformer::Standardize { .. } => "TargetStandardizer",
        }
    }

    pub fn log1p_from_params(_p: &mut Params) -> Result<Self> {
        Ok(YTransformer::Log1p)
    }

    pub fn standardize_from_params(_p: &mut Params) -> Result<Self> {
        Ok(YTransformer::Standardize { mean: None, std: None })
    }

    pub fn fit(&mut self, y: &Array1<f64>) -> Result<()> {
        match self {
            YTransformer::Log1p => {
                if y.iter().any(|&v| v <= -1.0) {
                    return Err(RunnerError::DataError("log1p target transform needs y > -1".to_string()));
                }
                Ok(())
            }
            YTransformer::Standardize { mean, std } => {
                let m = y.mean().ok_or_else(|| RunnerError::DataError("empty target".to_string()))?;
                let s = y.std(0.0);
                *mean = Some(m);
                *std = Some(if s > 1e-12 { s } else { 1.0 });
                Ok(())
            }
        }
    }

    pub fn transform(&self, y: &Array1<f64>) -> Result<Array1<f64>> {
        match self {
            YTransformer::Log1p => Ok(y.mapv(f64::ln_1p)),
            YTransformer::Standardize {
                mean: Some(m),
                std: Some(s),
            } => Ok(y.mapv(|v| (v - m) / s)),
            YTransformer::Standardize { .. } => Err(RunnerError::ModelNotFitted),
        }
    }

    pub fn inverse_transform(&self, y: &Array1<f64>) -> Result<Array1<f64>> {
        match self {
            YTransformer::Log1p => Ok(y.mapv(f64::exp_m1)),
            YTransformer::Standardize {
                mean: Some(m),
                std: Some(s),
            } => Ok(y.mapv(|v| v * s + m)),
            YTransformer::Standardize { .. } => Err(RunnerError::ModelNotFitted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_standardize_inverts() {
        let y = array![1.0, 2.0, 3.0, 6.0];
        let mut t = YTransformer::Standardize { mean: None, std: None };
        t.fit(&y).unwrap();
        let back = t.inverse_transform(&t.transform(&y).unwrap()).unwrap();
        for (a, b) in back.iter().zip(y.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_log1p_rejects_out_of_domain() {
        let mut t = YTransformer::Log1p;
        assert!(t.fit(&array![0.0, -1.0]).is_err());
    }
}
