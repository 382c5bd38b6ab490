//! Split resolution: train / valid / test / full sets and CV folds
//!
//! Precedence for every split kind: explicit arrays, then an index view into
//! `X`, then a pre-featurized payload.

use std::sync::Arc;

use ndarray::Array1;

use super::{CvSplit, Dataset, Fold, SplitData};
use crate::constants::cache_keys;
use crate::data::{take_values, RowSelection, TabularView};
use crate::error::{Result, RunnerError};

impl Dataset {
    fn primary(&self) -> Result<(Arc<TabularView>, Arc<Array1<f64>>, Option<Arc<Array1<f64>>>)> {
        let x = self
            .resolve(&self.fields.x, cache_keys::X)?
            .ok_or_else(|| RunnerError::DataError("dataset has no X".to_string()))?;
        let y = self
            .resolve(&self.fields.y, cache_keys::Y)?
            .ok_or_else(|| RunnerError::DataError("dataset has no y".to_string()))?;
        let w = self.resolve(&self.fields.sample_weight, cache_keys::SAMPLE_WEIGHT)?;
        Ok((x, y, w))
    }

    /// Rows of the primary arrays named by an index array
    ///
    /// Frames resolve index arrays by row label, matrices by position.
    fn index_view(&self, rows: &[usize]) -> Result<SplitData> {
        let (x, y, w) = self.primary()?;
        let positions = x.resolve_positions(rows, RowSelection::Label)?;
        Ok(SplitData {
            x: x.take_rows(&positions)?,
            y: take_values(&y, &positions)?,
            sample_weight: w.map(|w| take_values(&w, &positions)).transpose()?,
        })
    }

    fn payload(&self, slot: &Option<Arc<SplitData>>, key: &str) -> Result<Option<SplitData>> {
        Ok(self.resolve(slot, key)?.map(|p| p.as_ref().clone()))
    }

    pub fn get_train_set(&self) -> Result<SplitData> {
        let train_idx = self.train_indices()?;
        if self.x_valid_is_explicit()? && train_idx.is_none() {
            let (x, y, w) = self.primary()?;
            return Ok(SplitData {
                x: x.as_ref().clone(),
                y: y.as_ref().clone(),
                sample_weight: w.map(|w| w.as_ref().clone()),
            });
        }
        if let Some(idx) = train_idx {
            return self.index_view(&idx);
        }
        if let Some(payload) = self.payload(&self.fields.featurized_train, cache_keys::FEATURIZED_TRAIN)? {
            return Ok(payload);
        }
        Err(RunnerError::DataError("dataset has no training split".to_string()))
    }

    pub fn get_valid_set(&self) -> Result<SplitData> {
        if let Some(x_valid) = self.resolve(&self.fields.x_valid, cache_keys::X_VALID)? {
            let y_valid = self
                .resolve(&self.fields.y_valid, cache_keys::Y_VALID)?
                .ok_or_else(|| RunnerError::DataError("X_valid given without y_valid".to_string()))?;
            let w = self.resolve(&self.fields.sample_weight_valid, cache_keys::SAMPLE_WEIGHT_VALID)?;
            return Ok(SplitData {
                x: x_valid.as_ref().clone(),
                y: y_valid.as_ref().clone(),
                sample_weight: w.map(|w| w.as_ref().clone()),
            });
        }
        if let Some(idx) = self.valid_indices()? {
            return self.index_view(&idx);
        }
        if let Some(payload) = self.payload(&self.fields.featurized_valid, cache_keys::FEATURIZED_VALID)? {
            return Ok(payload);
        }
        Err(RunnerError::DataError("dataset has no validation split".to_string()))
    }

    pub fn get_test_set(&self) -> Result<SplitData> {
        if let Some(x_test) = self.resolve(&self.fields.x_test, cache_keys::X_TEST)? {
            let y_test = self
                .resolve(&self.fields.y_test, cache_keys::Y_TEST)?
                .ok_or_else(|| RunnerError::DataError("X_test given without y_test".to_string()))?;
            let w = self.resolve(&self.fields.sample_weight_test, cache_keys::SAMPLE_WEIGHT_TEST)?;
            return Ok(SplitData {
                x: x_test.as_ref().clone(),
                y: y_test.as_ref().clone(),
                sample_weight: w.map(|w| w.as_ref().clone()),
            });
        }
        if let Some(idx) = self.test_indices()? {
            return self.index_view(&idx);
        }
        if let Some(payload) = self.payload(&self.fields.featurized_test, cache_keys::FEATURIZED_TEST)? {
            return Ok(payload);
        }
        Err(RunnerError::DataError("dataset has no test split".to_string()))
    }

    /// The whole corpus
    ///
    /// Featurized-only datasets return train and valid payloads stacked.
    pub fn get_full_set(&self) -> Result<SplitData> {
        if self.resolve(&self.fields.x, cache_keys::X)?.is_some() {
            let (x, y, w) = self.primary()?;
            return Ok(SplitData {
                x: x.as_ref().clone(),
                y: y.as_ref().clone(),
                sample_weight: w.map(|w| w.as_ref().clone()),
            });
        }
        match (
            self.payload(&self.fields.featurized_train, cache_keys::FEATURIZED_TRAIN)?,
            self.payload(&self.fields.featurized_valid, cache_keys::FEATURIZED_VALID)?,
        ) {
            (Some(train), Some(valid)) => train.vstack(&valid),
            (Some(train), None) => Ok(train),
            _ => Err(RunnerError::DataError("dataset has no data".to_string())),
        }
    }

    /// Lazy iterator over CV folds
    ///
    /// Fails with [`RunnerError::DataError`] when the dataset carries no CV
    /// information. Each call starts a fresh pass.
    pub fn get_cv_splits(&self) -> Result<CvSplitIter<'_>> {
        if let Some(splits) = self.cv_split_indices()? {
            return Ok(CvSplitIter {
                dataset: self,
                source: FoldSource::Indices(splits),
                position: 0,
            });
        }
        if let Some(folds) =
            self.resolve(&self.fields.featurized_cv_splits, cache_keys::FEATURIZED_TRAIN_CV_SPLITS)?
        {
            return Ok(CvSplitIter {
                dataset: self,
                source: FoldSource::Featurized(folds),
                position: 0,
            });
        }
        Err(RunnerError::DataError(
            "cross-validation splits were requested but the dataset has none".to_string(),
        ))
    }
}

enum FoldSource {
    Indices(Arc<Vec<CvSplit>>),
    Featurized(Arc<Vec<Fold>>),
}

/// Iterator yielding one materialized [`Fold`] per CV split
pub struct CvSplitIter<'a> {
    dataset: &'a Dataset,
    source: FoldSource,
    position: usize,
}

impl CvSplitIter<'_> {
    pub fn n_folds(&self) -> usize {
        match &self.source {
            FoldSource::Indices(s) => s.len(),
            FoldSource::Featurized(f) => f.len(),
        }
    }

    /// Materialize fold `k`; CV folds always select rows by position
    fn fold(&self, k: usize) -> Result<Fold> {
        match &self.source {
            FoldSource::Featurized(folds) => Ok(folds[k].clone()),
            FoldSource::Indices(splits) => {
                let (x, y, w) = self.dataset.primary()?;
                let split = &splits[k];
                let pick = |rows: &[usize]| -> Result<SplitData> {
                    Ok(SplitData {
                        x: x.take_rows(rows)?,
                        y: take_values(&y, rows)?,
                        sample_weight: w.as_ref().map(|w| take_values(w, rows)).transpose()?,
                    })
                };
                Ok(Fold {
                    train: pick(&split.train)?,
                    test: pick(&split.test)?,
                })
            }
        }
    }
}

impl Iterator for CvSplitIter<'_> {
    type Item = Result<Fold>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.n_folds() {
            return None;
        }
        let fold = CvSplitIter::fold(self, self.position);
        self.position += 1;
        Some(fold)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.n_folds() - self.position;
        (left, Some(left))
    }
}

impl ExactSizeIterator for CvSplitIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LabeledFrame, INDEX_COLUMN};
    use polars::df;
    use crate::problem_info::Task;
    use ndarray::array;

    #[test]
    fn test_index_precedence_and_cv_absent() {
        let ds = Dataset::builder(
            array![[0.0], [1.0], [2.0], [3.0]],
            array![0.0, 1.0, 0.0, 1.0],
            Task::Classification,
        )
        .with_train_valid_indices(vec![0, 1], vec![2, 3])
        .build()
        .unwrap();
        assert_eq!(ds.get_train_set().unwrap().y, array![0.0, 1.0]);
        assert_eq!(ds.get_valid_set().unwrap().x.to_dense().unwrap(), array![[2.0], [3.0]]);
        assert!(ds.get_test_set().is_err());
        assert!(matches!(ds.get_cv_splits(), Err(RunnerError::DataError(_))));
    }

    #[test]
    fn test_frame_uses_labels_for_splits_and_positions_for_cv() {
        let df = df!("f" => &[0.0, 1.0, 2.0, 3.0], INDEX_COLUMN => &[100u64, 101, 102, 103]).unwrap();
        let frame = LabeledFrame::from_polars(df).unwrap();
        let ds = Dataset::builder(frame.clone(), array![0.0, 1.0, 2.0, 3.0], Task::Regression)
            .with_train_valid_indices(vec![101, 103], vec![100])
            .build()
            .unwrap();
        assert_eq!(ds.get_train_set().unwrap().y, array![1.0, 3.0]);

        let cv = Dataset::builder(frame, array![0.0, 1.0, 2.0, 3.0], Task::Regression)
            .with_cv_indices(vec![CvSplit { train: vec![0, 1], test: vec![2, 3] }])
            .build()
            .unwrap();
        let folds: Vec<Fold> = cv.get_cv_splits().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(folds[0].test.y, array![2.0, 3.0]);
    }

    #[test]
    fn test_cv_iterator_is_restartable() {
        let ds = Dataset::builder(
            array![[0.0], [1.0], [2.0], [3.0]],
            array![1.0, 2.0, 3.0, 4.0],
            Task::Regression,
        )
        .with_cv_indices(vec![
            CvSplit { train: vec![0, 1], test: vec![2, 3] },
            CvSplit { train: vec![2, 3], test: vec![0, 1] },
        ])
        .build()
        .unwrap();
        assert_eq!(ds.get_cv_splits().unwrap().len(), 2);
        let first: Vec<_> = ds.get_cv_splits().unwrap().map(|f| f.unwrap().test.y).collect();
        let second: Vec<_> = ds.get_cv_splits().unwrap().map(|f| f.unwrap().test.y).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_explicit_validation_set_wins() {
        let ds = Dataset::train_validate(
            array![[0.0], [1.0]],
            array![0.0, 1.0],
            array![[5.0]],
            array![1.0],
            Task::Classification,
        )
        .unwrap();
        assert_eq!(ds.get_valid_set().unwrap().x.to_dense().unwrap(), array![[5.0]]);
        assert_eq!(ds.get_train_set().unwrap().len(), 2);
    }
}
