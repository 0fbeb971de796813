//! Reading a dumped feature store back.

use std::path::Path;

use ndarray::{Array1, Array2};

use crate::error::{Error, Result};
use crate::store::StoreReader;
use crate::writer::{COUNT_FIELD, FEATURES_FIELD, LABELS_FIELD, WEIGHTS_FIELD};

/// The valid part of a feature store: the classifier weights plus the first `count`
/// feature rows and labels. Rows past `count` are never read.
#[derive(Debug, Clone)]
pub struct FeatureStore
{
    weights: Array2<f32>,
    features: Array2<f32>,
    labels: Array1<i32>,
    capacity: usize,
    has_feature_field: bool,
}

impl FeatureStore
{
    /// Fails on stores that were never finalized or have no `count`.
    pub fn load(path: impl AsRef<Path>) -> Result<FeatureStore>
    {
        let mut reader = StoreReader::open(path.as_ref())?;

        let count = reader.read_i32_1d(COUNT_FIELD)?;
        let count = match count.as_slice() {
            Some([count]) => usize::try_from(*count)
                .map_err(|_| Error::CorruptStore(format!("Negative count {}", count)))?,
            _ => return Err(Error::CorruptStore(format!("{} should hold one value", COUNT_FIELD))),
        };

        let weights = reader.read_f32_2d(WEIGHTS_FIELD)?;
        let capacity = reader.field(LABELS_FIELD)
            .map(|f| f.rows())
            .ok_or_else(|| Error::CorruptStore(format!("Missing field {:?}", LABELS_FIELD)))?;
        if count > capacity {
            return Err(Error::CorruptStore(format!("count {} exceeds the {} allocated rows", count, capacity)));
        }
        let labels = reader.read_i32_prefix(LABELS_FIELD, count)?;

        let has_feature_field = reader.field(FEATURES_FIELD).is_some();
        let features = if has_feature_field {
            reader.read_f32_rows(FEATURES_FIELD, count)?
        } else if count == 0 {
            Array2::zeros((0, weights.ncols()))
        } else {
            return Err(Error::CorruptStore(format!("{} valid rows but no {:?} field", count, FEATURES_FIELD)));
        };

        Ok(FeatureStore { weights, features, labels, capacity, has_feature_field })
    }

    /// A store with no rows is not worth consuming.
    pub fn is_valid(&self) -> bool
    {
        self.count() > 0
    }

    pub fn count(&self) -> usize
    {
        self.labels.len()
    }

    /// Rows allocated on disk, valid or not.
    pub fn capacity(&self) -> usize
    {
        self.capacity
    }

    pub fn weights(&self) -> &Array2<f32>
    {
        &self.weights
    }

    /// Shape (count, D).
    pub fn features(&self) -> &Array2<f32>
    {
        &self.features
    }

    pub fn labels(&self) -> &Array1<i32>
    {
        &self.labels
    }

    pub fn feature_dim(&self) -> usize
    {
        self.features.ncols()
    }

    /// False when the run saw no batches and `all_feats` was never allocated.
    pub fn has_feature_field(&self) -> bool
    {
        self.has_feature_field
    }
}
