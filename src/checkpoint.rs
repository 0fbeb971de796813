//! Pretrained weights as a bincode-encoded map of parameter names to tensors.
//! Checkpoints written from a data-parallel wrapper carry a `module.` prefix on every name;
//! lookups accept both spellings.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

pub const CLASSIFIER_WEIGHT: &str = "classifier.weight";
const DATA_PARALLEL_PREFIX: &str = "module.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor
{
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StoredTensor
{
    pub fn from_array2(array: &Array2<f32>) -> StoredTensor
    {
        StoredTensor {
            shape: vec![array.nrows(), array.ncols()],
            data: array.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint
{
    pub state: HashMap<String, StoredTensor>,
}

impl Checkpoint
{
    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint>
    {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).at_path(path)?);
        let checkpoint: Checkpoint = bincode::deserialize_from(reader)
            .map_err(|e| Error::Config(format!("Unable to read checkpoint {:?}: {}", path, e)))?;
        debug!("Loaded {} parameters from {:?}", checkpoint.state.len(), path);
        Ok(checkpoint)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()>
    {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path).at_path(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush().at_path(path)?;
        Ok(())
    }

    /// Finds a parameter by name, with or without the data-parallel prefix.
    pub fn get(&self, name: &str) -> Option<&StoredTensor>
    {
        let bare = name.strip_prefix(DATA_PARALLEL_PREFIX).unwrap_or(name);
        self.state
            .get(&format!("{}{}", DATA_PARALLEL_PREFIX, bare))
            .or_else(|| self.state.get(bare))
    }

    /// The final linear layer's weight, shape (num_classes, feature_dim).
    pub fn classifier_weight(&self, num_classes: usize) -> Result<Array2<f32>>
    {
        let tensor = self.get(CLASSIFIER_WEIGHT)
            .ok_or_else(|| Error::Config(format!("Checkpoint has no {:?} parameter", CLASSIFIER_WEIGHT)))?;

        let (rows, cols) = match tensor.shape[..] {
            [rows, cols] => (rows, cols),
            _ => return Err(Error::Config(format!(
                "{:?} should be 2-D, got shape {:?}", CLASSIFIER_WEIGHT, tensor.shape))),
        };
        if rows != num_classes {
            return Err(Error::Config(format!(
                "{:?} has {} rows but the model was asked for {} classes", CLASSIFIER_WEIGHT, rows, num_classes)));
        }

        Array2::from_shape_vec((rows, cols), tensor.data.clone())
            .map_err(|e| Error::Config(format!("Malformed {:?}: {}", CLASSIFIER_WEIGHT, e)))
    }
}
