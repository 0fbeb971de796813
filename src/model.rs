use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use ndarray::{Array2, ArrayView4};

use crate::error::{Error, Result};

/// Output of one forward pass over a batch.
/// Both arrays have one row per input in the batch.
pub struct Inference
{
    /// Classifier scores, shape (batch_size, num_classes). The dump does not store these.
    pub scores: Array2<f32>,
    /// Penultimate-layer features, shape (batch_size, feature_dim).
    pub features: Array2<f32>,
}

/// Anything that maps a batch of NCHW images to scores and feature vectors.
pub trait FeatureExtractor
{
    fn infer(&self, inputs: ArrayView4<f32>) -> anyhow::Result<Inference>;
}

impl<F> FeatureExtractor for F
where
    F: Fn(ArrayView4<f32>) -> anyhow::Result<Inference>,
{
    fn infer(&self, inputs: ArrayView4<f32>) -> anyhow::Result<Inference>
    {
        self(inputs)
    }
}

/// The backbones a checkpoint can be dumped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelKind
{
    #[default]
    ResNet10,
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
}

impl ModelKind
{
    pub const ALL: [ModelKind; 5] = [
        ModelKind::ResNet10,
        ModelKind::ResNet18,
        ModelKind::ResNet34,
        ModelKind::ResNet50,
        ModelKind::ResNet101,
    ];

    pub fn name(&self) -> &'static str
    {
        match self
        {
            ModelKind::ResNet10 => "ResNet10",
            ModelKind::ResNet18 => "ResNet18",
            ModelKind::ResNet34 => "ResNet34",
            ModelKind::ResNet50 => "ResNet50",
            ModelKind::ResNet101 => "ResNet101",
        }
    }

    /// File name of the exported graph inside the model directory.
    pub fn graph_file_name(&self) -> String
    {
        format!("{}.onnx", self.name())
    }
}

impl Display for ModelKind
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelKind
{
    type Err = Error;

    fn from_str(s: &str) -> Result<Self>
    {
        ModelKind::ALL
            .iter()
            .find(|kind| kind.name() == s)
            .copied()
            .ok_or_else(|| {
                let known: Vec<&str> = ModelKind::ALL.iter().map(|k| k.name()).collect();
                Error::Config(format!("Unknown model {:?}, expected one of {}", s, known.join(", ")))
            })
    }
}

/// Builds the extractor for `kind` from the graph in `model_dir`.
#[cfg(feature = "onnx")]
pub fn load_extractor(kind: ModelKind, num_classes: usize, model_dir: &Path) -> Result<Box<dyn FeatureExtractor>>
{
    let graph = model_dir.join(kind.graph_file_name());
    let extractor = crate::onnx::OnnxExtractor::new(&graph, num_classes)
        .map_err(|e| Error::Config(format!("Unable to load {} from {:?}: {:#}", kind, graph, e)))?;
    Ok(Box::new(extractor))
}

#[cfg(not(feature = "onnx"))]
pub fn load_extractor(kind: ModelKind, _num_classes: usize, model_dir: &Path) -> Result<Box<dyn FeatureExtractor>>
{
    Err(Error::Config(format!(
        "Cannot run {} from {:?}: this build has no inference backend; rebuild with `--features onnx`",
        kind, model_dir.join(kind.graph_file_name()))))
}
