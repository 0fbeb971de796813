use std::path::Path;

use anyhow::Context;
use log::info;
use ndarray::{Array2, ArrayView4, Axis, Ix2};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use crate::model::{FeatureExtractor, Inference};

const INTRA_THREADS: usize = 4;

/// A backbone exported to ONNX with two outputs:
/// `SCORES` of shape (batch_size, num_classes) and `FEATURES` of shape (batch_size, feature_dim).
/// The single input is an NCHW `f32` image batch.
pub struct OnnxExtractor
{
    session: Session,
    num_classes: usize,
}

impl OnnxExtractor
{
    pub fn new(graph: &Path, num_classes: usize) -> anyhow::Result<Self>
    {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(INTRA_THREADS)?
            .with_execution_providers([CPUExecutionProvider::default().build()])?
            .commit_from_file(graph)?;
        info!("Loaded ONNX graph {:?}", graph);

        Ok(OnnxExtractor { session, num_classes })
    }
}

impl FeatureExtractor for OnnxExtractor
{
    fn infer(&self, inputs: ArrayView4<f32>) -> anyhow::Result<Inference>
    {
        let batch_len = inputs.len_of(Axis(0));
        let outputs = self.session.run(ort::inputs![inputs.to_owned()]?)?;

        let scores: Array2<f32> = outputs["SCORES"]
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix2>()
            .context("SCORES output is not 2-D")?
            .to_owned();
        let features: Array2<f32> = outputs["FEATURES"]
            .try_extract_tensor::<f32>()?
            .into_dimensionality::<Ix2>()
            .context("FEATURES output is not 2-D")?
            .to_owned();

        if scores.dim() != (batch_len, self.num_classes) {
            anyhow::bail!("Expected scores of shape ({}, {}), got {:?}", batch_len, self.num_classes, scores.dim());
        }
        if features.len_of(Axis(0)) != batch_len {
            anyhow::bail!("Expected {} feature rows, got {}", batch_len, features.len_of(Axis(0)));
        }

        Ok(Inference { scores, features })
    }
}
