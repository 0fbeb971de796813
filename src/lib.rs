pub mod error;
pub mod store;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod writer;
pub mod features;

pub use error::{Error, Result};
pub use features::FeatureStore;
pub use model::{FeatureExtractor, Inference, ModelKind};
pub use writer::{save_features, DumpOptions, DumpSummary, FeatureDumpWriter};
