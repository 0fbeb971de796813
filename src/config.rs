//! The data configuration file, JSON:
//!
//! ```json
//! { "image_dir": "val", "batch_size": 256, "image_size": 224 }
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

pub const DEFAULT_BATCH_SIZE: usize = 256;
pub const DEFAULT_IMAGE_SIZE: u32 = 224;
// ImageNet channel statistics
pub const DEFAULT_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const DEFAULT_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn default_batch_size() -> usize { DEFAULT_BATCH_SIZE }
fn default_image_size() -> u32 { DEFAULT_IMAGE_SIZE }
fn default_mean() -> [f32; 3] { DEFAULT_MEAN }
fn default_std() -> [f32; 3] { DEFAULT_STD }
fn default_model_dir() -> PathBuf { PathBuf::from("models") }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig
{
    /// A directory with one subdirectory of images per class.
    #[serde(default)]
    pub image_dir: Option<PathBuf>,
    /// A text file with one `path label` pair per line.
    #[serde(default)]
    pub image_list: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Images are resized to `image_size` x `image_size`.
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    /// Where exported graphs live, see `ModelKind::graph_file_name()`.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource
{
    ImageDir(PathBuf),
    ImageList(PathBuf),
}

impl DataConfig
{
    pub fn load(path: impl AsRef<Path>) -> Result<DataConfig>
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path).at_path(path)?;
        let mut config = DataConfig::from_json_str(&text)?;

        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<DataConfig>
    {
        let config: DataConfig = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("Malformed data config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()>
    {
        self.source()?;
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.image_size == 0 {
            return Err(Error::Config("image_size must be positive".to_string()));
        }
        if self.std.iter().any(|s| *s == 0.0) {
            return Err(Error::Config(format!("std must be non-zero, got {:?}", self.std)));
        }
        Ok(())
    }

    pub fn source(&self) -> Result<DataSource>
    {
        match (&self.image_dir, &self.image_list)
        {
            (Some(dir), None) => Ok(DataSource::ImageDir(dir.clone())),
            (None, Some(list)) => Ok(DataSource::ImageList(list.clone())),
            (Some(_), Some(_)) => Err(Error::Config("Set only one of image_dir and image_list".to_string())),
            (None, None) => Err(Error::Config("One of image_dir or image_list is required".to_string())),
        }
    }

    fn resolve_relative_to(&mut self, base: &Path)
    {
        for path in [&mut self.image_dir, &mut self.image_list].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if self.model_dir.is_relative() {
            self.model_dir = base.join(&self.model_dir);
        }
    }
}
