use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid feature store: {0}")]
    CorruptStore(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Data shape error: {0}")]
    DataShape(String),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    #[error("Unable to load image {path:?}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Inference failed: {0:#}")]
    Inference(#[from] anyhow::Error),
}

impl Error
{
    /// True for the errors that come from reading or writing the feature store itself.
    pub fn is_storage(&self) -> bool
    {
        matches!(self, Error::Storage { .. } | Error::CorruptStore(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches the offending path to an I/O error.
pub(crate) trait IoResultExt<T> {
    fn at_path(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|source| Error::Storage { path: path.to_path_buf(), source })
    }
}
