//! Ordered, batched image loading for the dump.
//! Samples are never shuffled: row `i` of the feature store is sample `i` of the dataset.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::RgbImage;
use log::{info, warn};
use ndarray::{Array1, Array4};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use walkdir::WalkDir;

use crate::config::{DataConfig, DataSource};
use crate::error::{Error, IoResultExt, Result};

const SUPPORTED_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample
{
    pub path: PathBuf,
    pub label: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ImageDataset
{
    samples: Vec<Sample>,
    /// Class names indexed by label, when the dataset was read from a class-per-directory tree.
    classes: Vec<String>,
}

impl ImageDataset
{
    pub fn from_samples(samples: Vec<Sample>) -> ImageDataset
    {
        ImageDataset { samples, classes: Vec::new() }
    }

    pub fn from_source(source: &DataSource) -> Result<ImageDataset>
    {
        match source
        {
            DataSource::ImageDir(dir) => ImageDataset::from_image_dir(dir),
            DataSource::ImageList(list) => ImageDataset::from_image_list(list),
        }
    }

    /// Reads `root/<class>/<image>`. Labels are the indices of the class names in sorted order.
    pub fn from_image_dir(root: &Path) -> Result<ImageDataset>
    {
        if !root.is_dir() {
            return Err(Error::Config(format!("{:?} is not a directory", root)));
        }

        let mut class_dirs = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| walk_error(root, e))?;
            if entry.file_type().is_dir() {
                class_dirs.push(entry.into_path());
            }
        }

        let mut samples = Vec::new();
        let mut classes = Vec::with_capacity(class_dirs.len());
        for (label, class_dir) in class_dirs.iter().enumerate() {
            let label = i32::try_from(label)
                .map_err(|_| Error::Config(format!("Too many classes under {:?}", root)))?;
            classes.push(class_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());

            for entry in WalkDir::new(class_dir).follow_links(true).sort_by_file_name() {
                let entry = entry.map_err(|e| walk_error(class_dir, e))?;
                if entry.file_type().is_file() && has_image_extension(entry.path()) {
                    samples.push(Sample { path: entry.into_path(), label });
                }
            }
        }

        if samples.is_empty() {
            warn!("No images found under {:?}", root);
        }
        info!("Found {} images in {} classes under {:?}", samples.len(), classes.len(), root);
        Ok(ImageDataset { samples, classes })
    }

    /// Reads a list of `path label` lines. Blank lines and lines starting with `#` are skipped;
    /// relative paths are taken relative to the list file.
    pub fn from_image_list(list: &Path) -> Result<ImageDataset>
    {
        let text = fs::read_to_string(list).at_path(list)?;
        let base = list.parent().unwrap_or_else(|| Path::new(""));

        let mut samples = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Split on the last whitespace so paths may contain spaces.
            let (path, label) = line
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| Error::Config(format!("{:?}:{}: expected `path label`", list, line_no + 1)))?;
            let label: i32 = label.parse()
                .map_err(|_| Error::Config(format!("{:?}:{}: bad label {:?}", list, line_no + 1, label)))?;

            let path = PathBuf::from(path.trim_end());
            let path = if path.is_relative() { base.join(path) } else { path };
            samples.push(Sample { path, label });
        }

        info!("Read {} samples from {:?}", samples.len(), list);
        Ok(ImageDataset::from_samples(samples))
    }

    pub fn len(&self) -> usize
    {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample]
    {
        &self.samples
    }

    pub fn classes(&self) -> &[String]
    {
        &self.classes
    }
}

/// Directory entries that cannot be read abort the scan instead of being skipped.
fn walk_error(root: &Path, err: walkdir::Error) -> Error
{
    let path = err.path().unwrap_or(root).to_path_buf();
    let message = err.to_string();
    let source = err.into_io_error().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message));
    Error::Storage { path, source }
}

fn has_image_extension(path: &Path) -> bool
{
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// One batch: NCHW inputs of shape (n, 3, image_size, image_size) and n labels.
pub struct Batch
{
    pub inputs: Array4<f32>,
    pub labels: Array1<i32>,
}

pub struct DataLoader
{
    dataset: ImageDataset,
    batch_size: usize,
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl DataLoader
{
    pub fn new(dataset: ImageDataset, config: &DataConfig) -> DataLoader
    {
        DataLoader {
            dataset,
            batch_size: config.batch_size,
            image_size: config.image_size,
            mean: config.mean,
            std: config.std,
        }
    }

    /// Reads the dataset named by the config and wraps it in a loader.
    pub fn from_config(config: &DataConfig) -> Result<DataLoader>
    {
        let dataset = ImageDataset::from_source(&config.source()?)?;
        Ok(DataLoader::new(dataset, config))
    }

    /// Number of batches; the last one may be short.
    pub fn len(&self) -> usize
    {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool
    {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize
    {
        self.batch_size
    }

    pub fn dataset(&self) -> &ImageDataset
    {
        &self.dataset
    }

    pub fn iter(&self) -> Batches<'_>
    {
        Batches { loader: self, chunks: self.dataset.samples.chunks(self.batch_size) }
    }

    fn load_batch(&self, samples: &[Sample]) -> Result<Batch>
    {
        // Decode and resize in parallel; collect() keeps the sample order.
        let images = samples.par_iter().map(|sample| -> Result<RgbImage> {
            let img = image::open(&sample.path)
                .map_err(|source| Error::Dataset { path: sample.path.clone(), source })?;
            Ok(img.resize_exact(self.image_size, self.image_size, FilterType::CatmullRom).to_rgb8())
        }).collect::<Result<Vec<RgbImage>>>()?;

        let inputs = self.to_nchw(&images);
        let labels = samples.iter().map(|s| s.label).collect::<Array1<i32>>();
        Ok(Batch { inputs, labels })
    }

    fn to_nchw(&self, images: &[RgbImage]) -> Array4<f32>
    {
        let size = self.image_size as usize;
        let mut input = Array4::zeros((images.len(), 3, size, size));
        for (idx, img) in images.iter().enumerate() {
            for (x, y, pixel) in img.enumerate_pixels() {
                let (x, y) = (x as usize, y as usize);
                for c in 0..3 {
                    let value = pixel.0[c] as f32 / 255.;
                    input[[idx, c, y, x]] = (value - self.mean[c]) / self.std[c];
                }
            }
        }
        input
    }
}

pub struct Batches<'a>
{
    loader: &'a DataLoader,
    chunks: std::slice::Chunks<'a, Sample>,
}

impl<'a> Iterator for Batches<'a>
{
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item>
    {
        self.chunks.next().map(|chunk| self.loader.load_batch(chunk))
    }

    fn size_hint(&self) -> (usize, Option<usize>)
    {
        self.chunks.size_hint()
    }
}

impl<'a> ExactSizeIterator for Batches<'a> {}

#[cfg(test)]
mod tests
{
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{ImageFormat, Rgb};

    fn write_image(path: &Path, color: [u8; 3])
    {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(4, 4, Rgb(color)).save_with_format(path, ImageFormat::Png).unwrap();
    }

    fn config(batch_size: usize) -> DataConfig
    {
        let mut config = DataConfig::from_json_str(r#"{ "image_dir": "unused" }"#).unwrap();
        config.batch_size = batch_size;
        config.image_size = 4;
        config.mean = [0.0; 3];
        config.std = [1.0; 3];
        config
    }

    #[test]
    fn class_directories_are_labelled_in_sorted_order()
    {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("dog/b.png"), [0, 0, 0]);
        write_image(&dir.path().join("cat/a.png"), [0, 0, 0]);
        write_image(&dir.path().join("cat/c.PNG"), [0, 0, 0]);
        fs::write(dir.path().join("cat/notes.txt"), "not an image").unwrap();

        let dataset = ImageDataset::from_image_dir(dir.path()).unwrap();
        assert_eq!(dataset.classes(), &["cat".to_string(), "dog".to_string()]);
        let labels: Vec<i32> = dataset.samples().iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![0, 0, 1]);
        assert!(dataset.samples()[0].path.ends_with("cat/a.png"));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entries_abort_the_scan()
    {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a/x.png"), [0, 0, 0]);
        write_image(&dir.path().join("c/y.png"), [0, 0, 0]);
        symlink(dir.path().join("gone"), dir.path().join("b")).unwrap();
        let err = ImageDataset::from_image_dir(dir.path()).err().unwrap();
        assert!(matches!(err, Error::Storage { ref path, .. } if path.ends_with("b")));

        fs::remove_file(dir.path().join("b")).unwrap();
        symlink(dir.path().join("gone.png"), dir.path().join("c/z.png")).unwrap();
        let err = ImageDataset::from_image_dir(dir.path()).err().unwrap();
        assert!(err.is_storage());
    }

    #[cfg(unix)]
    #[test]
    fn linked_class_directories_are_followed()
    {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("store/a/x.png"), [0, 0, 0]);
        write_image(&dir.path().join("data/b/y.png"), [0, 0, 0]);
        std::os::unix::fs::symlink(dir.path().join("store/a"), dir.path().join("data/a")).unwrap();

        let dataset = ImageDataset::from_image_dir(&dir.path().join("data")).unwrap();
        assert_eq!(dataset.classes(), &["a".to_string(), "b".to_string()]);
        let labels: Vec<i32> = dataset.samples().iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![0, 1]);
    }

    #[test]
    fn image_list_parses_paths_and_labels()
    {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("val.txt");
        fs::write(&list, "# header\nimgs/a b.png 3\n\n/abs/c.png 7\n").unwrap();

        let dataset = ImageDataset::from_image_list(&list).unwrap();
        assert_eq!(dataset.samples(), &[
            Sample { path: dir.path().join("imgs/a b.png"), label: 3 },
            Sample { path: PathBuf::from("/abs/c.png"), label: 7 },
        ]);

        fs::write(&list, "imgs/a.png three\n").unwrap();
        assert!(matches!(ImageDataset::from_image_list(&list), Err(Error::Config(_))));
    }

    #[test]
    fn batches_keep_order_and_the_last_one_is_short()
    {
        let dir = tempfile::tempdir().unwrap();
        let mut samples = Vec::new();
        for i in 0..5u8 {
            let path = dir.path().join(format!("{}.png", i));
            write_image(&path, [i * 50, 0, 255]);
            samples.push(Sample { path, label: i as i32 * 10 });
        }

        let loader = DataLoader::new(ImageDataset::from_samples(samples), &config(2));
        assert_eq!(loader.len(), 3);
        assert_eq!(loader.iter().len(), 3);

        let batches: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.labels.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[0].inputs.dim(), (2, 3, 4, 4));
        assert_eq!(batches[1].labels.to_vec(), vec![20, 30]);

        // Red channel encodes the sample index.
        assert_abs_diff_eq!(batches[1].inputs[[1, 0, 2, 2]], 150.0 / 255.0, epsilon = 1e-2);
        assert_abs_diff_eq!(batches[2].inputs[[0, 2, 0, 0]], 1.0, epsilon = 1e-2);
    }

    #[test]
    fn unreadable_image_aborts_the_batch()
    {
        let dir = tempfile::tempdir().unwrap();
        let samples = vec![Sample { path: dir.path().join("missing.png"), label: 0 }];
        let loader = DataLoader::new(ImageDataset::from_samples(samples), &config(4));
        let err = loader.iter().next().unwrap().err().unwrap();
        assert!(matches!(err, Error::Dataset { .. }));
    }
}
