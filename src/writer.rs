//! Streams batches through a `FeatureExtractor` and dumps the results into a feature store.
//!
//! The store holds four fields:
//!
//! | field        | shape              | dtype | contents                              |
//! |--------------|--------------------|-------|---------------------------------------|
//! | `W`          | (num_classes, D)   | f32   | classifier weight snapshot            |
//! | `all_feats`  | (max_rows, D)      | f32   | feature vectors, rows >= count unset  |
//! | `all_labels` | (max_rows,)        | i32   | labels, entries >= count unset        |
//! | `count`      | (1,)               | i32   | number of valid rows                  |
//!
//! `max_rows` is `num_batches * batch_size`, an upper bound since the last batch may be short.
//! `all_feats` is only allocated once the first batch reveals D, so a run over zero batches
//! produces a store without it.

use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info};
use ndarray::{ArrayView1, ArrayView2, Axis};

use crate::dataset::DataLoader;
use crate::error::{Error, Result};
use crate::model::FeatureExtractor;
use crate::store::{DType, FieldId, StoreWriter};

pub const WEIGHTS_FIELD: &str = "W";
pub const FEATURES_FIELD: &str = "all_feats";
pub const LABELS_FIELD: &str = "all_labels";
pub const COUNT_FIELD: &str = "count";

pub const DEFAULT_PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct DumpOptions
{
    /// Log `i/num_batches` every this many batches. 0 disables progress logging.
    pub progress_every: usize,
}

impl Default for DumpOptions
{
    fn default() -> Self
    {
        DumpOptions { progress_every: DEFAULT_PROGRESS_EVERY }
    }
}

/// What a finished dump wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary
{
    pub path: PathBuf,
    /// Rows allocated for `all_feats` and `all_labels`.
    pub max_rows: usize,
    /// Valid rows, as recorded in `count`.
    pub count: usize,
    /// None when no batch was written.
    pub feature_dim: Option<usize>,
    pub num_classes: usize,
}

struct FeaturesField
{
    id: FieldId,
    dim: usize,
}

/// Writes one feature store. Created with the classifier weights already in place,
/// fed batch by batch with `write_batch()`, and closed with `finish()`.
/// Dropping the writer without `finish()` leaves a store that readers reject.
pub struct FeatureDumpWriter
{
    store: StoreWriter,
    labels: FieldId,
    /// Allocated on the first batch.
    features: Option<FeaturesField>,
    weight_cols: usize,
    num_classes: usize,
    max_rows: usize,
    rows_written: usize,
}

impl FeatureDumpWriter
{
    /// Creates (or truncates) the store at `path`, writes `W` and reserves `max_rows` labels.
    pub fn create(path: impl AsRef<Path>, weights: ArrayView2<f32>, max_rows: usize) -> Result<Self>
    {
        let mut store = StoreWriter::create(path)?;

        // iter() walks in logical row-major order whatever the memory layout.
        let data: Vec<f32> = weights.iter().copied().collect();
        store.write_array(WEIGHTS_FIELD, &[weights.nrows(), weights.ncols()], &data)?;

        let labels = store.allocate(LABELS_FIELD, DType::I32, &[max_rows])?;
        debug!("Created {:?} for up to {} rows", store.path(), max_rows);

        Ok(FeatureDumpWriter {
            store,
            labels,
            features: None,
            weight_cols: weights.ncols(),
            num_classes: weights.nrows(),
            max_rows,
            rows_written: 0,
        })
    }

    pub fn rows_written(&self) -> usize
    {
        self.rows_written
    }

    pub fn max_rows(&self) -> usize
    {
        self.max_rows
    }

    /// Known once the first batch has been written.
    pub fn feature_dim(&self) -> Option<usize>
    {
        self.features.as_ref().map(|f| f.dim)
    }

    /// Appends one batch: row `i` of `features` is labelled `labels[i]`.
    pub fn write_batch(&mut self, features: ArrayView2<f32>, labels: ArrayView1<i32>) -> Result<()>
    {
        let (rows, dim) = features.dim();
        if labels.len() != rows {
            return Err(Error::DataShape(format!(
                "Batch has {} feature rows but {} labels", rows, labels.len())));
        }
        if self.rows_written + rows > self.max_rows {
            return Err(Error::DataShape(format!(
                "Batch of {} rows at offset {} overflows the {} allocated rows",
                rows, self.rows_written, self.max_rows)));
        }

        let features_id = match &self.features
        {
            Some(field) => {
                if field.dim != dim {
                    return Err(Error::DataShape(format!(
                        "Feature dimensionality changed from {} to {}", field.dim, dim)));
                }
                field.id
            },
            None => self.allocate_features(dim)?,
        };

        let feature_data: Vec<f32> = features.iter().copied().collect();
        let labels = labels.to_vec();

        self.store.write_rows(features_id, self.rows_written, &feature_data)?;
        self.store.write_rows(self.labels, self.rows_written, &labels)?;
        self.rows_written += rows;
        Ok(())
    }

    fn allocate_features(&mut self, dim: usize) -> Result<FieldId>
    {
        if self.num_classes > 0 && self.weight_cols != dim {
            return Err(Error::DataShape(format!(
                "Features have dimensionality {} but the classifier weights expect {}", dim, self.weight_cols)));
        }
        let id = self.store.allocate(FEATURES_FIELD, DType::F32, &[self.max_rows, dim])?;
        debug!("Allocated {} with shape ({}, {})", FEATURES_FIELD, self.max_rows, dim);
        self.features = Some(FeaturesField { id, dim });
        Ok(id)
    }

    /// Records `count` and makes the store durable.
    pub fn finish(mut self) -> Result<DumpSummary>
    {
        let count = i32::try_from(self.rows_written)
            .map_err(|_| Error::DataShape(format!("{} rows do not fit the count field", self.rows_written)))?;
        self.store.write_array(COUNT_FIELD, &[1], &[count])?;

        let summary = DumpSummary {
            path: self.store.path().to_path_buf(),
            max_rows: self.max_rows,
            count: self.rows_written,
            feature_dim: self.feature_dim(),
            num_classes: self.num_classes,
        };
        self.store.finish()?;
        Ok(summary)
    }
}

/// Runs every batch of `loader` through `extractor` and dumps features, labels and `weights` to `outfile`.
pub fn save_features<E>(
    extractor: &E,
    loader: &DataLoader,
    weights: ArrayView2<f32>,
    outfile: &Path,
    options: &DumpOptions,
) -> Result<DumpSummary>
where
    E: FeatureExtractor + ?Sized,
{
    let num_batches = loader.len();
    let max_rows = num_batches * loader.batch_size();
    dump_batches(
        extractor,
        loader.iter().map(|batch| batch.map(|b| (b.inputs, b.labels))),
        num_batches,
        max_rows,
        weights,
        outfile,
        options,
    )
}

/// The loader-agnostic core of `save_features()`: batches arrive as `(inputs, labels)` pairs.
pub fn dump_batches<E, I>(
    extractor: &E,
    batches: I,
    num_batches: usize,
    max_rows: usize,
    weights: ArrayView2<f32>,
    outfile: &Path,
    options: &DumpOptions,
) -> Result<DumpSummary>
where
    E: FeatureExtractor + ?Sized,
    I: IntoIterator<Item = Result<(ndarray::Array4<f32>, ndarray::Array1<i32>)>>,
{
    let start = Instant::now();
    let mut writer = FeatureDumpWriter::create(outfile, weights, max_rows)?;

    for (i, batch) in batches.into_iter().enumerate() {
        if options.progress_every > 0 && i % options.progress_every == 0 {
            info!("{}/{}", i, num_batches);
        }
        let (inputs, labels) = batch?;
        let output = extractor.infer(inputs.view())?;
        if output.features.len_of(Axis(0)) != inputs.len_of(Axis(0)) {
            return Err(Error::DataShape(format!(
                "Extractor returned {} feature rows for {} inputs",
                output.features.len_of(Axis(0)), inputs.len_of(Axis(0)))));
        }
        writer.write_batch(output.features.view(), labels.view())?;
    }

    let summary = writer.finish()?;
    info!("Wrote {} rows to {:?} in {:.1?}", summary.count, summary.path, start.elapsed());
    Ok(summary)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::features::FeatureStore;
    use crate::model::Inference;
    use ndarray::{arr1, arr2, Array1, Array2, Array4, ArrayView4};

    /// Features are a deterministic function of the first pixel of each input.
    struct PixelExtractor
    {
        dim: usize,
    }

    impl FeatureExtractor for PixelExtractor
    {
        fn infer(&self, inputs: ArrayView4<f32>) -> anyhow::Result<Inference>
        {
            let n = inputs.len_of(Axis(0));
            let features = Array2::from_shape_fn((n, self.dim), |(i, j)| inputs[[i, 0, 0, 0]] * 100.0 + j as f32);
            Ok(Inference { scores: Array2::zeros((n, 3)), features })
        }
    }

    /// Batch `b` of the given sizes; sample `k` overall has pixel value `k` and label `k * 7`.
    fn batches(sizes: &[usize]) -> Vec<Result<(Array4<f32>, Array1<i32>)>>
    {
        let mut next = 0;
        sizes.iter().map(|&size| {
            let inputs = Array4::from_shape_fn((size, 1, 1, 1), |(i, _, _, _)| (next + i) as f32);
            let labels = Array1::from_shape_fn(size, |i| ((next + i) * 7) as i32);
            next += size;
            Ok((inputs, labels))
        }).collect()
    }

    fn weights(dim: usize) -> Array2<f32>
    {
        Array2::from_shape_fn((3, dim), |(i, j)| i as f32 - j as f32 * 0.25)
    }

    #[test]
    fn short_last_batch_sets_the_true_count()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feats.store");
        let w = weights(8);

        let summary = dump_batches(
            &PixelExtractor { dim: 8 }, batches(&[4, 4, 2]), 3, 12, w.view(), &path, &DumpOptions::default()).unwrap();
        assert_eq!(summary.count, 10);
        assert_eq!(summary.max_rows, 12);
        assert_eq!(summary.feature_dim, Some(8));

        let store = FeatureStore::load(&path).unwrap();
        assert_eq!(store.count(), 10);
        assert_eq!(store.capacity(), 12);
        assert_eq!(store.features().dim(), (10, 8));
        assert_eq!(store.labels(), &Array1::from_shape_fn(10, |i| (i * 7) as i32));
        for i in 0..10 {
            assert_eq!(store.features()[[i, 0]], i as f32 * 100.0);
            assert_eq!(store.features()[[i, 7]], i as f32 * 100.0 + 7.0);
        }
        assert_eq!(store.weights(), &w);
    }

    #[test]
    fn loader_batches_fill_an_upper_bound_of_rows()
    {
        use crate::config::DataConfig;
        use crate::dataset::{DataLoader, ImageDataset, Sample};
        use image::{ImageFormat, Rgb, RgbImage};

        let dir = tempfile::tempdir().unwrap();
        let mut samples = Vec::new();
        for i in 0..10u8 {
            let path = dir.path().join(format!("{}.png", i));
            RgbImage::from_pixel(2, 2, Rgb([i * 20, 0, 0])).save_with_format(&path, ImageFormat::Png).unwrap();
            samples.push(Sample { path, label: 9 - i as i32 });
        }
        let mut config = DataConfig::from_json_str(r#"{ "image_dir": "unused" }"#).unwrap();
        config.batch_size = 4;
        config.image_size = 2;
        config.mean = [0.0; 3];
        config.std = [1.0; 3];
        let loader = DataLoader::new(ImageDataset::from_samples(samples), &config);

        let path = dir.path().join("feats.store");
        let w = weights(2);
        let summary = save_features(&PixelExtractor { dim: 2 }, &loader, w.view(), &path, &DumpOptions::default()).unwrap();
        assert_eq!(summary.max_rows, 12);
        assert_eq!(summary.count, 10);

        let store = FeatureStore::load(&path).unwrap();
        assert_eq!(store.capacity(), 12);
        assert_eq!(store.labels(), &Array1::from_shape_fn(10, |i| 9 - i as i32));
        for i in 0..10 {
            approx::assert_abs_diff_eq!(store.features()[[i, 0]], i as f32 * 20.0 / 255.0 * 100.0, epsilon = 0.5);
        }
    }

    #[test]
    fn zero_batches_write_weights_and_zero_count()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.store");
        let w = weights(4);

        let summary = dump_batches(
            &PixelExtractor { dim: 4 }, batches(&[]), 0, 0, w.view(), &path, &DumpOptions::default()).unwrap();
        assert_eq!(summary.count, 0);
        assert_eq!(summary.feature_dim, None);

        let store = FeatureStore::load(&path).unwrap();
        assert_eq!(store.count(), 0);
        assert!(!store.is_valid());
        assert!(!store.has_feature_field());
        assert_eq!(store.weights(), &w);
    }

    #[test]
    fn rerunning_produces_identical_rows()
    {
        let dir = tempfile::tempdir().unwrap();
        let w = weights(5);
        let mut loaded = Vec::new();
        for name in ["a.store", "b.store"] {
            let path = dir.path().join(name);
            dump_batches(&PixelExtractor { dim: 5 }, batches(&[3, 3, 1]), 3, 9, w.view(), &path, &DumpOptions::default()).unwrap();
            loaded.push(FeatureStore::load(&path).unwrap());
        }
        assert_eq!(loaded[0].count(), loaded[1].count());
        assert_eq!(loaded[0].labels(), loaded[1].labels());
        let bits = |s: &FeatureStore| s.features().iter().map(|v| v.to_bits()).collect::<Vec<u32>>();
        assert_eq!(bits(&loaded[0]), bits(&loaded[1]));
    }

    #[test]
    fn changing_dimensionality_is_a_shape_error()
    {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FeatureDumpWriter::create(dir.path().join("x.store"), Array2::<f32>::zeros((0, 0)).view(), 8).unwrap();

        writer.write_batch(Array2::<f32>::zeros((2, 3)).view(), arr1(&[1, 2]).view()).unwrap();
        assert_eq!(writer.feature_dim(), Some(3));
        let err = writer.write_batch(Array2::<f32>::zeros((2, 4)).view(), arr1(&[1, 2]).view()).unwrap_err();
        assert!(matches!(err, Error::DataShape(_)));
        assert_eq!(writer.rows_written(), 2);
    }

    #[test]
    fn label_count_must_match_feature_rows()
    {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FeatureDumpWriter::create(dir.path().join("x.store"), Array2::<f32>::zeros((0, 0)).view(), 8).unwrap();
        let err = writer.write_batch(Array2::<f32>::zeros((3, 2)).view(), arr1(&[1, 2]).view()).unwrap_err();
        assert!(matches!(err, Error::DataShape(_)));
        assert_eq!(writer.feature_dim(), None);
    }

    #[test]
    fn rows_beyond_capacity_are_rejected()
    {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FeatureDumpWriter::create(dir.path().join("x.store"), Array2::<f32>::zeros((0, 0)).view(), 3).unwrap();
        writer.write_batch(Array2::<f32>::zeros((2, 2)).view(), arr1(&[0, 0]).view()).unwrap();
        assert!(matches!(
            writer.write_batch(Array2::<f32>::zeros((2, 2)).view(), arr1(&[0, 0]).view()),
            Err(Error::DataShape(_))));
    }

    #[test]
    fn features_must_match_classifier_width()
    {
        let dir = tempfile::tempdir().unwrap();
        let w = arr2(&[[1.0f32, 2.0], [3.0, 4.0]]);
        let mut writer = FeatureDumpWriter::create(dir.path().join("x.store"), w.view(), 4).unwrap();
        assert!(matches!(
            writer.write_batch(Array2::<f32>::zeros((1, 3)).view(), arr1(&[0]).view()),
            Err(Error::DataShape(_))));
    }

    #[test]
    fn extractor_errors_abort_the_run()
    {
        struct Failing;
        impl FeatureExtractor for Failing
        {
            fn infer(&self, _inputs: ArrayView4<f32>) -> anyhow::Result<Inference>
            {
                anyhow::bail!("device lost")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.store");
        let err = dump_batches(&Failing, batches(&[2]), 1, 2, weights(2).view(), &path, &DumpOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        // The store was never finalized.
        assert!(FeatureStore::load(&path).is_err());
    }

    #[test]
    fn transposed_weights_are_stored_row_major()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.store");
        let w = arr2(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]);

        let writer = FeatureDumpWriter::create(&path, w.t(), 0).unwrap();
        writer.finish().unwrap();
        assert_eq!(FeatureStore::load(&path).unwrap().weights(), &w.t().to_owned());
    }
}
