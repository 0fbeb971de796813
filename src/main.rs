use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use featdump::checkpoint::Checkpoint;
use featdump::config::DataConfig;
use featdump::dataset::DataLoader;
use featdump::model::{self, ModelKind};
use featdump::writer::{save_features, DumpOptions};
use log::{error, info};

const DEFAULT_LOG_FILTER: &str = "info";

/// Save features: dumps the classifier weights, the feature vector and the label of every
/// sample in the dataset to a feature store.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args
{
    /// JSON file describing the data to run over
    #[arg(long)]
    cfg: PathBuf,

    /// Feature store to write; its directory is created if needed
    #[arg(long)]
    outfile: PathBuf,

    /// Checkpoint holding the trained parameters
    #[arg(long)]
    modelfile: PathBuf,

    /// Backbone the checkpoint was trained with
    #[arg(long, default_value_t = ModelKind::default().to_string())]
    model: String,

    #[arg(long = "num-classes", visible_alias = "num_classes", default_value_t = 1000)]
    num_classes: usize,
}

fn main() -> anyhow::Result<()>
{
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER)).init();

    let args = Args::parse();
    let result = run(&args);
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn run(args: &Args) -> anyhow::Result<()>
{
    let kind: ModelKind = args.model.parse()?;
    let data_config = DataConfig::load(&args.cfg)
        .with_context(|| format!("Unable to load data config {:?}", args.cfg))?;

    let extractor = model::load_extractor(kind, args.num_classes, &data_config.model_dir)?;
    let weights = Checkpoint::load(&args.modelfile)?.classifier_weight(args.num_classes)?;
    info!("Loaded {} with classifier weights of shape {:?}", kind, weights.dim());

    if let Some(dir) = args.outfile.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.is_dir() {
            fs::create_dir_all(dir).with_context(|| format!("Unable to create {:?}", dir))?;
        }
    }

    let loader = DataLoader::from_config(&data_config)?;
    info!("{} samples in {} batches of up to {}", loader.dataset().len(), loader.len(), loader.batch_size());

    let summary = save_features(&*extractor, &loader, weights.view(), &args.outfile, &DumpOptions::default())?;
    info!(
        "Saved {} of {} rows with {:?}-dimensional features to {:?}",
        summary.count, summary.max_rows, summary.feature_dim, summary.path
    );

    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn defaults_match_the_documented_flags()
    {
        let args = Args::try_parse_from([
            "featdump", "--cfg", "data.json", "--outfile", "out/feats.store", "--modelfile", "model.ckpt",
        ]).unwrap();
        assert_eq!(args.model, "ResNet10");
        assert_eq!(args.num_classes, 1000);

        let args = Args::try_parse_from([
            "featdump", "--cfg", "a", "--outfile", "b", "--modelfile", "c", "--model", "ResNet50", "--num_classes", "64",
        ]).unwrap();
        assert_eq!(args.model, "ResNet50");
        assert_eq!(args.num_classes, 64);
    }

    #[test]
    fn required_flags_are_enforced()
    {
        assert!(Args::try_parse_from(["featdump", "--cfg", "a", "--outfile", "b"]).is_err());
    }

    #[test]
    fn unknown_model_fails_before_touching_files()
    {
        let args = Args::try_parse_from([
            "featdump", "--cfg", "missing.json", "--outfile", "b", "--modelfile", "c", "--model", "VGG16",
        ]).unwrap();
        let err = run(&args).unwrap_err();
        assert!(matches!(err.downcast_ref::<featdump::Error>(), Some(featdump::Error::Config(_))));
    }
}
