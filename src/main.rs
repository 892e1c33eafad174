use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use image_splitter::config::{Normalization, SplitConfig};
use image_splitter::pipeline::split_data;
use log::{info, LevelFilter};

#[cfg(debug_assertions)]
const LOG_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
const LOG_LEVEL: LevelFilter = LevelFilter::Info;

#[derive(Parser, Debug)]
#[command(name = "image-splitter", version, about = "Cluster-stratified train/val/test split of an image dataset")]
struct Cli
{
    /// COCO annotation file
    #[arg(long)]
    annotations: Option<PathBuf>,
    /// Directory holding the images
    #[arg(long)]
    images: Option<PathBuf>,
    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Build per-image features from annotated objects
    #[arg(long = "object-features", action = ArgAction::SetTrue)]
    object_features: bool,
    /// Fan feature extraction out over a worker pool
    #[arg(long = "parallel", action = ArgAction::SetTrue)]
    parallel: bool,
    /// Extract every image's objects before featurizing any of them
    #[arg(long = "two-phase", action = ArgAction::SetTrue)]
    two_phase: bool,

    #[arg(long = "train-size")]
    train_size: Option<f64>,
    /// Split into train/val only
    #[arg(long = "no-test-split", action = ArgAction::SetTrue)]
    no_test_split: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Resize width fed to the feature backend
    #[arg(long)]
    width: Option<u32>,
    /// Resize height fed to the feature backend
    #[arg(long)]
    height: Option<u32>,
    #[arg(long = "model-family")]
    model_family: Option<String>,
    #[arg(long = "model-name")]
    model_name: Option<String>,
    /// imagenet, unit or none
    #[arg(long)]
    normalization: Option<Normalization>,
    /// Fixed number of clusters; picked by silhouette score when omitted
    #[arg(long)]
    clusters: Option<usize>,
    /// Directory to save object crops to
    #[arg(long = "crop-dir")]
    crop_dir: Option<PathBuf>,
    #[arg(long = "output-csv")]
    output_csv: Option<PathBuf>,
    #[arg(long = "output-json")]
    output_json: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long = "no-progress", action = ArgAction::SetTrue)]
    no_progress: bool,
}

impl Cli
{
    fn into_config(self) -> anyhow::Result<SplitConfig>
    {
        let mut config = match &self.config
        {
            Some(path) => SplitConfig::from_file(path)
                .with_context(|| format!("Failed to read configuration {:?}", path))?,
            None => SplitConfig::default(),
        };

        if let Some(path) = self.annotations { config.annotation_file = Some(path); }
        if let Some(dir) = self.images { config.image_dir = dir; }
        if self.object_features { config.use_object_features = true; }
        if self.parallel { config.parallelize = true; }
        if self.two_phase { config.insitu = false; }
        if let Some(train_size) = self.train_size { config.train_size = train_size; }
        if self.no_test_split { config.include_testsplit = false; }
        if let Some(seed) = self.seed { config.seed = seed; }
        if let Some(width) = self.width { config.img_resize_width = width; }
        if let Some(height) = self.height { config.img_resize_height = height; }
        if let Some(family) = self.model_family { config.model_family = family; }
        if let Some(name) = self.model_name { config.model_name = name; }
        if let Some(normalization) = self.normalization { config.img_normalization_weight = normalization; }
        if let Some(clusters) = self.clusters { config.num_clusters = Some(clusters); }
        if let Some(dir) = self.crop_dir { config.crop_dir = Some(dir); }
        if let Some(path) = self.output_csv { config.output_csv = path; }
        if let Some(path) = self.output_json { config.output_json = Some(path); }
        if let Some(workers) = self.workers { config.workers = Some(workers); }
        if self.no_progress { config.show_progress = false; }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(LOG_LEVEL)
        .parse_default_env()
        .init();

    let config = Cli::parse().into_config()?;
    info!("Splitting images in {:?}", config.image_dir);

    let result = split_data(&config).context("Failed to split the dataset")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
