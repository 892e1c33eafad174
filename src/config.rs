//! Pipeline entry parameters.
//! Every field has a default, so a JSON config file only needs the fields it changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::objects::CropMode;

pub const DEFAULT_SEED: u64 = 2024;
pub const DEFAULT_RESIZE: u32 = 224;
pub const DEFAULT_MODEL_FAMILY: &str = "efficientnet";
pub const DEFAULT_MODEL_NAME: &str = "EfficientNetB0";
pub const DEFAULT_TRAIN_SIZE: f64 = 0.9;
pub const DEFAULT_MAX_CLUSTERS: usize = 10;
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
pub const DEFAULT_OUTPUT_CSV: &str = "data_split.csv";
pub const DEFAULT_MODELS_DIR: &str = "models";

/// Per-channel mean and standard deviation of the ImageNet training set (RGB order).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How pixel values are scaled before they reach the feature backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Normalization
{
    /// Scale to [0, 1], then standardize with the ImageNet channel statistics.
    #[default]
    Imagenet,
    /// Scale to [0, 1].
    Unit,
    /// Raw 0-255 values.
    #[serde(rename = "none", alias = "raw")]
    Raw,
}

impl Normalization
{
    pub fn apply(&self, channel: usize, value: u8) -> f32
    {
        let value = value as f32;
        match self
        {
            Normalization::Imagenet => (value / 255. - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
            Normalization::Unit => value / 255.,
            Normalization::Raw => value,
        }
    }
}

impl FromStr for Normalization
{
    type Err = Error;

    fn from_str(s: &str) -> Result<Self>
    {
        match s.to_ascii_lowercase().as_str()
        {
            "imagenet" => Ok(Normalization::Imagenet),
            "unit" => Ok(Normalization::Unit),
            "none" | "raw" => Ok(Normalization::Raw),
            other => Err(Error::InvalidConfig(format!("unknown normalization weight scheme {:?}", other))),
        }
    }
}

impl fmt::Display for Normalization
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self
        {
            Normalization::Imagenet => f.write_str("imagenet"),
            Normalization::Unit => f.write_str("unit"),
            Normalization::Raw => f.write_str("none"),
        }
    }
}

/// Identifies one embedding model: a family plus a model name within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor
{
    pub family: String,
    pub name: String,
}

impl fmt::Display for BackendDescriptor
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}/{}", self.family, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig
{
    /// COCO annotation file. Required for object-based strategies.
    pub annotation_file: Option<PathBuf>,
    pub image_dir: PathBuf,
    pub seed: u64,
    pub img_resize_width: u32,
    pub img_resize_height: u32,
    pub model_family: String,
    pub model_name: String,
    pub img_normalization_weight: Normalization,
    pub use_object_features: bool,
    pub parallelize: bool,
    pub insitu: bool,
    pub train_size: f64,
    pub include_testsplit: bool,
    /// Root of the ONNX model tree, laid out as `<family>/<name>.onnx`.
    pub models_dir: PathBuf,
    pub output_csv: PathBuf,
    pub output_json: Option<PathBuf>,
    /// When set, every extracted object is also written here as a PNG.
    pub crop_dir: Option<PathBuf>,
    /// Overrides the crop mode the chosen strategy would use.
    pub crop_mode: Option<CropMode>,
    /// Fixed cluster count. When unset the count is chosen by silhouette score.
    pub num_clusters: Option<usize>,
    pub max_clusters: usize,
    pub max_iterations: usize,
    /// Worker threads for parallel strategies; one per CPU core when unset.
    pub workers: Option<usize>,
    pub show_progress: bool,
}

impl Default for SplitConfig
{
    fn default() -> Self
    {
        SplitConfig {
            annotation_file: None,
            image_dir: PathBuf::new(),
            seed: DEFAULT_SEED,
            img_resize_width: DEFAULT_RESIZE,
            img_resize_height: DEFAULT_RESIZE,
            model_family: DEFAULT_MODEL_FAMILY.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            img_normalization_weight: Normalization::Imagenet,
            use_object_features: false,
            parallelize: false,
            insitu: true,
            train_size: DEFAULT_TRAIN_SIZE,
            include_testsplit: true,
            models_dir: PathBuf::from(DEFAULT_MODELS_DIR),
            output_csv: PathBuf::from(DEFAULT_OUTPUT_CSV),
            output_json: None,
            crop_dir: None,
            crop_mode: None,
            num_clusters: None,
            max_clusters: DEFAULT_MAX_CLUSTERS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            workers: None,
            show_progress: true,
        }
    }
}

impl SplitConfig
{
    pub fn from_file(path: &Path) -> Result<Self>
    {
        let file = std::fs::File::open(path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    pub fn backend_descriptor(&self) -> BackendDescriptor
    {
        BackendDescriptor { family: self.model_family.clone(), name: self.model_name.clone() }
    }

    pub fn validate(&self) -> Result<()>
    {
        if !(self.train_size > 0.0 && self.train_size < 1.0)
        {
            return Err(Error::InvalidConfig(format!("train_size must lie in (0, 1), got {}", self.train_size)));
        }
        if self.img_resize_width == 0 || self.img_resize_height == 0
        {
            return Err(Error::InvalidConfig(format!(
                "resize dimensions must be positive, got {}x{}",
                self.img_resize_width, self.img_resize_height)));
        }
        if self.use_object_features && self.annotation_file.is_none()
        {
            return Err(Error::InvalidConfig("object features need an annotation file".to_string()));
        }
        if self.num_clusters == Some(0)
        {
            return Err(Error::InvalidConfig("num_clusters must be at least 1".to_string()));
        }
        if self.max_clusters < 2
        {
            return Err(Error::InvalidConfig(format!("max_clusters must be at least 2, got {}", self.max_clusters)));
        }
        if self.workers == Some(0)
        {
            return Err(Error::InvalidConfig("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}
