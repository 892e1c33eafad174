//! Feature backends: the built-in pooled and projection embedders, and ONNX
//! models loaded through `ort`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use ndarray::{s, Array2, ArrayView4, Axis};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::BackendDescriptor;
use crate::error::{Error, Result};

pub const POOLED_FAMILY: &str = "pooled";
pub const PROJECTION_FAMILY: &str = "projection";

const ONNX_INTRA_THREADS: usize = 4;
const PROJECTION_GRID: usize = 8;

/// Maps a batch of preprocessed images to one embedding per image.
///
/// The input is an NCHW batch produced by `preprocessing::prepare_batch`.
/// The output has one row per image, and every row produced by one backend
/// instance has the same length.
pub trait FeatureBackend: Send + Sync
{
    fn descriptor(&self) -> &BackendDescriptor;

    fn embed(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>>;
}

/// Picks the backend named by the descriptor.
///
/// `pooled/gridN` and `projection/rpD` are built in; any other family is
/// looked up as an ONNX model at `<models_dir>/<family>/<name>.onnx`.
pub fn load_backend(descriptor: &BackendDescriptor, models_dir: &Path, seed: u64) -> Result<Arc<dyn FeatureBackend>>
{
    let backend: Arc<dyn FeatureBackend> = match descriptor.family.as_str()
    {
        POOLED_FAMILY => Arc::new(PooledColorBackend::new(descriptor.clone())?),
        PROJECTION_FAMILY => Arc::new(RandomProjectionBackend::new(descriptor.clone(), seed)?),
        _ => Arc::new(OnnxBackend::new(descriptor.clone(), models_dir)?),
    };
    info!("Using feature backend {}", descriptor);
    Ok(backend)
}

/// Parses the numeric suffix of a model name such as `grid4` or `rp128`.
fn name_parameter(descriptor: &BackendDescriptor, prefix: &str) -> Result<usize>
{
    descriptor.name
        .strip_prefix(prefix)
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| Error::InvalidConfig(format!(
            "model name {:?} for family {:?} must look like {}<positive integer>",
            descriptor.name, descriptor.family, prefix)))
}

/// Average-pools every channel onto a `grid` x `grid` layout.
/// Returns shape (batch, 3 * grid * grid); cells are channel-major.
fn grid_pool(batch: ArrayView4<f32>, grid: usize) -> Array2<f32>
{
    let (n, channels, height, width) = batch.dim();
    let mut pooled = Array2::zeros((n, channels * grid * grid));
    for (idx, image) in batch.outer_iter().enumerate()
    {
        for c in 0..channels
        {
            for gy in 0..grid
            {
                let (y0, y1) = (gy * height / grid, ((gy + 1) * height / grid).max(gy * height / grid + 1).min(height));
                for gx in 0..grid
                {
                    let (x0, x1) = (gx * width / grid, ((gx + 1) * width / grid).max(gx * width / grid + 1).min(width));
                    let cell = image.slice(s![c, y0..y1, x0..x1]);
                    pooled[[idx, (c * grid + gy) * grid + gx]] = cell.mean().unwrap_or(0.0);
                }
            }
        }
    }
    pooled
}

/// Normalize each row to unit L2 length; zero rows are left untouched.
pub fn normalize_feature_vectors(feature_vectors: &mut Array2<f32>)
{
    feature_vectors.axis_iter_mut(Axis(0)).for_each(|mut row| {
        let norm = row.dot(&row).sqrt();
        if norm == 0.0 {
            return;
        }
        row /= norm;
    });
}

/// Colour-layout embedding: the mean of every channel over an N x N grid.
/// Needs no model files, which makes it the backend of choice for tests and dry runs.
pub struct PooledColorBackend
{
    descriptor: BackendDescriptor,
    grid: usize,
}

impl PooledColorBackend
{
    pub fn new(descriptor: BackendDescriptor) -> Result<Self>
    {
        let grid = name_parameter(&descriptor, "grid")?;
        Ok(PooledColorBackend { descriptor, grid })
    }
}

impl FeatureBackend for PooledColorBackend
{
    fn descriptor(&self) -> &BackendDescriptor
    {
        &self.descriptor
    }

    fn embed(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>>
    {
        Ok(grid_pool(batch, self.grid))
    }
}

/// Pools onto an 8 x 8 grid and projects onto `D` dimensions with a random
/// matrix drawn from the run seed. Equal seeds give equal projections.
pub struct RandomProjectionBackend
{
    descriptor: BackendDescriptor,
    projection: Array2<f32>,
}

impl RandomProjectionBackend
{
    pub fn new(descriptor: BackendDescriptor, seed: u64) -> Result<Self>
    {
        let dimension = name_parameter(&descriptor, "rp")?;
        let inputs = 3 * PROJECTION_GRID * PROJECTION_GRID;
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (dimension as f32).sqrt();
        let projection = Array2::from_shape_fn((inputs, dimension), |_| rng.random_range(-1.0f32..1.0) * scale);
        Ok(RandomProjectionBackend { descriptor, projection })
    }
}

impl FeatureBackend for RandomProjectionBackend
{
    fn descriptor(&self) -> &BackendDescriptor
    {
        &self.descriptor
    }

    fn embed(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>>
    {
        let pooled = grid_pool(batch, PROJECTION_GRID);
        Ok(pooled.dot(&self.projection))
    }
}

/// A pretrained embedding network exported to ONNX.
///
/// The model must take a single NCHW `f32` input and produce the embedding as
/// its first output; any trailing dimensions (e.g. pooled `1 x 1` spatial axes)
/// are flattened into the feature vector.
pub struct OnnxBackend
{
    descriptor: BackendDescriptor,
    session: Session,
}

impl OnnxBackend
{
    pub fn model_path(descriptor: &BackendDescriptor, models_dir: &Path) -> PathBuf
    {
        models_dir.join(&descriptor.family).join(format!("{}.onnx", descriptor.name))
    }

    pub fn new(descriptor: BackendDescriptor, models_dir: &Path) -> Result<Self>
    {
        let path = Self::model_path(&descriptor, models_dir);
        if !path.is_file()
        {
            return Err(Error::InvalidConfig(format!(
                "no ONNX model for {} at {:?}", descriptor, path)));
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(ONNX_INTRA_THREADS)?
            .commit_from_file(&path)?;

        info!("Loaded ONNX model {:?}", path);
        Ok(OnnxBackend { descriptor, session })
    }
}

impl FeatureBackend for OnnxBackend
{
    fn descriptor(&self) -> &BackendDescriptor
    {
        &self.descriptor
    }

    fn embed(&self, batch: ArrayView4<f32>) -> Result<Array2<f32>>
    {
        let batch_len = batch.len_of(Axis(0));
        let outputs = self.session.run(ort::inputs![batch.to_owned()]?)?;

        let output_name = self.session.outputs[0].name.as_str();
        let output = outputs[output_name].try_extract_tensor::<f32>()?;

        // First dimension is for each image in the batch; the rest is the feature vector per image.
        let feature_len = output.len() / batch_len.max(1);
        let output = output.to_shape((batch_len, feature_len))?.to_owned();

        Ok(output)
    }
}
