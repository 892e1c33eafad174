//! Top-level entry point: annotations, features, clustering, splitting, output.

use std::sync::Arc;

use log::info;

use crate::annotations::{AnnotationSource, CocoIndex};
use crate::backend::{load_backend, FeatureBackend};
use crate::clustering::{cluster_features, ClusterBackend, KMeansClusterer};
use crate::config::SplitConfig;
use crate::error::{InStage, Result, Stage};
use crate::preprocessing::FeatureSettings;
use crate::split::{stratified_split, write_csv, write_json, SplitResult};
use crate::strategy::{PipelineContext, Strategy};

/// Runs the whole pipeline with the configured feature backend and the
/// built-in k-means clusterer.
pub fn split_data(config: &SplitConfig) -> Result<SplitResult>
{
    config.validate()?;
    let backend = load_backend(&config.backend_descriptor(), &config.models_dir, config.seed)
        .in_stage(Stage::Features)?;
    let clusterer = KMeansClusterer::from_config(config);
    run_pipeline(config, backend, &clusterer)
}

/// Runs the pipeline with caller-supplied backends.
/// Writes the CSV (and the JSON summary when configured) and returns the split.
pub fn run_pipeline(
    config: &SplitConfig,
    backend: Arc<dyn FeatureBackend>,
    clusterer: &dyn ClusterBackend,
) -> Result<SplitResult>
{
    config.validate()?;
    let strategy = Strategy::select(config.use_object_features, config.parallelize, config.insitu);
    if let Some(mode) = config.crop_mode.or(strategy.default_crop_mode()).filter(|_| strategy.uses_objects())
    {
        info!("Strategy {} with {:?} crops", strategy, mode);
    }

    let annotations: Option<Arc<dyn AnnotationSource>> = match (&config.annotation_file, strategy.uses_objects())
    {
        (Some(path), true) =>
        {
            let index: Arc<dyn AnnotationSource> = Arc::new(CocoIndex::from_file(path).in_stage(Stage::Annotations)?);
            Some(index)
        }
        _ => None,
    };

    let context = PipelineContext {
        image_dir: config.image_dir.clone(),
        annotations,
        backend,
        settings: FeatureSettings {
            width: config.img_resize_width,
            height: config.img_resize_height,
            normalization: config.img_normalization_weight,
            seed: config.seed,
        },
        crop_mode: config.crop_mode,
        crop_dir: config.crop_dir.clone(),
        workers: config.workers,
        show_progress: config.show_progress,
    };

    let features = strategy.run(&context).in_stage(Stage::Features)?;
    let table = cluster_features(&features, clusterer).in_stage(Stage::Clustering)?;
    let (table, result) = stratified_split(table, config.train_size, config.include_testsplit, config.seed)
        .in_stage(Stage::Splitting)?;

    write_csv(&table, &config.output_csv).in_stage(Stage::Output)?;
    if let Some(path) = &config.output_json
    {
        write_json(&result, path).in_stage(Stage::Output)?;
    }
    Ok(result)
}
