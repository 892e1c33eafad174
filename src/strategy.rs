//! The six ways of turning an image set into an `ImagePropertySet`, and the
//! table that picks one from the three strategy flags.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, info};
use rustc_hash::FxHashSet;

use crate::annotations::AnnotationSource;
use crate::backend::FeatureBackend;
use crate::error::{Error, Result};
use crate::fanout::{progress_bar, FanOut};
use crate::features::{features_for_image, ImageFeature, ImagePropertySet};
use crate::objects::{has_object_pixels, CropMode, ObjectCrop, ObjectExtractor};
use crate::preprocessing::{self, FeatureSettings};

/// Everything a pipeline variant needs. Shared read-only with worker threads.
pub struct PipelineContext
{
    pub image_dir: PathBuf,
    pub annotations: Option<Arc<dyn AnnotationSource>>,
    pub backend: Arc<dyn FeatureBackend>,
    pub settings: FeatureSettings,
    /// Overrides the variant's own crop mode when set.
    pub crop_mode: Option<CropMode>,
    pub crop_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub show_progress: bool,
}

impl PipelineContext
{
    fn annotations(&self) -> Result<&dyn AnnotationSource>
    {
        self.annotations
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("object features need an annotation file".to_string()))
    }

    fn extractor(&self, default_mode: CropMode) -> Result<ObjectExtractor<'_>>
    {
        Ok(ObjectExtractor {
            source: self.annotations()?,
            image_dir: &self.image_dir,
            mode: self.crop_mode.unwrap_or(default_mode),
            crop_dir: self.crop_dir.as_deref(),
        })
    }

    fn fanout(&self) -> Result<FanOut>
    {
        FanOut::new(self.workers, self.show_progress)
    }

    /// File names from the annotation source in listing order, first occurrence kept.
    fn annotated_images(&self) -> Result<Vec<String>>
    {
        let mut seen = FxHashSet::default();
        let names = self.annotations()?
            .list_images()
            .into_iter()
            .map(|entry| entry.file_name)
            .filter(|name| seen.insert(name.clone()))
            .collect();
        Ok(names)
    }

    fn embed(&self, name: &str, images: &[DynamicImage]) -> Result<Option<ImageFeature>>
    {
        let feature = features_for_image(images, &self.settings, self.backend.as_ref())?
            .map(|vector| ImageFeature { name: name.to_string(), vector });
        if feature.is_none()
        {
            info!("{} produced no objects; leaving it out", name);
        }
        Ok(feature)
    }
}

pub type PipelineFn = fn(&PipelineContext) -> Result<ImagePropertySet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy
{
    FullImageSequential,
    FullImageParallel,
    ObjectInsituSequential,
    ObjectInsituParallel,
    ObjectTwoPhaseSequential,
    ObjectTwoPhaseParallel,
}

impl Strategy
{
    pub const ALL: [Strategy; 6] = [
        Strategy::FullImageSequential,
        Strategy::FullImageParallel,
        Strategy::ObjectInsituSequential,
        Strategy::ObjectInsituParallel,
        Strategy::ObjectTwoPhaseSequential,
        Strategy::ObjectTwoPhaseParallel,
    ];

    /// `insitu` only matters for object features.
    pub fn select(use_object_features: bool, parallelize: bool, insitu: bool) -> Strategy
    {
        match (use_object_features, parallelize, insitu)
        {
            (false, false, _) => Strategy::FullImageSequential,
            (false, true, _) => Strategy::FullImageParallel,
            (true, false, true) => Strategy::ObjectInsituSequential,
            (true, true, true) => Strategy::ObjectInsituParallel,
            (true, false, false) => Strategy::ObjectTwoPhaseSequential,
            (true, true, false) => Strategy::ObjectTwoPhaseParallel,
        }
    }

    pub fn pipeline(self) -> PipelineFn
    {
        match self
        {
            Strategy::FullImageSequential => full_image_sequential,
            Strategy::FullImageParallel => full_image_parallel,
            Strategy::ObjectInsituSequential => object_insitu_sequential,
            Strategy::ObjectInsituParallel => object_insitu_parallel,
            Strategy::ObjectTwoPhaseSequential => object_two_phase_sequential,
            Strategy::ObjectTwoPhaseParallel => object_two_phase_parallel,
        }
    }

    pub fn name(self) -> &'static str
    {
        match self
        {
            Strategy::FullImageSequential => "full-image",
            Strategy::FullImageParallel => "full-image-parallel",
            Strategy::ObjectInsituSequential => "object-insitu",
            Strategy::ObjectInsituParallel => "object-insitu-parallel",
            Strategy::ObjectTwoPhaseSequential => "object-two-phase",
            Strategy::ObjectTwoPhaseParallel => "object-two-phase-parallel",
        }
    }

    pub fn uses_objects(self) -> bool
    {
        !matches!(self, Strategy::FullImageSequential | Strategy::FullImageParallel)
    }

    pub fn is_parallel(self) -> bool
    {
        matches!(self, Strategy::FullImageParallel | Strategy::ObjectInsituParallel | Strategy::ObjectTwoPhaseParallel)
    }

    /// Crop mode used when the configuration does not name one.
    pub fn default_crop_mode(self) -> Option<CropMode>
    {
        match self
        {
            Strategy::FullImageSequential | Strategy::FullImageParallel => None,
            Strategy::ObjectInsituSequential | Strategy::ObjectInsituParallel => Some(CropMode::Tight),
            Strategy::ObjectTwoPhaseSequential | Strategy::ObjectTwoPhaseParallel => Some(CropMode::FullFrame),
        }
    }

    pub fn run(self, context: &PipelineContext) -> Result<ImagePropertySet>
    {
        info!("Running {} pipeline", self);
        let set = (self.pipeline())(context)?;
        info!("{} pipeline produced {} feature vectors", self, set.len());
        Ok(set)
    }
}

impl fmt::Display for Strategy
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}

pub fn select(use_object_features: bool, parallelize: bool, insitu: bool) -> PipelineFn
{
    Strategy::select(use_object_features, parallelize, insitu).pipeline()
}

fn whole_image_feature(context: &PipelineContext, name: &str) -> Result<Option<ImageFeature>>
{
    let image = preprocessing::load_image(&context.image_dir.join(name))?;
    context.embed(name, &[image])
}

/// Crops with no object pixel (a full-frame crop of an empty mask) are not featurized.
fn object_images(crops: Vec<ObjectCrop>) -> Vec<DynamicImage>
{
    crops.into_iter()
        .filter(has_object_pixels)
        .map(|crop| crop.into_rgb())
        .collect()
}

fn insitu_feature(context: &PipelineContext, name: &str) -> Result<Option<ImageFeature>>
{
    let crops = context.extractor(CropMode::Tight)?.objects_for_image(name)?;
    context.embed(name, &object_images(crops))
}

/// An image's objects, extracted and waiting to be featurized.
struct ExtractedObjects
{
    name: String,
    images: Vec<DynamicImage>,
}

fn extract_for_later(context: &PipelineContext, name: String) -> Result<ExtractedObjects>
{
    let crops = context.extractor(CropMode::FullFrame)?.objects_for_image(&name)?;
    debug!("{}: extracted {} objects", name, crops.len());
    let images = object_images(crops);
    Ok(ExtractedObjects { name, images })
}

fn sequential<F>(context: &PipelineContext, stage: &str, names: Vec<String>, produce: F) -> Result<ImagePropertySet>
where
    F: Fn(&PipelineContext, &str) -> Result<Option<ImageFeature>>,
{
    let progress = progress_bar(stage, names.len(), context.show_progress);
    let mut set = ImagePropertySet::new();
    for name in names
    {
        if let Some(feature) = produce(context, &name)?
        {
            set.push(feature)?;
        }
        progress.inc(1);
    }
    progress.finish();
    Ok(set)
}

fn parallel<F>(context: &PipelineContext, stage: &'static str, names: Vec<String>, produce: F) -> Result<ImagePropertySet>
where
    F: Fn(&PipelineContext, &str) -> Result<Option<ImageFeature>> + Sync,
{
    let results = context.fanout()?.run(stage, names.clone(), |name| produce(context, &name))?;
    ImagePropertySet::from_keyed(&names, results.into_iter().flatten().collect())
}

fn full_image_sequential(context: &PipelineContext) -> Result<ImagePropertySet>
{
    let names = preprocessing::list_image_files(&context.image_dir)?;
    sequential(context, "features", names, whole_image_feature)
}

fn full_image_parallel(context: &PipelineContext) -> Result<ImagePropertySet>
{
    let names = preprocessing::list_image_files(&context.image_dir)?;
    parallel(context, "features", names, whole_image_feature)
}

fn object_insitu_sequential(context: &PipelineContext) -> Result<ImagePropertySet>
{
    let names = context.annotated_images()?;
    sequential(context, "objects+features", names, insitu_feature)
}

fn object_insitu_parallel(context: &PipelineContext) -> Result<ImagePropertySet>
{
    let names = context.annotated_images()?;
    parallel(context, "objects+features", names, insitu_feature)
}

fn object_two_phase_sequential(context: &PipelineContext) -> Result<ImagePropertySet>
{
    let names = context.annotated_images()?;

    let progress = progress_bar("objects", names.len(), context.show_progress);
    let mut extracted = Vec::with_capacity(names.len());
    for name in names
    {
        extracted.push(extract_for_later(context, name)?);
        progress.inc(1);
    }
    progress.finish();

    let progress = progress_bar("features", extracted.len(), context.show_progress);
    let mut set = ImagePropertySet::new();
    for objects in extracted
    {
        if let Some(feature) = context.embed(&objects.name, &objects.images)?
        {
            set.push(feature)?;
        }
        progress.inc(1);
    }
    progress.finish();
    Ok(set)
}

fn object_two_phase_parallel(context: &PipelineContext) -> Result<ImagePropertySet>
{
    let names = context.annotated_images()?;
    let fanout = context.fanout()?;

    let extracted = fanout.run("objects", names.clone(), |name| extract_for_later(context, name))?;
    let features = fanout.run("features", extracted, |objects| context.embed(&objects.name, &objects.images))?;
    ImagePropertySet::from_keyed(&names, features.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn every_flag_combination_has_its_own_strategy()
    {
        let mut seen = FxHashSet::default();
        for use_objects in [false, true]
        {
            for parallelize in [false, true]
            {
                for insitu in [false, true]
                {
                    let strategy = Strategy::select(use_objects, parallelize, insitu);
                    assert_eq!(strategy.uses_objects(), use_objects);
                    assert_eq!(strategy.is_parallel(), parallelize);
                    seen.insert(strategy);
                }
            }
        }
        assert_eq!(seen.len(), 6);
        assert!(Strategy::ALL.iter().all(|s| seen.contains(s)));
    }

    #[test]
    fn table_maps_flags_to_variants()
    {
        assert_eq!(Strategy::select(true, false, true), Strategy::ObjectInsituSequential);
        assert_eq!(Strategy::select(true, true, true), Strategy::ObjectInsituParallel);
        assert_eq!(Strategy::select(true, false, false), Strategy::ObjectTwoPhaseSequential);
        assert_eq!(Strategy::select(true, true, false), Strategy::ObjectTwoPhaseParallel);
    }

    #[test]
    fn insitu_is_ignored_without_objects()
    {
        assert_eq!(Strategy::select(false, false, true), Strategy::select(false, false, false));
        assert_eq!(Strategy::select(false, true, true), Strategy::select(false, true, false));
    }

    #[test]
    fn names_are_distinct()
    {
        let names: FxHashSet<&str> = Strategy::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), 6);
        assert_eq!(Strategy::ObjectTwoPhaseParallel.to_string(), "object-two-phase-parallel");
    }

    #[test]
    fn crop_modes_follow_the_phase()
    {
        assert_eq!(Strategy::FullImageParallel.default_crop_mode(), None);
        assert_eq!(Strategy::ObjectInsituParallel.default_crop_mode(), Some(CropMode::Tight));
        assert_eq!(Strategy::ObjectTwoPhaseSequential.default_crop_mode(), Some(CropMode::FullFrame));
    }
}
