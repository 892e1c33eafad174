//! Per-image feature vectors and the accumulator that carries them to clustering.

use image::DynamicImage;
use log::debug;
use ndarray::Axis;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::backend::{normalize_feature_vectors, FeatureBackend};
use crate::error::{Error, Result};
use crate::preprocessing::{self, FeatureSettings};

pub type FeatureVector = Vec<f32>;

/// One image's feature vector, keyed by the image name it belongs to.
/// Parallel workers return these so results can be matched up by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFeature
{
    pub name: String,
    pub vector: FeatureVector,
}

/// Image names and their feature vectors as two parallel sequences.
///
/// `names[i]` pairs with `features[i]`, both always have the same length, and
/// every vector has the same dimension. Every way of adding to the set checks
/// those invariants, so a set that exists is valid input for clustering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagePropertySet
{
    names: Vec<String>,
    features: Vec<FeatureVector>,
    seen: FxHashSet<String>,
}

impl ImagePropertySet
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Builds a set from two sequences that are meant to correspond.
    pub fn from_parts(names: Vec<String>, features: Vec<FeatureVector>) -> Result<Self>
    {
        if names.len() != features.len()
        {
            return Err(Error::PropertySetMismatch { names: names.len(), features: features.len() });
        }
        let mut set = Self::new();
        for (name, vector) in names.into_iter().zip(features)
        {
            set.push(ImageFeature { name, vector })?;
        }
        Ok(set)
    }

    /// Recombines results that arrived in arbitrary order.
    ///
    /// Rows follow `order`; names in `order` with no result are skipped (images
    /// that produced no features). A result whose name is not in `order`, or a
    /// name that arrives twice, is an error.
    pub fn from_keyed(order: &[String], results: Vec<ImageFeature>) -> Result<Self>
    {
        let mut by_name: FxHashMap<String, FeatureVector> = FxHashMap::default();
        for result in results
        {
            if by_name.contains_key(&result.name)
            {
                return Err(Error::DuplicateImage(result.name));
            }
            by_name.insert(result.name, result.vector);
        }

        let mut set = Self::new();
        for name in order
        {
            if let Some(vector) = by_name.remove(name)
            {
                set.push(ImageFeature { name: name.clone(), vector })?;
            }
        }
        if let Some(name) = by_name.into_keys().next()
        {
            return Err(Error::ImageNotFound(name));
        }
        Ok(set)
    }

    pub fn push(&mut self, feature: ImageFeature) -> Result<()>
    {
        if let Some(expected) = self.dimension()
        {
            if feature.vector.len() != expected
            {
                return Err(Error::FeatureLength { name: feature.name, expected, actual: feature.vector.len() });
            }
        }
        if !self.seen.insert(feature.name.clone())
        {
            return Err(Error::DuplicateImage(feature.name));
        }
        self.names.push(feature.name);
        self.features.push(feature.vector);
        Ok(())
    }

    /// Appends another set; the result keeps `self`'s rows first.
    pub fn merge(mut self, other: ImagePropertySet) -> Result<Self>
    {
        for (name, vector) in other.names.into_iter().zip(other.features)
        {
            self.push(ImageFeature { name, vector })?;
        }
        Ok(self)
    }

    pub fn names(&self) -> &[String]
    {
        &self.names
    }

    pub fn features(&self) -> &[FeatureVector]
    {
        &self.features
    }

    /// Length shared by every vector in the set, or `None` while it is empty.
    pub fn dimension(&self) -> Option<usize>
    {
        self.features.first().map(|f| f.len())
    }

    pub fn len(&self) -> usize
    {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.names.is_empty()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<FeatureVector>)
    {
        (self.names, self.features)
    }
}

/// Produces one feature vector for an image from one or more sub-images.
///
/// Each input is resized and normalized, embedded by the backend and L2
/// normalized; the per-input rows are then averaged into a single vector.
/// Returns `None` when there is nothing to embed, e.g. an image whose
/// annotations produced no objects.
pub fn features_for_image(
    images: &[DynamicImage],
    settings: &FeatureSettings,
    backend: &dyn FeatureBackend,
) -> Result<Option<FeatureVector>>
{
    if images.is_empty()
    {
        return Ok(None);
    }

    let batch = preprocessing::prepare_batch(images, settings);
    let mut embeddings = backend.embed(batch.view())?;
    if embeddings.nrows() != images.len()
    {
        return Err(Error::EmbeddingCount { inputs: images.len(), rows: embeddings.nrows() });
    }
    normalize_feature_vectors(&mut embeddings);

    let vector = embeddings.mean_axis(Axis(0))
        .map(|mean| mean.to_vec())
        .ok_or(Error::EmptyFeatureSet)?;
    debug!("Embedded {} inputs with {} into {} dims", images.len(), backend.descriptor(), vector.len());
    Ok(Some(vector))
}
