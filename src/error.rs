use std::fmt;

/// The pipeline stage an error surfaced from.
/// Attached by the top-level pipeline so the caller can tell which step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage
{
    Annotations,
    Features,
    Clustering,
    Splitting,
    Output,
}

impl fmt::Display for Stage
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self
        {
            Stage::Annotations => "annotations",
            Stage::Features => "features",
            Stage::Clustering => "clustering",
            Stage::Splitting => "splitting",
            Stage::Output => "output",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error
{
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Ort(#[from] ort::Error),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Image {0} not found in the annotation source.")]
    ImageNotFound(String),
    #[error("Image id {0} not found in the annotation source.")]
    ImageIdNotFound(u64),
    #[error("Feature vector for {name} has length {actual}, expected {expected}.")]
    FeatureLength { name: String, expected: usize, actual: usize },
    #[error("Image property set holds {names} names but {features} feature vectors.")]
    PropertySetMismatch { names: usize, features: usize },
    #[error("Image {0} was produced more than once.")]
    DuplicateImage(String),
    #[error("Feature backend returned {rows} embeddings for {inputs} inputs.")]
    EmbeddingCount { inputs: usize, rows: usize },
    #[error("Clustering backend returned {labels} labels for {rows} rows.")]
    LabelCount { rows: usize, labels: usize },
    #[error("Mask is {mask_width}x{mask_height} but image {name} is {width}x{height}.")]
    MaskSize { name: String, width: u32, height: u32, mask_width: u32, mask_height: u32 },
    #[error("No image produced a feature vector; there is nothing to cluster.")]
    EmptyFeatureSet,
    #[error("Cluster {label} has {count} member(s); stratified splitting needs at least 2 per cluster.")]
    DegenerateCluster { label: i32, count: usize },
    #[error("Worker failed during {stage}: {source}")]
    Worker
    {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unsupported segmentation: {0}")]
    Segmentation(String),
    #[error("Image {0} was left without a split assignment.")]
    Unassigned(String),
    #[error("{stage} stage failed: {source}")]
    Stage
    {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error
{
    /// The innermost error, with any `Stage` and `Worker` wrappers removed.
    pub fn root(&self) -> &Error
    {
        match self
        {
            Error::Stage { source, .. } | Error::Worker { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Tags a result's error with the pipeline stage it came from.
pub trait InStage<T>
{
    fn in_stage(self, stage: Stage) -> Result<T>;
}

impl<T> InStage<T> for Result<T>
{
    fn in_stage(self, stage: Stage) -> Result<T>
    {
        self.map_err(|e| match e
        {
            // Keep the first stage tag; an inner stage is the more precise one.
            e @ Error::Stage { .. } => e,
            e => Error::Stage { stage, source: Box::new(e) },
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn stage_is_named_in_message()
    {
        let result: Result<()> = Err(Error::DegenerateCluster { label: 3, count: 1 });
        let err = result.in_stage(Stage::Splitting).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("splitting stage failed"));
        assert!(message.contains("Cluster 3 has 1 member"));
    }

    #[test]
    fn root_unwraps_nested_wrappers()
    {
        let inner = Error::ImageNotFound("a.png".to_string());
        let err = Error::Stage {
            stage: Stage::Features,
            source: Box::new(Error::Worker { stage: "extraction", source: Box::new(inner) }),
        };
        assert!(matches!(err.root(), Error::ImageNotFound(name) if name == "a.png"));
    }

    #[test]
    fn first_stage_tag_wins()
    {
        let result: Result<()> = Err(Error::EmptyFeatureSet);
        let err = result.in_stage(Stage::Clustering).in_stage(Stage::Output).unwrap_err();
        assert!(matches!(err, Error::Stage { stage: Stage::Clustering, .. }));
    }
}
