//! Cluster assignment: stacks per-image feature vectors into a matrix, hands it
//! to a clustering backend and zips the labels back onto the image names.

use std::collections::BTreeMap;

use log::{debug, info};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SplitConfig;
use crate::error::{Error, Result};
use crate::features::ImagePropertySet;
use crate::split::SplitType;

/// Maps a feature matrix to one integer label per row.
/// Labels need not be contiguous, and a backend may use negative labels for noise.
pub trait ClusterBackend: Send + Sync
{
    fn fit(&self, matrix: ArrayView2<f32>) -> Result<Vec<i32>>;
}

/// One image's row in the cluster table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRow
{
    pub image_name: String,
    pub cluster: i32,
    pub split: SplitType,
}

/// One row per clustered image, in the order the images were clustered.
/// Every row starts at `SplitType::NoSplit`; the splitter fills the column in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterTable
{
    rows: Vec<ClusterRow>,
}

impl ClusterTable
{
    pub fn new(names: Vec<String>, labels: Vec<i32>) -> Result<Self>
    {
        if names.len() != labels.len()
        {
            return Err(Error::LabelCount { rows: names.len(), labels: labels.len() });
        }
        let rows = names.into_iter()
            .zip(labels)
            .map(|(image_name, cluster)| ClusterRow { image_name, cluster, split: SplitType::NoSplit })
            .collect();
        Ok(ClusterTable { rows })
    }

    pub fn rows(&self) -> &[ClusterRow]
    {
        &self.rows
    }

    pub fn len(&self) -> usize
    {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.rows.is_empty()
    }

    pub fn set_split(&mut self, row: usize, split: SplitType)
    {
        self.rows[row].split = split;
    }

    /// Row indices grouped by cluster label, labels ascending, rows in table order.
    pub fn members_by_label(&self) -> BTreeMap<i32, Vec<usize>>
    {
        let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (idx, row) in self.rows.iter().enumerate()
        {
            members.entry(row.cluster).or_default().push(idx);
        }
        members
    }

    /// Names of the rows currently assigned to `split`, in table order.
    pub fn names_in(&self, split: SplitType) -> Vec<String>
    {
        self.rows.iter()
            .filter(|row| row.split == split)
            .map(|row| row.image_name.clone())
            .collect()
    }
}

/// Clusters every image in the set. Row order of the table follows the set.
pub fn cluster_features(set: &ImagePropertySet, backend: &dyn ClusterBackend) -> Result<ClusterTable>
{
    let dimension = set.dimension().ok_or(Error::EmptyFeatureSet)?;
    let flat: Vec<f32> = set.features().iter().flatten().copied().collect();
    let matrix = Array2::from_shape_vec((set.len(), dimension), flat)?;

    let labels = backend.fit(matrix.view())?;
    let table = ClusterTable::new(set.names().to_vec(), labels)?;

    let sizes: Vec<(i32, usize)> = table.members_by_label()
        .into_iter()
        .map(|(label, rows)| (label, rows.len()))
        .collect();
    info!("Clustered {} images into {} clusters {:?}", table.len(), sizes.len(), sizes);
    Ok(table)
}

/// Seeded k-means with k-means++ seeding.
///
/// With `clusters` unset, k is picked from `2..=min(max_clusters, n - 1)` by the
/// best mean silhouette score, the smaller k winning ties. Fewer than three rows
/// are all put in cluster 0.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansClusterer
{
    pub clusters: Option<usize>,
    pub max_clusters: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl KMeansClusterer
{
    pub fn from_config(config: &SplitConfig) -> Self
    {
        KMeansClusterer {
            clusters: config.num_clusters,
            max_clusters: config.max_clusters,
            max_iterations: config.max_iterations,
            seed: config.seed,
        }
    }

    fn assignments(&self, data: ArrayView2<f32>) -> Vec<usize>
    {
        let n = data.nrows();
        if let Some(k) = self.clusters
        {
            return kmeans(data, k.min(n), self.max_iterations, self.seed);
        }
        if n < 3
        {
            return vec![0; n];
        }

        let distances = pairwise_distances(data);
        let mut best: Option<(f64, usize, Vec<usize>)> = None;
        for k in 2..=self.max_clusters.min(n - 1)
        {
            let assignments = kmeans(data, k, self.max_iterations, self.seed);
            let score = mean_silhouette(&distances, &assignments, k);
            debug!("k={} silhouette={:.4}", k, score);
            if best.as_ref().map_or(true, |(best_score, _, _)| score > *best_score)
            {
                best = Some((score, k, assignments));
            }
        }
        match best
        {
            Some((score, k, assignments)) =>
            {
                info!("Selected k={} (silhouette {:.4})", k, score);
                assignments
            }
            None => vec![0; n],
        }
    }
}

impl ClusterBackend for KMeansClusterer
{
    fn fit(&self, matrix: ArrayView2<f32>) -> Result<Vec<i32>>
    {
        Ok(self.assignments(matrix).into_iter().map(|cluster| cluster as i32).collect())
    }
}

fn distance_sq(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64
{
    a.iter().zip(b.iter()).map(|(x, y)| ((x - y) as f64).powi(2)).sum()
}

fn nearest(point: ArrayView1<f32>, centroids: &Array2<f32>) -> (usize, f64)
{
    let mut best = (0, f64::MAX);
    for (j, centroid) in centroids.outer_iter().enumerate()
    {
        let dist = distance_sq(point, centroid);
        if dist < best.1
        {
            best = (j, dist);
        }
    }
    best
}

/// k-means++: each further centroid is drawn with probability proportional to
/// its squared distance from the nearest centroid chosen so far.
fn plus_plus_init(data: ArrayView2<f32>, k: usize, rng: &mut StdRng) -> Array2<f32>
{
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));
    centroids.row_mut(0).assign(&data.row(rng.random_range(0..n)));

    for c in 1..k
    {
        let chosen = centroids.slice(ndarray::s![..c, ..]).to_owned();
        let weights: Vec<f64> = data.outer_iter().map(|row| nearest(row, &chosen).1).collect();
        let total: f64 = weights.iter().sum();

        let pick = if total > 0.0
        {
            let mut target = rng.random_range(0.0..total);
            weights.iter()
                .position(|w| {
                    target -= w;
                    target < 0.0
                })
                .unwrap_or(n - 1)
        }
        else
        {
            rng.random_range(0..n)
        };
        centroids.row_mut(c).assign(&data.row(pick));
    }
    centroids
}

/// Lloyd iterations from a k-means++ start. An emptied cluster keeps its previous centroid.
fn kmeans(data: ArrayView2<f32>, k: usize, max_iterations: usize, seed: u64) -> Vec<usize>
{
    let n = data.nrows();
    if n == 0 || k == 0
    {
        return vec![0; n];
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = plus_plus_init(data, k, &mut rng);
    let mut assignments: Vec<usize> = data.outer_iter().map(|row| nearest(row, &centroids).0).collect();

    for iteration in 0..max_iterations
    {
        let mut sums = Array2::<f32>::zeros(centroids.raw_dim());
        let mut counts = vec![0usize; k];
        for (row, &cluster) in data.outer_iter().zip(&assignments)
        {
            let mut sum = sums.row_mut(cluster);
            sum += &row;
            counts[cluster] += 1;
        }
        for (j, count) in counts.iter().enumerate()
        {
            if *count > 0
            {
                let mean = &sums.row(j) / *count as f32;
                centroids.row_mut(j).assign(&mean);
            }
        }

        let next: Vec<usize> = data.outer_iter().map(|row| nearest(row, &centroids).0).collect();
        if next == assignments
        {
            debug!("k-means with k={} converged after {} iterations", k, iteration + 1);
            break;
        }
        assignments = next;
    }
    assignments
}

fn pairwise_distances(data: ArrayView2<f32>) -> Array2<f64>
{
    let n = data.nrows();
    let mut distances = Array2::zeros((n, n));
    for i in 0..n
    {
        for j in (i + 1)..n
        {
            let d = distance_sq(data.row(i), data.row(j)).sqrt();
            distances[[i, j]] = d;
            distances[[j, i]] = d;
        }
    }
    distances
}

/// Mean silhouette over all rows. A row alone in its cluster scores 0; a
/// clustering with fewer than two non-empty clusters scores -1.
fn mean_silhouette(distances: &Array2<f64>, assignments: &[usize], k: usize) -> f64
{
    let n = assignments.len();
    let mut sizes = vec![0usize; k];
    for &cluster in assignments
    {
        sizes[cluster] += 1;
    }
    if sizes.iter().filter(|s| **s > 0).count() < 2
    {
        return -1.0;
    }

    let mut total = 0.0;
    for (i, row) in distances.axis_iter(Axis(0)).enumerate()
    {
        let own = assignments[i];
        if sizes[own] < 2
        {
            continue;
        }
        let mut sums = vec![0.0f64; k];
        for (j, d) in row.iter().enumerate()
        {
            sums[assignments[j]] += d;
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|c| *c != own && sizes[*c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::MAX, f64::min);
        let scale = a.max(b);
        if scale > 0.0
        {
            total += (b - a) / scale;
        }
    }
    total / n as f64
}

#[cfg(test)]
mod tests
{
    use super::*;
    use ndarray::array;

    fn clusterer(clusters: Option<usize>) -> KMeansClusterer
    {
        KMeansClusterer { clusters, max_clusters: 6, max_iterations: 100, seed: 2024 }
    }

    fn three_blobs() -> Array2<f32>
    {
        array![
            [0.0, 0.0], [0.1, 0.0], [0.0, 0.1],
            [5.0, 5.0], [5.1, 5.0], [5.0, 5.1],
            [0.0, 9.0], [0.1, 9.0], [0.0, 9.1],
        ]
    }

    fn same_partition(labels: &[i32], groups: &[&[usize]])
    {
        for group in groups
        {
            assert!(group.iter().all(|i| labels[*i] == labels[group[0]]), "{:?}", labels);
        }
        for (x, gx) in groups.iter().enumerate()
        {
            for gy in groups.iter().skip(x + 1)
            {
                assert_ne!(labels[gx[0]], labels[gy[0]], "{:?}", labels);
            }
        }
    }

    #[test]
    fn auto_k_finds_separated_blobs()
    {
        let labels = clusterer(None).fit(three_blobs().view()).unwrap();
        assert_eq!(labels.len(), 9);
        same_partition(&labels, &[&[0, 1, 2], &[3, 4, 5], &[6, 7, 8]]);
    }

    #[test]
    fn fixed_k_is_respected()
    {
        let labels = clusterer(Some(2)).fit(three_blobs().view()).unwrap();
        let mut distinct = labels.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 2);
    }

    #[test]
    fn same_seed_same_labels()
    {
        let data = three_blobs();
        assert_eq!(clusterer(None).fit(data.view()).unwrap(), clusterer(None).fit(data.view()).unwrap());
    }

    #[test]
    fn tiny_inputs_share_one_cluster()
    {
        let labels = clusterer(None).fit(array![[1.0f32, 2.0], [3.0, 4.0]].view()).unwrap();
        assert_eq!(labels, vec![0, 0]);
    }

    #[test]
    fn identical_rows_share_one_cluster()
    {
        let data = Array2::from_elem((5, 3), 0.25f32);
        let labels = clusterer(None).fit(data.view()).unwrap();
        assert!(labels.iter().all(|l| *l == labels[0]));
    }

    #[test]
    fn silhouette_prefers_the_true_partition()
    {
        let distances = pairwise_distances(three_blobs().view());
        let good = mean_silhouette(&distances, &[0, 0, 0, 1, 1, 1, 2, 2, 2], 3);
        let bad = mean_silhouette(&distances, &[0, 1, 2, 0, 1, 2, 0, 1, 2], 3);
        assert!(good > 0.9);
        assert!(bad < 0.0);
        assert_eq!(mean_silhouette(&distances, &[0; 9], 2), -1.0);
    }

    struct FixedLabels(Vec<i32>);

    impl ClusterBackend for FixedLabels
    {
        fn fit(&self, _matrix: ArrayView2<f32>) -> Result<Vec<i32>>
        {
            Ok(self.0.clone())
        }
    }

    fn property_set() -> ImagePropertySet
    {
        ImagePropertySet::from_parts(
            vec!["a.png".to_string(), "b.png".to_string(), "c.png".to_string()],
            vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.0, 1.0]],
        ).unwrap()
    }

    #[test]
    fn labels_are_zipped_by_position()
    {
        let table = cluster_features(&property_set(), &FixedLabels(vec![4, -1, 4])).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows()[1].image_name, "b.png");
        assert_eq!(table.rows()[1].cluster, -1);
        assert!(table.rows().iter().all(|row| row.split == SplitType::NoSplit));

        let members = table.members_by_label();
        assert_eq!(members.keys().copied().collect::<Vec<_>>(), vec![-1, 4]);
        assert_eq!(members[&4], vec![0, 2]);
    }

    #[test]
    fn label_count_must_match_rows()
    {
        let err = cluster_features(&property_set(), &FixedLabels(vec![0, 1])).unwrap_err();
        assert!(matches!(err, Error::LabelCount { rows: 3, labels: 2 }));
    }

    #[test]
    fn empty_set_is_rejected()
    {
        let err = cluster_features(&ImagePropertySet::new(), &FixedLabels(vec![])).unwrap_err();
        assert!(matches!(err, Error::EmptyFeatureSet));
    }
}
