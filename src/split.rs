//! Cluster-stratified train/val(/test) splitting and persistence of the result.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::clustering::ClusterTable;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitType
{
    Train,
    Val,
    Test,
    /// Not yet assigned. Never present in a finished table.
    NoSplit,
}

impl fmt::Display for SplitType
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self
        {
            SplitType::Train => "train",
            SplitType::Val => "val",
            SplitType::Test => "test",
            SplitType::NoSplit => "nosplit",
        };
        f.write_str(name)
    }
}

/// Image names per split. `test_set` is only present for three-way splits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitResult
{
    pub train_set: Vec<String>,
    pub val_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_set: Option<Vec<String>>,
}

impl SplitResult
{
    pub fn total(&self) -> usize
    {
        self.train_set.len() + self.val_set.len() + self.test_set.as_ref().map_or(0, |t| t.len())
    }
}

/// What to do with a cluster that has a single row at some split level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingletonPolicy
{
    Reject,
    KeepInTrain,
}

/// Splits `rows` into two sides per cluster label, `fraction` of every cluster
/// going to the first side. Each cluster gets at least one row on each side.
fn stratify(
    table: &ClusterTable,
    rows: &[usize],
    fraction: f64,
    rng: &mut StdRng,
    singletons: SingletonPolicy,
) -> Result<(Vec<usize>, Vec<usize>)>
{
    let mut by_label: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for &row in rows
    {
        by_label.entry(table.rows()[row].cluster).or_default().push(row);
    }
    if singletons == SingletonPolicy::Reject
    {
        if let Some((label, members)) = by_label.iter().find(|(_, members)| members.len() < 2)
        {
            return Err(Error::DegenerateCluster { label: *label, count: members.len() });
        }
    }

    let (mut first, mut second) = (Vec::new(), Vec::new());
    for (label, mut members) in by_label
    {
        let n = members.len();
        if n < 2
        {
            warn!("Cluster {} has a single training row; keeping it in train", label);
            first.extend(members);
            continue;
        }
        members.shuffle(rng);
        let take = ((fraction * n as f64).round() as usize).clamp(1, n - 1);
        second.extend_from_slice(&members[take..]);
        members.truncate(take);
        first.extend(members);
    }
    Ok((first, second))
}

/// Two-stage stratified split of a clustered table.
///
/// Stage one sends `train_size` of every cluster to train and holds out the
/// rest. Two-way, the held-out rows are the validation set. Three-way, they are
/// the test set, and the train candidates are split again at the same
/// fraction into train and val. Every cluster needs at least two rows.
pub fn stratified_split(
    mut table: ClusterTable,
    train_size: f64,
    include_test: bool,
    seed: u64,
) -> Result<(ClusterTable, SplitResult)>
{
    if !(train_size > 0.0 && train_size < 1.0)
    {
        return Err(Error::InvalidConfig(format!("train_size must lie in (0, 1), got {}", train_size)));
    }
    if table.is_empty()
    {
        return Err(Error::EmptyFeatureSet);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let all: Vec<usize> = (0..table.len()).collect();
    let (candidates, held_out) = stratify(&table, &all, train_size, &mut rng, SingletonPolicy::Reject)?;

    for &row in &candidates
    {
        table.set_split(row, SplitType::Train);
    }
    let held_out_split = if include_test { SplitType::Test } else { SplitType::Val };
    for &row in &held_out
    {
        table.set_split(row, held_out_split);
    }
    if include_test
    {
        let (_, val) = stratify(&table, &candidates, train_size, &mut rng, SingletonPolicy::KeepInTrain)?;
        for row in val
        {
            table.set_split(row, SplitType::Val);
        }
    }

    if let Some(row) = table.rows().iter().find(|row| row.split == SplitType::NoSplit)
    {
        return Err(Error::Unassigned(row.image_name.clone()));
    }

    let result = SplitResult {
        train_set: table.names_in(SplitType::Train),
        val_set: table.names_in(SplitType::Val),
        test_set: include_test.then(|| table.names_in(SplitType::Test)),
    };
    info!(
        "Split {} images: {} train, {} val, {} test",
        table.len(),
        result.train_set.len(),
        result.val_set.len(),
        result.test_set.as_ref().map_or(0, |t| t.len()));
    Ok((table, result))
}

#[derive(Serialize)]
struct CsvRow<'a>
{
    image_names: &'a str,
    clusters: i32,
    split_type: SplitType,
}

fn create_parent(path: &Path) -> Result<()>
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes the table as CSV with the columns `image_names,clusters,split_type`.
pub fn write_csv(table: &ClusterTable, path: &Path) -> Result<()>
{
    create_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in table.rows()
    {
        writer.serialize(CsvRow { image_names: &row.image_name, clusters: row.cluster, split_type: row.split })?;
    }
    writer.flush()?;
    info!("Wrote {} rows to {:?}", table.len(), path);
    Ok(())
}

pub fn write_json(result: &SplitResult, path: &Path) -> Result<()>
{
    create_parent(path)?;
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), result)?;
    info!("Wrote split result to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn table(labels: &[i32]) -> ClusterTable
    {
        let names = (0..labels.len()).map(|i| format!("img_{:02}.png", i)).collect();
        ClusterTable::new(names, labels.to_vec()).unwrap()
    }

    fn assert_partition(result: &SplitResult, total: usize)
    {
        let mut all: Vec<&String> = result.train_set.iter()
            .chain(&result.val_set)
            .chain(result.test_set.iter().flatten())
            .collect();
        assert_eq!(all.len(), total);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn two_way_two_pairs()
    {
        let (table, result) = stratified_split(table(&[0, 0, 1, 1]), 0.9, false, 2024).unwrap();
        assert_eq!(result.test_set, None);
        assert_eq!(result.train_set.len(), 2);
        assert_eq!(result.val_set.len(), 2);
        assert_partition(&result, 4);
        assert!(table.rows().iter().all(|row| row.split != SplitType::NoSplit));

        // One row of each cluster on each side.
        for split in [SplitType::Train, SplitType::Val]
        {
            let mut labels: Vec<i32> = table.rows().iter().filter(|r| r.split == split).map(|r| r.cluster).collect();
            labels.sort();
            assert_eq!(labels, vec![0, 1]);
        }
    }

    #[test]
    fn three_way_two_pairs_keeps_singletons_in_train()
    {
        let (table, result) = stratified_split(table(&[0, 0, 1, 1]), 0.9, true, 2024).unwrap();
        assert_eq!(result.train_set.len(), 2);
        assert_eq!(result.test_set.as_ref().map(|t| t.len()), Some(2));
        assert!(result.val_set.is_empty());
        assert_partition(&result, 4);
        assert!(table.rows().iter().all(|row| row.split != SplitType::NoSplit));
    }

    #[test]
    fn proportions_hold_per_cluster()
    {
        let mut labels = vec![0; 10];
        labels.extend(vec![1; 20]);
        labels.extend(vec![2; 7]);
        let (table, result) = stratified_split(table(&labels), 0.7, false, 11).unwrap();
        assert_partition(&result, 37);

        for (label, members) in table.members_by_label()
        {
            let n = members.len();
            let train = members.iter().filter(|r| table.rows()[**r].split == SplitType::Train).count();
            let expected = (0.7 * n as f64).round() as usize;
            assert_eq!(train, expected, "cluster {}", label);
        }
    }

    #[test]
    fn three_way_proportions()
    {
        let labels: Vec<i32> = (0..60).map(|i| i % 3).collect();
        let (_, result) = stratified_split(table(&labels), 0.8, true, 5).unwrap();
        // 20 per cluster: 16 candidates, 4 test; 16 -> 13 train, 3 val.
        assert_eq!(result.test_set.as_ref().map(|t| t.len()), Some(12));
        assert_eq!(result.train_set.len(), 39);
        assert_eq!(result.val_set.len(), 9);
        assert_partition(&result, 60);
    }

    #[test]
    fn single_member_cluster_is_rejected()
    {
        let err = stratified_split(table(&[0, 0, 0, 7]), 0.5, false, 1).unwrap_err();
        assert!(matches!(err, Error::DegenerateCluster { label: 7, count: 1 }));
    }

    #[test]
    fn noise_label_is_an_ordinary_cluster()
    {
        let (_, result) = stratified_split(table(&[-1, 0, -1, 0]), 0.5, false, 3).unwrap();
        assert_partition(&result, 4);
    }

    #[test]
    fn same_seed_same_split()
    {
        let labels: Vec<i32> = (0..40).map(|i| i % 4).collect();
        let a = stratified_split(table(&labels), 0.75, true, 99).unwrap();
        let b = stratified_split(table(&labels), 0.75, true, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn lists_follow_table_order()
    {
        let labels: Vec<i32> = (0..20).map(|i| i % 2).collect();
        let (_, result) = stratified_split(table(&labels), 0.5, false, 8).unwrap();
        let mut sorted = result.train_set.clone();
        sorted.sort();
        assert_eq!(result.train_set, sorted);
    }

    #[test]
    fn bad_fraction_is_rejected()
    {
        assert!(matches!(stratified_split(table(&[0, 0]), 1.0, false, 1), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn csv_has_expected_columns()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("data_split.csv");
        let (table, _) = stratified_split(table(&[3, 3]), 0.5, false, 1).unwrap();
        write_csv(&table, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "image_names,clusters,split_type");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("img_00.png,3,"));
        assert!(lines[1..].iter().any(|l| l.ends_with(",train")));
        assert!(lines[1..].iter().any(|l| l.ends_with(",val")));
    }

    #[test]
    fn json_omits_missing_test_set()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.json");
        let result = SplitResult { train_set: vec!["a".to_string()], val_set: vec!["b".to_string()], test_set: None };
        write_json(&result, &path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get("train_set").is_some());
        assert!(value.get("test_set").is_none());
        let back: SplitResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
