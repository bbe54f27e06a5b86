//! Interaction data, user attributes and batching.
//!
//! Interaction files hold one `user item` pair per line, separated by a tab,
//! a comma or spaces. The user and item counts are inferred from the training
//! pairs (largest index + 1); validation and test pairs must fit that shape.
//! Attribute files hold one raw value per line, line `u` belonging to user `u`.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::category::CategoryMap;
use crate::error::{DiffRecError, DiffRecResult, TensorContext};

/// Binary users × items interaction matrix, stored as sorted rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionMatrix {
    n_users: usize,
    n_items: usize,
    rows: Vec<Vec<usize>>,
}

impl InteractionMatrix {
    pub fn empty(n_users: usize, n_items: usize) -> Self {
        Self {
            n_users,
            n_items,
            rows: vec![Vec::new(); n_users],
        }
    }

    /// Build from `(user, item)` pairs; duplicates collapse.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::DataIntegrity`] when a user or item index is out of range.
    pub fn from_pairs(pairs: &[(usize, usize)], n_users: usize, n_items: usize) -> DiffRecResult<Self> {
        let mut sets: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n_users];
        for &(user, item) in pairs {
            if user >= n_users {
                return Err(DiffRecError::DataIntegrity(format!(
                    "user index {} outside {} users",
                    user, n_users
                )));
            }
            if item >= n_items {
                return Err(DiffRecError::DataIntegrity(format!(
                    "item index {} outside {} items",
                    item, n_items
                )));
            }
            sets[user].insert(item);
        }
        Ok(Self {
            n_users,
            n_items,
            rows: sets.into_iter().map(|s| s.into_iter().collect()).collect(),
        })
    }

    /// Same rows over a wider item range.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::Shape`] when `n_items` is smaller than the current width.
    pub fn with_n_items(self, n_items: usize) -> DiffRecResult<Self> {
        if n_items < self.n_items {
            return Err(DiffRecError::shape(
                "interaction item count",
                format!(">= {}", self.n_items),
                n_items,
            ));
        }
        Ok(Self { n_items, ..self })
    }

    pub fn n_users(&self) -> usize {
        self.n_users
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    /// Sorted item indices of `user`.
    pub fn row(&self, user: usize) -> &[usize] {
        &self.rows[user]
    }

    /// Number of stored interactions.
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Elementwise OR of two matrices of the same shape.
    pub fn union(&self, other: &InteractionMatrix) -> DiffRecResult<Self> {
        if self.n_users != other.n_users || self.n_items != other.n_items {
            return Err(DiffRecError::shape(
                "interaction union",
                format!("({}, {})", self.n_users, self.n_items),
                format!("({}, {})", other.n_users, other.n_items),
            ));
        }
        let rows = self
            .rows
            .iter()
            .zip(&other.rows)
            .map(|(a, b)| {
                let merged: BTreeSet<usize> = a.iter().chain(b).copied().collect();
                merged.into_iter().collect()
            })
            .collect();
        Ok(Self {
            n_users: self.n_users,
            n_items: self.n_items,
            rows,
        })
    }

    /// Same interactions with item columns in category order.
    pub fn to_category_order(&self, map: &CategoryMap) -> DiffRecResult<Self> {
        if map.n_items() != self.n_items {
            return Err(DiffRecError::shape("category order", self.n_items, map.n_items()));
        }
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut mapped: Vec<usize> = row.iter().map(|&i| map.original_to_local()[i]).collect();
                mapped.sort_unstable();
                mapped
            })
            .collect();
        Ok(Self {
            n_users: self.n_users,
            n_items: self.n_items,
            rows,
        })
    }

    /// Dense `(users.len(), n_items)` rows, built in parallel.
    pub fn dense_rows(&self, users: &[usize], device: &Device) -> DiffRecResult<Tensor> {
        if let Some(&bad) = users.iter().find(|&&u| u >= self.n_users) {
            return Err(DiffRecError::DataIntegrity(format!(
                "user index {} outside {} users",
                bad, self.n_users
            )));
        }
        let n_items = self.n_items;
        let values: Vec<f32> = users
            .par_iter()
            .flat_map_iter(|&u| {
                let mut dense = vec![0.0f32; n_items];
                for &i in &self.rows[u] {
                    dense[i] = 1.0;
                }
                dense
            })
            .collect();
        Tensor::from_vec(values, (users.len(), n_items), device).op("dense interaction rows")
    }
}

/// Shape implied by a set of pairs: largest user and item index + 1.
pub fn infer_shape(pairs: &[(usize, usize)]) -> (usize, usize) {
    let n_users = pairs.iter().map(|p| p.0 + 1).max().unwrap_or(0);
    let n_items = pairs.iter().map(|p| p.1 + 1).max().unwrap_or(0);
    (n_users, n_items)
}

/// Parse `user item` lines; blank lines and `#` comments are skipped.
pub fn parse_interactions(content: &str) -> DiffRecResult<Vec<(usize, usize)>> {
    let mut pairs = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line
            .split(|c: char| c == '\t' || c == ',' || c == ' ')
            .filter(|f| !f.is_empty());
        let parse = |field: Option<&str>| -> DiffRecResult<usize> {
            field
                .and_then(|f| f.parse::<usize>().ok())
                .ok_or_else(|| {
                    DiffRecError::Serialization(format!(
                        "line {}: expected 'user item', got '{}'",
                        lineno + 1,
                        line
                    ))
                })
        };
        let user = parse(fields.next())?;
        let item = parse(fields.next())?;
        pairs.push((user, item));
    }
    Ok(pairs)
}

pub fn load_interaction_file(path: &Path) -> DiffRecResult<Vec<(usize, usize)>> {
    let content = fs::read_to_string(path)?;
    let pairs = parse_interactions(&content)?;
    debug!(path = %path.display(), pairs = pairs.len(), "Loaded interaction file");
    Ok(pairs)
}

/// Train, validation and test interactions sharing one shape.
#[derive(Debug, Clone)]
pub struct InteractionSplits {
    pub train: InteractionMatrix,
    pub valid: InteractionMatrix,
    pub test: InteractionMatrix,
}

impl InteractionSplits {
    /// Build the splits; the shape comes from the training pairs.
    pub fn from_pairs(
        train: &[(usize, usize)],
        valid: &[(usize, usize)],
        test: &[(usize, usize)],
    ) -> DiffRecResult<Self> {
        let (n_users, n_items) = infer_shape(train);
        let splits = Self {
            train: InteractionMatrix::from_pairs(train, n_users, n_items)?,
            valid: InteractionMatrix::from_pairs(valid, n_users, n_items)?,
            test: InteractionMatrix::from_pairs(test, n_users, n_items)?,
        };
        info!(
            n_users,
            n_items,
            train = splits.train.nnz(),
            valid = splits.valid.nnz(),
            test = splits.test.nnz(),
            "Interaction data ready"
        );
        Ok(splits)
    }

    /// Load `train_list.txt`, `valid_list.txt` and `test_list.txt` from `dir`.
    pub fn load_dir(dir: &Path) -> DiffRecResult<Self> {
        let train = load_interaction_file(&dir.join("train_list.txt"))?;
        let valid = load_interaction_file(&dir.join("valid_list.txt"))?;
        let test = load_interaction_file(&dir.join("test_list.txt"))?;
        Self::from_pairs(&train, &valid, &test)
    }

    pub fn n_users(&self) -> usize {
        self.train.n_users()
    }

    /// Widen all splits to `n_items`, e.g. when trailing items never occur in training.
    pub fn with_n_items(self, n_items: usize) -> DiffRecResult<Self> {
        Ok(Self {
            train: self.train.with_n_items(n_items)?,
            valid: self.valid.with_n_items(n_items)?,
            test: self.test.with_n_items(n_items)?,
        })
    }

    pub fn n_items(&self) -> usize {
        self.train.n_items()
    }
}

/// Maps raw attribute values to contiguous class ids in sorted order.
///
/// Values that all parse as numbers sort numerically, otherwise
/// lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<S: AsRef<str>>(values: &[S]) -> Self {
        let mut classes: Vec<String> = values
            .iter()
            .map(|v| v.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let numeric: Option<Vec<f64>> = classes.iter().map(|c| c.parse::<f64>().ok()).collect();
        if let Some(keys) = numeric {
            let mut keyed: Vec<(f64, String)> = keys.into_iter().zip(classes).collect();
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            classes = keyed.into_iter().map(|(_, c)| c).collect();
        }
        Self { classes }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// # Errors
    ///
    /// [`DiffRecError::DataIntegrity`] for a value not seen by `fit`.
    pub fn transform<S: AsRef<str>>(&self, values: &[S]) -> DiffRecResult<Vec<u32>> {
        values
            .iter()
            .map(|v| {
                let v = v.as_ref();
                self.classes
                    .iter()
                    .position(|c| c == v)
                    .map(|p| p as u32)
                    .ok_or_else(|| DiffRecError::DataIntegrity(format!("unseen label '{}'", v)))
            })
            .collect()
    }

    pub fn fit_transform<S: AsRef<str>>(values: &[S]) -> DiffRecResult<(Self, Vec<u32>)> {
        let encoder = Self::fit(values);
        let labels = encoder.transform(values)?;
        Ok((encoder, labels))
    }
}

/// User attribute used as the diffusion condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionField {
    #[default]
    Age,
    Gender,
}

impl ConditionField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Gender => "gender",
        }
    }

    /// Attribute file name inside a dataset directory.
    pub fn file_name(&self) -> String {
        format!("{}.txt", self.as_str())
    }
}

impl fmt::Display for ConditionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionField {
    type Err = DiffRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "age" => Ok(Self::Age),
            "gender" => Ok(Self::Gender),
            other => Err(DiffRecError::Configuration(format!(
                "unknown condition field '{}' (expected age or gender)",
                other
            ))),
        }
    }
}

/// One raw attribute value per line; trailing blank lines are ignored.
pub fn load_attribute_file(path: &Path) -> DiffRecResult<Vec<String>> {
    let content = fs::read_to_string(path)?;
    let mut values: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
    while values.last().is_some_and(|v| v.is_empty()) {
        values.pop();
    }
    Ok(values)
}

/// One item embedding per line, values separated by whitespace or commas.
pub fn parse_item_embeddings(content: &str) -> DiffRecResult<Vec<Vec<f32>>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .map(|(n, line)| {
            line.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse::<f32>().map_err(|e| {
                        DiffRecError::Serialization(format!(
                            "line {}: bad embedding value '{}': {}",
                            n + 1,
                            v,
                            e
                        ))
                    })
                })
                .collect()
        })
        .collect()
}

pub fn load_item_embeddings(path: &Path) -> DiffRecResult<Vec<Vec<f32>>> {
    let embeddings = parse_item_embeddings(&fs::read_to_string(path)?)?;
    debug!(path = %path.display(), items = embeddings.len(), "Loaded item embeddings");
    Ok(embeddings)
}

/// Label-encoded condition for every user.
#[derive(Debug, Clone)]
pub struct ConditionLabels {
    pub field: ConditionField,
    pub encoder: LabelEncoder,
    pub labels: Vec<u32>,
}

impl ConditionLabels {
    pub fn from_values<S: AsRef<str>>(field: ConditionField, values: &[S]) -> DiffRecResult<Self> {
        let (encoder, labels) = LabelEncoder::fit_transform(values)?;
        Ok(Self {
            field,
            encoder,
            labels,
        })
    }

    /// Load `{field}.txt` from `dir` and check it covers `n_users`.
    pub fn load_dir(dir: &Path, field: ConditionField, n_users: usize) -> DiffRecResult<Self> {
        let values = load_attribute_file(&dir.join(field.file_name()))?;
        if values.len() < n_users {
            return Err(DiffRecError::DataIntegrity(format!(
                "{} has {} values but there are {} users",
                field.file_name(),
                values.len(),
                n_users
            )));
        }
        let labels = Self::from_values(field, &values)?;
        info!(
            field = %field,
            classes = labels.encoder.n_classes(),
            users = labels.labels.len(),
            "Loaded condition labels"
        );
        Ok(labels)
    }
}

/// A batch of user indices; `batch_idx` seeds batch-level randomness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBatch {
    pub batch_idx: usize,
    pub users: Vec<usize>,
}

impl UserBatch {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Batches user indices in order or shuffled per epoch.
pub struct DataLoader {
    batch_size: usize,
    indices: Vec<usize>,
    position: usize,
    next_batch_idx: usize,
    rng: Option<StdRng>,
}

impl DataLoader {
    /// In-order batches, as used for evaluation.
    pub fn sequential(n_rows: usize, batch_size: usize) -> DiffRecResult<Self> {
        Self::build(n_rows, batch_size, None)
    }

    /// Batches reshuffled by [`DataLoader::shuffle_epoch`] from a seeded PRNG.
    pub fn shuffled(n_rows: usize, batch_size: usize, seed: u64) -> DiffRecResult<Self> {
        let mut loader = Self::build(n_rows, batch_size, Some(StdRng::seed_from_u64(seed)))?;
        loader.shuffle_epoch();
        Ok(loader)
    }

    fn build(n_rows: usize, batch_size: usize, rng: Option<StdRng>) -> DiffRecResult<Self> {
        if batch_size == 0 {
            return Err(DiffRecError::Configuration("batch size must be greater than 0".into()));
        }
        Ok(Self {
            batch_size,
            indices: (0..n_rows).collect(),
            position: 0,
            next_batch_idx: 0,
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Restart the epoch, reshuffling when the loader is seeded.
    pub fn shuffle_epoch(&mut self) {
        if let Some(rng) = self.rng.as_mut() {
            self.indices.shuffle(rng);
        }
        self.position = 0;
        self.next_batch_idx = 0;
    }

    pub fn next_batch(&mut self) -> Option<UserBatch> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let users = self.indices[self.position..end].to_vec();
        self.position = end;
        let batch_idx = self.next_batch_idx;
        self.next_batch_idx += 1;
        Some(UserBatch { batch_idx, users })
    }

    /// Remaining batches of the current epoch.
    pub fn batches(&mut self) -> Vec<UserBatch> {
        std::iter::from_fn(|| self.next_batch()).collect()
    }
}
