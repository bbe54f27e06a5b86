//! Item category bijection.
//!
//! Items are grouped into contiguous category blocks before encoding. The
//! [`CategoryMap`] records that grouping as two inverse arrays:
//!
//! - `local_to_original[j]` is the original item index stored at
//!   category-order position `j`;
//! - `original_to_local[i]` is the category-order position of item `i`.
//!
//! Both are validated as a bijection over `0..n_items` on construction and
//! never change afterwards.

use std::ops::Range;

use candle_core::{Device, Tensor};
use rand::distributions::WeightedIndex;
use rand::{Rng, RngCore};
use rand_distr::Distribution;
use tracing::{debug, info, warn};

use crate::error::{DiffRecError, DiffRecResult, TensorContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryMap {
    local_to_original: Vec<usize>,
    original_to_local: Vec<usize>,
    category_lens: Vec<usize>,
}

impl CategoryMap {
    /// Single category, identity order.
    pub fn identity(n_items: usize) -> Self {
        let order: Vec<usize> = (0..n_items).collect();
        Self {
            local_to_original: order.clone(),
            original_to_local: order,
            category_lens: vec![n_items],
        }
    }

    /// Group items by category id, keeping ascending item order inside each
    /// category.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::DataIntegrity`] if an id is `>= n_categories` or a
    /// category receives no items.
    pub fn from_assignments(assignments: &[usize], n_categories: usize) -> DiffRecResult<Self> {
        if n_categories == 0 {
            return Err(DiffRecError::Configuration(
                "category count must be at least 1".into(),
            ));
        }
        let mut blocks: Vec<Vec<usize>> = vec![Vec::new(); n_categories];
        for (item, &cat) in assignments.iter().enumerate() {
            let block = blocks.get_mut(cat).ok_or_else(|| {
                DiffRecError::DataIntegrity(format!(
                    "item {} assigned to category {} but only {} categories exist",
                    item, cat, n_categories
                ))
            })?;
            block.push(item);
        }
        if let Some(empty) = blocks.iter().position(Vec::is_empty) {
            return Err(DiffRecError::DataIntegrity(format!(
                "category {} has no items",
                empty
            )));
        }

        let category_lens: Vec<usize> = blocks.iter().map(Vec::len).collect();
        let local_to_original: Vec<usize> = blocks.into_iter().flatten().collect();
        Self::from_permutation(local_to_original, category_lens)
    }

    /// Build from an explicit category-order permutation and block sizes.
    ///
    /// # Errors
    ///
    /// [`DiffRecError::DataIntegrity`] unless `local_to_original` covers every
    /// index in `0..n` exactly once and the block sizes sum to `n`.
    pub fn from_permutation(
        local_to_original: Vec<usize>,
        category_lens: Vec<usize>,
    ) -> DiffRecResult<Self> {
        let n = local_to_original.len();
        let total: usize = category_lens.iter().sum();
        if total != n {
            return Err(DiffRecError::DataIntegrity(format!(
                "category sizes sum to {} but the map covers {} items",
                total, n
            )));
        }
        if category_lens.iter().any(|&len| len == 0) {
            return Err(DiffRecError::DataIntegrity(
                "category sizes must be positive".into(),
            ));
        }

        let mut original_to_local = vec![usize::MAX; n];
        for (local, &original) in local_to_original.iter().enumerate() {
            if original >= n {
                return Err(DiffRecError::DataIntegrity(format!(
                    "category map entry {} points at item {} outside {} items",
                    local, original, n
                )));
            }
            if original_to_local[original] != usize::MAX {
                return Err(DiffRecError::DataIntegrity(format!(
                    "item {} appears twice in the category map",
                    original
                )));
            }
            original_to_local[original] = local;
        }

        debug!(n_items = n, categories = ?category_lens, "Built category map");
        Ok(Self {
            local_to_original,
            original_to_local,
            category_lens,
        })
    }

    pub fn n_items(&self) -> usize {
        self.local_to_original.len()
    }

    pub fn n_categories(&self) -> usize {
        self.category_lens.len()
    }

    pub fn category_lens(&self) -> &[usize] {
        &self.category_lens
    }

    pub fn local_to_original(&self) -> &[usize] {
        &self.local_to_original
    }

    pub fn original_to_local(&self) -> &[usize] {
        &self.original_to_local
    }

    pub fn is_identity(&self) -> bool {
        self.local_to_original.iter().enumerate().all(|(i, &o)| i == o)
    }

    pub fn to_original(&self, local: usize) -> DiffRecResult<usize> {
        self.local_to_original.get(local).copied().ok_or_else(|| {
            DiffRecError::DataIntegrity(format!(
                "category-order index {} outside {} items",
                local,
                self.n_items()
            ))
        })
    }

    pub fn to_local(&self, original: usize) -> DiffRecResult<usize> {
        self.original_to_local.get(original).copied().ok_or_else(|| {
            DiffRecError::DataIntegrity(format!(
                "item index {} outside {} items",
                original,
                self.n_items()
            ))
        })
    }

    /// Column range of category `c` in category order.
    pub fn category_range(&self, c: usize) -> Range<usize> {
        let start: usize = self.category_lens[..c].iter().sum();
        start..start + self.category_lens[c]
    }

    /// Reorder the columns of `(batch, n_items)` scores from original order
    /// into category order.
    pub fn permute_columns(&self, x: &Tensor) -> DiffRecResult<Tensor> {
        self.select_columns(x, &self.local_to_original, "permute columns")
    }

    /// Reorder category-order columns back into original item order.
    pub fn unpermute_columns(&self, x: &Tensor) -> DiffRecResult<Tensor> {
        self.select_columns(x, &self.original_to_local, "unpermute columns")
    }

    /// Map category-order indices (e.g. a top-K result) to original items.
    pub fn map_ranked(&self, local: &[usize]) -> DiffRecResult<Vec<usize>> {
        local.iter().map(|&j| self.to_original(j)).collect()
    }

    /// `local_to_original` as a u32 tensor, for parameter bundles.
    pub fn to_tensor(&self, device: &Device) -> DiffRecResult<Tensor> {
        let values: Vec<u32> = self.local_to_original.iter().map(|&i| i as u32).collect();
        Tensor::from_vec(values, self.n_items(), device).op("category map tensor")
    }

    /// Inverse of [`CategoryMap::to_tensor`] given the stored block sizes.
    pub fn from_tensors(map: &Tensor, lens: &Tensor) -> DiffRecResult<Self> {
        let local_to_original = map
            .to_vec1::<u32>()
            .op("read category map")?
            .into_iter()
            .map(|i| i as usize)
            .collect();
        let category_lens = lens
            .to_vec1::<u32>()
            .op("read category sizes")?
            .into_iter()
            .map(|i| i as usize)
            .collect();
        Self::from_permutation(local_to_original, category_lens)
    }

    fn select_columns(&self, x: &Tensor, order: &[usize], operation: &'static str) -> DiffRecResult<Tensor> {
        let (_, cols) = x.dims2().op(operation)?;
        if cols != self.n_items() {
            return Err(DiffRecError::shape(operation, self.n_items(), cols));
        }
        let idx: Vec<u32> = order.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, order.len(), x.device()).op(operation)?;
        x.index_select(&idx, 1).op(operation)
    }
}

/// Assign each embedding row to one of `k` clusters with seeded k-means.
///
/// Initial centroids follow k-means++ (first uniformly, the rest weighted by
/// squared distance to the nearest chosen centroid). A cluster that loses all
/// its members keeps its previous centroid.
pub fn kmeans_assignments(
    embeddings: &[Vec<f32>],
    k: usize,
    max_iterations: usize,
    rng: &mut dyn RngCore,
) -> DiffRecResult<Vec<usize>> {
    let n = embeddings.len();
    if k == 0 || k > n {
        return Err(DiffRecError::Configuration(format!(
            "cannot form {} clusters from {} items",
            k, n
        )));
    }
    let dim = embeddings[0].len();
    if let Some(bad) = embeddings.iter().position(|e| e.len() != dim) {
        return Err(DiffRecError::shape(
            format!("item embedding {}", bad),
            dim,
            embeddings[bad].len(),
        ));
    }

    let mut centroids = init_centroids_kmeans_pp(embeddings, k, rng);
    let mut assignments = vec![usize::MAX; n];
    let mut iteration = 0;

    loop {
        iteration += 1;

        let mut changed = false;
        for (i, e) in embeddings.iter().enumerate() {
            let nearest = nearest_centroid(e, &centroids);
            if nearest != assignments[i] {
                changed = true;
                assignments[i] = nearest;
            }
        }

        if !changed || iteration >= max_iterations {
            info!(items = n, k, iterations = iteration, converged = !changed, "K-means finished");
            break;
        }

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f32>> = embeddings
                .iter()
                .zip(&assignments)
                .filter(|(_, &a)| a == c)
                .map(|(e, _)| e)
                .collect();
            if members.is_empty() {
                warn!(cluster = c, "Empty k-means cluster, keeping previous centroid");
                continue;
            }
            let inv = 1.0 / members.len() as f32;
            for d in 0..dim {
                centroid[d] = members.iter().map(|m| m[d]).sum::<f32>() * inv;
            }
        }
    }

    Ok(assignments)
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_centroid(e: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(e, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

fn init_centroids_kmeans_pp(embeddings: &[Vec<f32>], k: usize, rng: &mut dyn RngCore) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(embeddings[rng.gen_range(0..embeddings.len())].clone());

    while centroids.len() < k {
        let weights: Vec<f32> = embeddings
            .iter()
            .map(|e| {
                centroids
                    .iter()
                    .map(|c| squared_distance(e, c))
                    .fold(f32::INFINITY, f32::min)
            })
            .collect();
        // All-zero weights (duplicate points) fall back to a uniform draw.
        let next = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut *rng),
            Err(_) => rng.gen_range(0..embeddings.len()),
        };
        centroids.push(embeddings[next].clone());
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::seeded_rng;

    fn six_item_map() -> CategoryMap {
        // items 0..6 with categories [2, 0, 1, 0, 2, 1]
        CategoryMap::from_assignments(&[2, 0, 1, 0, 2, 1], 3).unwrap()
    }

    #[test]
    fn test_from_assignments_orders_blocks() {
        let map = six_item_map();
        assert_eq!(map.local_to_original(), &[1, 3, 2, 5, 0, 4]);
        assert_eq!(map.category_lens(), &[2, 2, 2]);
        assert_eq!(map.category_range(1), 2..4);
    }

    #[test]
    fn test_map_then_inverse_is_identity() {
        let map = six_item_map();
        for i in 0..map.n_items() {
            assert_eq!(map.to_original(map.to_local(i).unwrap()).unwrap(), i);
            assert_eq!(map.to_local(map.to_original(i).unwrap()).unwrap(), i);
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = CategoryMap::from_permutation(vec![0, 1, 1], vec![3]).unwrap_err();
        assert!(matches!(err, DiffRecError::DataIntegrity(_)));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = CategoryMap::from_permutation(vec![0, 3, 1], vec![1, 2]).unwrap_err();
        assert!(matches!(err, DiffRecError::DataIntegrity(_)));
        let err = CategoryMap::from_assignments(&[0, 4], 2).unwrap_err();
        assert!(matches!(err, DiffRecError::DataIntegrity(_)));
    }

    #[test]
    fn test_empty_category_rejected() {
        let err = CategoryMap::from_assignments(&[0, 0, 2], 3).unwrap_err();
        assert!(matches!(err, DiffRecError::DataIntegrity(_)));
    }

    #[test]
    fn test_permute_unpermute_columns() {
        let map = six_item_map();
        let x = Tensor::new(&[[0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]], &Device::Cpu).unwrap();
        let local = map.permute_columns(&x).unwrap();
        assert_eq!(
            local.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 3.0, 2.0, 5.0, 0.0, 4.0]]
        );
        let back = map.unpermute_columns(&local).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_column_count_checked() {
        let map = six_item_map();
        let x = Tensor::zeros((1, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            map.permute_columns(&x),
            Err(DiffRecError::Shape { .. })
        ));
    }

    #[test]
    fn test_tensor_round_trip() {
        let map = six_item_map();
        let lens = Tensor::new(&[2u32, 2, 2], &Device::Cpu).unwrap();
        let back = CategoryMap::from_tensors(&map.to_tensor(&Device::Cpu).unwrap(), &lens).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_kmeans_separates_clusters() {
        let embeddings = vec![
            vec![0.0, 0.0],
            vec![10.0, 10.0],
            vec![0.1, 0.0],
            vec![10.0, 10.1],
            vec![0.0, 0.2],
        ];
        let a = kmeans_assignments(&embeddings, 2, 20, &mut seeded_rng(1)).unwrap();
        assert_eq!(a[0], a[2]);
        assert_eq!(a[0], a[4]);
        assert_eq!(a[1], a[3]);
        assert_ne!(a[0], a[1]);

        let b = kmeans_assignments(&embeddings, 2, 20, &mut seeded_rng(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmeans_rejects_too_many_clusters() {
        let embeddings = vec![vec![0.0], vec![1.0]];
        assert!(kmeans_assignments(&embeddings, 3, 10, &mut seeded_rng(0)).is_err());
    }
}
