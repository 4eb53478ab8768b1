//! Sorting batches of queries along the Z-order curve.
//!
//! Answering spatially sorted queries touches the same parts of the hierarchy consecutively.
//! The sorting yields a [Permutation] that reorders the queries and maps the results back into
//! the order of the caller.

use log::trace;
use rayon::prelude::*;

use crate::math::AABB;

use super::{
    morton::{morton_code, sort_codes, MortonCode},
    Primitive,
};

/// A bijection on the index set [0, n). The i-th element of the permuted sequence is the
/// element at position `indices[i]` of the original sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    indices: Vec<usize>,
}

impl Permutation {
    /// Returns the identity permutation over n elements.
    pub fn identity(n: usize) -> Self {
        Self {
            indices: (0..n).collect(),
        }
    }

    /// Creates a permutation from the given indices. Returns None if the indices are not a
    /// bijection on [0, n).
    pub fn from_indices(indices: Vec<usize>) -> Option<Self> {
        let mut seen = vec![false; indices.len()];
        for &i in indices.iter() {
            if i >= seen.len() || seen[i] {
                return None;
            }
            seen[i] = true;
        }

        Some(Self { indices })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[usize] {
        &self.indices
    }

    /// Returns the inverse permutation.
    pub fn inverse(&self) -> Self {
        let mut indices = vec![0; self.indices.len()];
        for (i, &j) in self.indices.iter().enumerate() {
            indices[j] = i;
        }

        Self { indices }
    }

    /// Returns the given items reordered by the permutation.
    ///
    /// # Arguments
    /// * `items` - The items in the original order.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        assert_eq!(items.len(), self.len(), "permutation size mismatch");

        self.indices.iter().map(|&i| items[i].clone()).collect()
    }

    /// Moves items given in the permuted order back into the original order, i.e., applies the
    /// inverse permutation without cloning.
    ///
    /// # Arguments
    /// * `items` - The items in the permuted order.
    pub fn restore<T: Send>(&self, items: Vec<T>) -> Vec<T> {
        assert_eq!(items.len(), self.len(), "permutation size mismatch");

        let mut tagged: Vec<(usize, T)> = self.indices.iter().copied().zip(items).collect();
        tagged.par_sort_unstable_by_key(|(i, _)| *i);

        tagged.into_iter().map(|(_, item)| item).collect()
    }
}

/// Computes the permutation that sorts the given items along the Z-order curve. The Morton codes
/// of the item centers are computed relative to the given bounds, such that they are comparable
/// with the codes of the objects in a hierarchy with these bounds. Ties are ordered by index.
///
/// # Arguments
/// * `bounds` - The bounding volume of the hierarchy.
/// * `items` - The items to sort, usually queries.
pub fn sort_along_curve<P: Primitive + Sync>(bounds: &AABB, items: &[P]) -> Permutation {
    let codes: Vec<MortonCode> = items
        .par_iter()
        .map(|item| morton_code(bounds, &item.bounding_volume().get_center()))
        .collect();

    trace!("Sorting {} items along the curve", codes.len());

    Permutation {
        indices: sort_codes(&codes),
    }
}

/// Returns the items reordered by the given permutation.
///
/// # Arguments
/// * `permutation` - The permutation to apply.
/// * `items` - The items to reorder.
#[inline]
pub fn apply_permutation<T: Clone>(permutation: &Permutation, items: &[T]) -> Vec<T> {
    permutation.apply(items)
}

#[cfg(test)]
mod test {
    use nalgebra_glm::{vec3, Vec3};
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::spatial::Query;

    fn gen_queries(rng: &mut ChaCha8Rng, n: usize) -> Vec<Query> {
        (0..n)
            .map(|_| {
                Query::nearest(
                    vec3(
                        rng.random_range(0f32..1f32),
                        rng.random_range(0f32..1f32),
                        rng.random_range(0f32..1f32),
                    ),
                    3,
                )
            })
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let queries = gen_queries(&mut rng, 300);
        let bounds = AABB::from_corners(vec3(0.0, 0.0, 0.0), vec3(1.0, 1.0, 1.0));

        let permutation = sort_along_curve(&bounds, &queries);
        assert!(Permutation::from_indices(permutation.as_slice().to_vec()).is_some());

        let sorted = apply_permutation(&permutation, &queries);
        assert_eq!(apply_permutation(&permutation.inverse(), &sorted), queries);
        assert_eq!(permutation.restore(sorted), queries);
    }

    #[test]
    fn test_sorted_along_curve() {
        let bounds = AABB::from_corners(vec3(0.0, 0.0, 0.0), vec3(1.0, 1.0, 1.0));
        let points: Vec<Vec3> = vec![
            vec3(0.9, 0.9, 0.9),
            vec3(0.1, 0.1, 0.1),
            vec3(0.9, 0.1, 0.1),
            vec3(0.1, 0.1, 0.1),
        ];

        let permutation = sort_along_curve(&bounds, &points);
        assert_eq!(permutation.as_slice(), &[1, 3, 2, 0]);
    }

    #[test]
    fn test_deterministic() {
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let queries = gen_queries(&mut rng, 1000);
        let bounds = AABB::from_corners(vec3(0.0, 0.0, 0.0), vec3(1.0, 1.0, 1.0));

        assert_eq!(
            sort_along_curve(&bounds, &queries),
            sort_along_curve(&bounds, &queries)
        );
    }

    #[test]
    fn test_invalid_indices() {
        assert!(Permutation::from_indices(vec![0, 0, 1]).is_none());
        assert!(Permutation::from_indices(vec![0, 3, 1]).is_none());
        assert_eq!(
            Permutation::from_indices(vec![2, 0, 1]).unwrap().inverse(),
            Permutation::from_indices(vec![1, 2, 0]).unwrap()
        );
        assert!(Permutation::identity(0).is_empty());
    }
}
