use std::{cmp::Ordering, collections::BinaryHeap};

use log::debug;
use nalgebra_glm::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::math::AABB;

use super::{sort_along_curve, traverse, HierarchicalIndex, Primitive, TreeVisitor};

/// A spatial query answered by the traversal engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Query {
    /// The k objects nearest to the point.
    Nearest { point: Vec3, k: usize },

    /// All objects within the given distance to the point.
    Within { point: Vec3, radius: f32 },

    /// All objects whose bounding volume overlaps the given volume.
    Intersects { volume: AABB },
}

impl Query {
    #[inline]
    pub fn nearest(point: Vec3, k: usize) -> Self {
        Self::Nearest { point, k }
    }

    #[inline]
    pub fn within(point: Vec3, radius: f32) -> Self {
        Self::Within { point, radius }
    }

    #[inline]
    pub fn intersects(volume: AABB) -> Self {
        Self::Intersects { volume }
    }

    /// Returns the distance between the query and the given volume as used for ordering the
    /// results, i.e., the distance to the point or, for box queries, between the boxes.
    #[inline]
    pub fn distance(&self, volume: &AABB) -> f32 {
        match self {
            Query::Nearest { point, .. } | Query::Within { point, .. } => {
                volume.point_distance(point)
            }
            Query::Intersects { volume: q } => volume.aabb_distance(q),
        }
    }
}

impl Primitive for Query {
    /// The region that may contain results. Unbounded for nearest queries, hence only the point.
    fn bounding_volume(&self) -> AABB {
        match self {
            Query::Nearest { point, .. } => AABB::from_point(point),
            Query::Within { point, radius } => AABB::new_cube(point, radius.max(0f32) * 2f32),
            Query::Intersects { volume } => *volume,
        }
    }
}

/// A single query result, i.e., the index of the found object and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

impl Neighbor {
    /// Total order by distance and then by index.
    #[inline]
    pub fn cmp_by_distance(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

/// The results of a single query ordered by increasing distance and then by index.
pub type QueryResult = Vec<Neighbor>;

/// Heap entry ordered by distance and index, such that the heap top is the worst candidate.
#[derive(Debug, Clone, Copy)]
struct Candidate(Neighbor);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_by_distance(&other.0)
    }
}

/// Collects the k nearest objects with branch-and-bound pruning.
pub struct NearestVisitor {
    point: Vec3,
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl NearestVisitor {
    pub fn new(point: Vec3, k: usize) -> Self {
        Self {
            point,
            k,
            heap: BinaryHeap::with_capacity(k.min(1024)),
        }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }
}

impl TreeVisitor for NearestVisitor {
    type Output = QueryResult;

    #[inline]
    fn should_explore(&mut self, _node: usize, volume: &AABB) -> bool {
        if self.k == 0 {
            return false;
        }

        !self.is_full() || volume.point_distance(&self.point) <= self.bound()
    }

    fn visit(&mut self, _node: usize, object: usize, volume: &AABB) {
        let candidate = Candidate(Neighbor {
            index: object,
            distance: volume.point_distance(&self.point),
        });

        if !self.is_full() {
            self.heap.push(candidate);
        } else if let Some(mut worst) = self.heap.peek_mut() {
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    #[inline]
    fn distance_hint(&self, volume: &AABB) -> Option<f32> {
        Some(volume.point_distance(&self.point))
    }

    #[inline]
    fn bound(&self) -> f32 {
        match self.heap.peek() {
            Some(worst) if self.is_full() => worst.0.distance,
            _ => f32::INFINITY,
        }
    }

    fn finish(self) -> Self::Output {
        self.heap.into_sorted_vec().into_iter().map(|c| c.0).collect()
    }
}

/// Collects all objects for which the query distance is within the given limit.
pub struct RangeVisitor {
    query: Query,
    max_distance: f32,
    result: QueryResult,
}

impl RangeVisitor {
    /// Creates a visitor for a within or intersects query. Nearest queries find nothing.
    pub fn new(query: Query) -> Self {
        let max_distance = match query {
            Query::Within { radius, .. } => radius,
            Query::Intersects { .. } => 0f32,
            Query::Nearest { .. } => f32::NEG_INFINITY,
        };

        Self {
            query,
            max_distance,
            result: Vec::new(),
        }
    }
}

impl TreeVisitor for RangeVisitor {
    type Output = QueryResult;

    #[inline]
    fn should_explore(&mut self, _node: usize, volume: &AABB) -> bool {
        self.query.distance(volume) <= self.max_distance
    }

    fn visit(&mut self, _node: usize, object: usize, volume: &AABB) {
        let distance = self.query.distance(volume);
        if distance <= self.max_distance {
            self.result.push(Neighbor {
                index: object,
                distance,
            });
        }
    }

    fn finish(mut self) -> Self::Output {
        self.result.sort_unstable_by(Neighbor::cmp_by_distance);
        self.result
    }
}

/// Answers a single query on the given hierarchical index.
///
/// # Arguments
/// * `index` - The hierarchical index to query.
/// * `q` - The query.
pub fn query<I: HierarchicalIndex>(index: &I, q: &Query) -> QueryResult {
    match *q {
        Query::Nearest { point, k } => traverse(index, NearestVisitor::new(point, k)),
        Query::Within { .. } | Query::Intersects { .. } => traverse(index, RangeVisitor::new(*q)),
    }
}

/// Answers a batch of queries in parallel. The results are returned in the order of the queries.
///
/// # Arguments
/// * `index` - The hierarchical index to query.
/// * `bounds` - The bounding volume of the index, used for sorting the queries.
/// * `queries` - The queries to answer.
/// * `sort_queries` - If true, the queries are processed in the order of their Morton codes for
///   better memory locality.
pub fn query_batch<I>(
    index: &I,
    bounds: &AABB,
    queries: &[Query],
    sort_queries: bool,
) -> Vec<QueryResult>
where
    I: HierarchicalIndex + Sync,
{
    debug!(
        "Answering {} queries, sorted={}...",
        queries.len(),
        sort_queries
    );

    if !sort_queries {
        return queries.par_iter().map(|q| query(index, q)).collect();
    }

    let permutation = sort_along_curve(bounds, queries);
    let sorted = permutation.apply(queries);
    let results: Vec<QueryResult> = sorted.par_iter().map(|q| query(index, q)).collect();

    permutation.restore(results)
}

#[cfg(test)]
mod test {
    use nalgebra_glm::vec3;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::spatial::BVH;

    fn gen_random_points(rng: &mut ChaCha8Rng, n: usize) -> Vec<Vec3> {
        (0..n)
            .map(|_| {
                vec3(
                    rng.random_range(0f32..1f32),
                    rng.random_range(0f32..1f32),
                    rng.random_range(0f32..1f32),
                )
            })
            .collect()
    }

    /// Linear scan over all points.
    fn brute_force(points: &[Vec3], q: &Query) -> QueryResult {
        let mut all: Vec<Neighbor> = points
            .iter()
            .enumerate()
            .map(|(index, p)| Neighbor {
                index,
                distance: q.distance(&AABB::from_point(p)),
            })
            .collect();
        all.sort_unstable_by(Neighbor::cmp_by_distance);

        match *q {
            Query::Nearest { k, .. } => all.truncate(k),
            Query::Within { radius, .. } => all.retain(|n| n.distance <= radius),
            Query::Intersects { .. } => all.retain(|n| n.distance <= 0f32),
        }

        all
    }

    fn indices(result: &QueryResult) -> Vec<usize> {
        result.iter().map(|n| n.index).collect()
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(1000);
        let points = gen_random_points(&mut rng, 1000);
        let bvh = BVH::new(&points);

        for _ in 0..100 {
            let p = vec3(
                rng.random_range(-0.2f32..1.2f32),
                rng.random_range(-0.2f32..1.2f32),
                rng.random_range(-0.2f32..1.2f32),
            );
            let q = Query::nearest(p, 10);

            let result = query(&bvh, &q);
            let expected = brute_force(&points, &q);

            assert_eq!(result.len(), 10);
            assert_eq!(indices(&result), indices(&expected));
            assert!(result
                .windows(2)
                .all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_nearest_result_lengths() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let points = gen_random_points(&mut rng, 25);
        let bvh = BVH::new(&points);
        let p = vec3(0.5, 0.5, 0.5);

        for k in [0, 1, 5, 25, 26, 100] {
            let result = query(&bvh, &Query::nearest(p, k));
            assert_eq!(result.len(), k.min(25));
            assert!(result
                .windows(2)
                .all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn test_nearest_ties_ordered_by_index() {
        let points = vec![
            vec3(1.0, 0.0, 0.0),
            vec3(-1.0, 0.0, 0.0),
            vec3(0.0, 1.0, 0.0),
            vec3(0.0, -1.0, 0.0),
            vec3(5.0, 5.0, 5.0),
        ];
        let bvh = BVH::new(&points);

        let result = query(&bvh, &Query::nearest(vec3(0.0, 0.0, 0.0), 3));
        assert_eq!(indices(&result), vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_hierarchy() {
        let bvh = BVH::empty();
        let p = vec3(0.0, 0.0, 0.0);

        assert!(query(&bvh, &Query::nearest(p, 5)).is_empty());
        assert!(query(&bvh, &Query::within(p, 10.0)).is_empty());
        assert!(query(&bvh, &Query::intersects(AABB::new_cube(&p, 3.0))).is_empty());
        assert!(query_batch(&bvh, bvh.bounds(), &[Query::nearest(p, 1)], true)[0].is_empty());
    }

    #[test]
    fn test_within_matches_brute_force() {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let points = gen_random_points(&mut rng, 1000);
        let bvh = BVH::new(&points);

        for _ in 0..50 {
            let q = Query::within(gen_random_points(&mut rng, 1)[0], 0.15);

            let result = query(&bvh, &q);
            assert_eq!(indices(&result), indices(&brute_force(&points, &q)));
            assert!(result.iter().all(|n| n.distance <= 0.15));
        }

        assert!(query(&bvh, &Query::within(vec3(0.5, 0.5, 0.5), -1.0)).is_empty());
    }

    #[test]
    fn test_intersects() {
        let boxes: Vec<AABB> = (0..10)
            .map(|i| AABB::new_cube(&vec3(i as f32, 0.0, 0.0), 0.5))
            .collect();
        let bvh = BVH::new(&boxes);

        let q = Query::intersects(AABB::from_corners(
            vec3(2.5, -1.0, -1.0),
            vec3(5.0, 1.0, 1.0),
        ));
        let result = query(&bvh, &q);

        assert_eq!(indices(&result), vec![3, 4, 5]);
        assert!(result.iter().all(|n| n.distance == 0.0));
    }

    #[test]
    fn test_batch_in_caller_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let points = gen_random_points(&mut rng, 500);
        let bvh = BVH::new(&points);

        let queries: Vec<Query> = gen_random_points(&mut rng, 200)
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                if i % 2 == 0 {
                    Query::nearest(p, 4)
                } else {
                    Query::within(p, 0.1)
                }
            })
            .collect();

        let sorted = query_batch(&bvh, bvh.bounds(), &queries, true);
        let unsorted = query_batch(&bvh, bvh.bounds(), &queries, false);

        assert_eq!(sorted, unsorted);
        for (q, r) in queries.iter().zip(sorted.iter()) {
            assert_eq!(*r, query(&bvh, q));
        }
    }
}
