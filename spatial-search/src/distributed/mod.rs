//! Spatial search over primitives that are spread across the ranks of a process group.
//!
//! Every rank indexes its own primitives in a local [BVH]. The bounding volumes of all ranks are
//! shared with every rank and indexed in a small top-level hierarchy, which decides where a query
//! has to be forwarded. All queries are answered collectively: every rank of the group has to call
//! the same query operations in the same order, possibly with zero queries.

use std::cmp::Ordering;

use log::{debug, info};
use nalgebra_glm::Vec3;
use serde::{Deserialize, Serialize};

use crate::{
    distributor::{Distributor, Transport},
    math::AABB,
    spatial::{query, query_batch, Builder, Neighbor, Primitive, Query, BVH},
    Result,
};

/// A query result of the distributed search: the found primitive is the object `index` of
/// `rank`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributedNeighbor {
    pub rank: usize,
    pub index: usize,
    pub distance: f32,
}

impl DistributedNeighbor {
    /// Total order by distance, then rank and then index.
    #[inline]
    pub fn cmp_by_distance(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.rank.cmp(&other.rank))
            .then(self.index.cmp(&other.index))
    }
}

/// The results of a single distributed query ordered by distance, rank and index.
pub type DistributedResult = Vec<DistributedNeighbor>;

/// The bounding volume and the number of primitives of a single rank.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RankSummary {
    bounds: AABB,
    len: usize,
}

/// A spatial index over the primitives of all ranks of a process group.
pub struct DistributedTree<T: Transport> {
    distributor: Distributor<T>,

    /// The hierarchy over the primitives of this rank.
    local: BVH,

    /// The bounding volumes and sizes of all ranks.
    summaries: Vec<RankSummary>,

    /// The hierarchy over the bounding volumes of the non-empty ranks.
    top: BVH,

    /// Maps the objects of the top-level hierarchy to their ranks.
    top_ranks: Vec<usize>,

    sort_queries: bool,
}

impl<T: Transport> DistributedTree<T> {
    /// Builds the distributed tree over the primitives of this rank. Collective.
    ///
    /// # Arguments
    /// * `transport` - The transport of the process group.
    /// * `primitives` - The primitives of this rank.
    pub fn new<P: Primitive + Sync>(transport: T, primitives: &[P]) -> Result<Self> {
        Self::build(transport, primitives, Builder::new())
    }

    /// Builds the distributed tree with the given builder for the local hierarchy. Collective.
    ///
    /// # Arguments
    /// * `transport` - The transport of the process group.
    /// * `primitives` - The primitives of this rank.
    /// * `builder` - The builder for the local hierarchy.
    pub fn build<P: Primitive + Sync>(
        transport: T,
        primitives: &[P],
        builder: Builder,
    ) -> Result<Self> {
        let distributor = Distributor::new(transport);
        let rank = distributor.transport().rank();
        let size = distributor.transport().size();

        info!("Rank {}: indexing {} local primitives...", rank, primitives.len());
        let local = builder.build(primitives);

        // every rank tells every rank about its bounds
        let summary = RankSummary {
            bounds: *local.bounds(),
            len: local.len(),
        };
        let destinations: Vec<usize> = (0..size).collect();
        let plan = distributor.create_plan(&destinations)?;
        let summaries: Vec<RankSummary> =
            distributor.exchange_items(&plan, &vec![summary; size])?;

        let top_ranks: Vec<usize> = summaries
            .iter()
            .enumerate()
            .filter(|(_, s)| s.len > 0)
            .map(|(r, _)| r)
            .collect();
        let top_volumes: Vec<AABB> = top_ranks.iter().map(|&r| summaries[r].bounds).collect();
        let top = BVH::new(&top_volumes);

        debug!(
            "Rank {}: {} of {} ranks hold primitives",
            rank,
            top_ranks.len(),
            size
        );

        Ok(Self {
            distributor,
            local,
            summaries,
            top,
            top_ranks,
            sort_queries: true,
        })
    }

    /// Enables or disables sorting the received queries along the curve before answering them.
    pub fn set_sort_queries(&mut self, sort_queries: bool) {
        self.sort_queries = sort_queries;
    }

    #[inline]
    pub fn distributor(&self) -> &Distributor<T> {
        &self.distributor
    }

    /// Returns the hierarchy over the primitives of this rank.
    #[inline]
    pub fn local(&self) -> &BVH {
        &self.local
    }

    /// Returns the bounding volume of the primitives of the given rank.
    #[inline]
    pub fn rank_bounds(&self, rank: usize) -> &AABB {
        &self.summaries[rank].bounds
    }

    /// Returns the number of primitives of the given rank.
    #[inline]
    pub fn rank_len(&self, rank: usize) -> usize {
        self.summaries[rank].len
    }

    /// Returns the total number of primitives over all ranks.
    pub fn len(&self) -> usize {
        self.summaries.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the bounding volume of the primitives of all ranks.
    pub fn bounds(&self) -> AABB {
        self.summaries
            .iter()
            .fold(AABB::new(), |acc, s| acc.union(&s.bounds))
    }

    /// Finds the k nearest primitives of all ranks for each point. Collective.
    ///
    /// # Arguments
    /// * `points` - The query points of this rank.
    /// * `k` - The number of neighbors to find.
    pub fn query_nearest(&self, points: &[Vec3], k: usize) -> Result<Vec<DistributedResult>> {
        let queries: Vec<Query> = points.iter().map(|&p| Query::nearest(p, k)).collect();
        self.query(&queries)
    }

    /// Finds all primitives of all ranks within the radius of each point. Collective.
    ///
    /// # Arguments
    /// * `points` - The query points of this rank.
    /// * `radius` - The search radius.
    pub fn query_within(&self, points: &[Vec3], radius: f32) -> Result<Vec<DistributedResult>> {
        let queries: Vec<Query> = points.iter().map(|&p| Query::within(p, radius)).collect();
        self.query(&queries)
    }

    /// Finds all primitives of all ranks overlapping each volume. Collective.
    ///
    /// # Arguments
    /// * `volumes` - The query volumes of this rank.
    pub fn query_intersects(&self, volumes: &[AABB]) -> Result<Vec<DistributedResult>> {
        let queries: Vec<Query> = volumes.iter().map(|&v| Query::intersects(v)).collect();
        self.query(&queries)
    }

    /// Answers a batch of queries of any kind against the primitives of all ranks. Collective.
    /// The results are returned in the order of the queries.
    ///
    /// Range queries are forwarded to every rank whose bounding volume is in range. Nearest
    /// queries first go to the closest ranks that together hold at least k primitives, which
    /// yields an upper bound for the distance of the k-th neighbor, and then to the remaining
    /// ranks within that bound.
    ///
    /// # Arguments
    /// * `queries` - The queries of this rank.
    pub fn query(&self, queries: &[Query]) -> Result<Vec<DistributedResult>> {
        let mut results: Vec<DistributedResult> = vec![Vec::new(); queries.len()];

        // first round
        let mut forwards = Vec::new();
        let mut candidates: Vec<Vec<(usize, f32)>> = vec![Vec::new(); queries.len()];
        for (i, q) in queries.iter().enumerate() {
            match *q {
                Query::Nearest { point, k } => {
                    if k == 0 {
                        continue;
                    }

                    let ranks = self.ranks_by_distance(&point);
                    let mut count = 0;
                    let mut first = 0;
                    while first < ranks.len() && count < k {
                        count += self.summaries[ranks[first].0].len;
                        forwards.push((i, ranks[first].0));
                        first += 1;
                    }
                    candidates[i] = ranks[first..].to_vec();
                }
                Query::Within { .. } | Query::Intersects { .. } => {
                    let ranks = query(&self.top, q);
                    forwards.extend(ranks.iter().map(|n| (i, self.top_ranks[n.index])));
                }
            }
        }
        self.forward(queries, &forwards, &mut results)?;

        // second round, nearest queries only
        let mut forwards = Vec::new();
        for (i, q) in queries.iter().enumerate() {
            if let Query::Nearest { k, .. } = *q {
                let result = &mut results[i];
                result.sort_unstable_by(DistributedNeighbor::cmp_by_distance);
                let bound = if result.len() >= k && k > 0 {
                    result[k - 1].distance
                } else {
                    f32::INFINITY
                };

                forwards.extend(
                    candidates[i]
                        .iter()
                        .filter(|(_, distance)| *distance <= bound)
                        .map(|&(rank, _)| (i, rank)),
                );
            }
        }
        self.forward(queries, &forwards, &mut results)?;

        for (q, result) in queries.iter().zip(results.iter_mut()) {
            result.sort_unstable_by(DistributedNeighbor::cmp_by_distance);
            if let Query::Nearest { k, .. } = *q {
                result.truncate(k);
            }
        }

        Ok(results)
    }

    /// Returns the non-empty ranks ordered by the distance of their bounding volume to the point.
    fn ranks_by_distance(&self, point: &Vec3) -> Vec<(usize, f32)> {
        let mut ranks: Vec<(usize, f32)> =
            query(&self.top, &Query::nearest(*point, self.top_ranks.len()))
                .into_iter()
                .map(|n| (self.top_ranks[n.index], n.distance))
                .collect();
        ranks.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        ranks
    }

    /// Sends the queries to the given ranks, answers the received queries locally and returns
    /// the answers to their origin. The answers are appended to the results. Collective.
    ///
    /// # Arguments
    /// * `queries` - The queries of this rank.
    /// * `forwards` - Pairs of query index and destination rank.
    /// * `results` - The results per query of this rank.
    fn forward(
        &self,
        queries: &[Query],
        forwards: &[(usize, usize)],
        results: &mut [DistributedResult],
    ) -> Result<()> {
        let rank = self.distributor.transport().rank();

        let destinations: Vec<usize> = forwards.iter().map(|&(_, r)| r).collect();
        let items: Vec<(usize, Query)> = forwards.iter().map(|&(i, _)| (i, queries[i])).collect();
        let plan = self.distributor.create_plan(&destinations)?;
        let received: Vec<(usize, Query)> = self.distributor.exchange_items(&plan, &items)?;

        debug!(
            "Rank {}: forwarded {} queries, answering {}",
            rank,
            items.len(),
            received.len()
        );

        let received_queries: Vec<Query> = received.iter().map(|&(_, q)| q).collect();
        let sort_queries = self.sort_queries && !self.local.is_empty();
        let answers = query_batch(
            &self.local,
            self.local.bounds(),
            &received_queries,
            sort_queries,
        );

        // the answers go back to where the queries came from
        let origins = source_ranks(plan.lengths_from());
        let replies: Vec<(usize, Vec<Neighbor>)> = received
            .iter()
            .map(|&(i, _)| i)
            .zip(answers)
            .collect();
        let reply_plan = self.distributor.create_plan(&origins)?;
        let replies = self.distributor.exchange_items(&reply_plan, &replies)?;

        let responders = source_ranks(reply_plan.lengths_from());
        for ((i, neighbors), responder) in replies.into_iter().zip(responders) {
            results[i].extend(neighbors.into_iter().map(|n| DistributedNeighbor {
                rank: responder,
                index: n.index,
                distance: n.distance,
            }));
        }

        Ok(())
    }
}

/// Expands the number of items per source rank into the source rank of every item.
fn source_ranks(lengths_from: &[usize]) -> Vec<usize> {
    lengths_from
        .iter()
        .enumerate()
        .flat_map(|(r, &l)| std::iter::repeat(r).take(l))
        .collect()
}
