use log::{error, info, warn};
use nalgebra_glm::Vec3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    generate_point_cloud,
    math::AABB,
    spatial::{query_batch, Builder, Neighbor, Query, QueryResult, BVH},
    BenchmarkConfig, QuerySetup, Result, StatsNode, StatsNodeTrait,
};

/// The outcome of a single query setup.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupReport {
    /// The name of the setup.
    pub name: String,

    /// The total number of results over all queries.
    pub num_results: usize,

    /// The number of queries whose results differ from the linear scan. Zero if not validated.
    pub num_mismatches: usize,
}

/// Runs the benchmark described by a configuration.
pub struct BenchmarkExecutor {
    config: BenchmarkConfig,
}

impl BenchmarkExecutor {
    /// Creates a new benchmark executor.
    ///
    /// # Arguments
    /// * `config` - The benchmark configuration.
    pub fn new(config: BenchmarkConfig) -> Self {
        Self { config }
    }

    /// Runs the benchmark on a thread pool of the configured size.
    ///
    /// # Arguments
    /// * `s` - The stats node to write the timings to.
    pub fn run(&self, s: StatsNode) -> Result<Vec<SetupReport>> {
        let num_threads = self.config.num_threads;
        info!("Num Threads: {}", num_threads);
        info!("Num Test Setups: {}", self.config.setups.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|err| {
                error!("Failed to create the thread pool: {:?}", err);
                err
            })?;

        Ok(pool.install(|| self.run_setups(s)))
    }

    fn run_setups(&self, s: StatsNode) -> Vec<SetupReport> {
        let _t = s.register_timing();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        info!(
            "Generating {} points and {} queries...",
            self.config.num_points, self.config.num_queries
        );
        let (points, query_points) = {
            let _t = s.get_child("generate").register_timing();
            let points = generate_point_cloud(
                self.config.shape,
                self.config.extent,
                self.config.num_points,
                &mut rng,
            );
            let query_points = generate_point_cloud(
                self.config.shape,
                self.config.extent,
                self.config.num_queries,
                &mut rng,
            );

            (points, query_points)
        };

        let bvh = Builder::new()
            .with_stats(s.get_child("build"))
            .build(&points);
        s.add_count("height", bvh.height() as u64);

        self.config
            .setups
            .iter()
            .map(|setup| self.run_setup(s.clone(), &bvh, &points, &query_points, setup))
            .collect()
    }

    /// Runs a single query setup.
    ///
    /// # Arguments
    /// * `s` - The stats node of the benchmark.
    /// * `bvh` - The hierarchy over the points.
    /// * `points` - The indexed points.
    /// * `query_points` - The query points.
    /// * `setup` - The setup to run.
    fn run_setup(
        &self,
        s: StatsNode,
        bvh: &BVH,
        points: &[Vec3],
        query_points: &[Vec3],
        setup: &QuerySetup,
    ) -> SetupReport {
        let name = setup.name();
        let s = s.get_child(&name);
        info!("Testing {} setup...", name);

        let queries: Vec<Query> = query_points
            .iter()
            .map(|&p| match *setup {
                QuerySetup::Nearest { k } => Query::nearest(p, k),
                QuerySetup::Within { radius } => Query::within(p, radius),
            })
            .collect();

        let results = {
            let _t = s.get_child("query").register_timing();
            query_batch(bvh, bvh.bounds(), &queries, self.config.sort_queries)
        };

        let num_results = results.iter().map(|r| r.len()).sum();
        s.add_count("results", num_results as u64);

        let num_mismatches = if self.config.validate {
            let _t = s.get_child("validate").register_timing();
            let num_mismatches = queries
                .par_iter()
                .zip(results.par_iter())
                .filter(|(q, r)| &linear_scan(points, q) != *r)
                .count();

            if num_mismatches > 0 {
                warn!("{}: {} queries differ from the linear scan", name, num_mismatches);
            }
            s.add_count("mismatches", num_mismatches as u64);

            num_mismatches
        } else {
            0
        };

        SetupReport {
            name,
            num_results,
            num_mismatches,
        }
    }
}

/// Answers the query by scanning all points.
///
/// # Arguments
/// * `points` - The points to scan.
/// * `q` - The query.
pub fn linear_scan(points: &[Vec3], q: &Query) -> QueryResult {
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::{PointCloudShape, Stats};

    #[test]
    fn test_validated_run() {
        let config = BenchmarkConfig {
            shape: PointCloudShape::FilledBox,
            extent: 2f32,
            num_points: 2000,
            num_queries: 50,
            setups: vec![
                QuerySetup::Nearest { k: 8 },
                QuerySetup::Within { radius: 0.3 },
            ],
            sort_queries: true,
            validate: true,
            num_threads: 2,
            seed: 5,
        };

        let s = Stats::detached();
        let reports = BenchmarkExecutor::new(config).run(s.clone()).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "nearest_8");
        assert_eq!(reports[0].num_results, 50 * 8);
        assert!(reports.iter().all(|r| r.num_mismatches == 0));

        let nearest = s.get_child("nearest_8");
        assert_eq!(nearest.lock().unwrap().count("results"), 400);
    }
}
