use log::error;
use serde::{Deserialize, Serialize};

use crate::{Error, PointCloudShape, Result};

/// The configuration of a benchmark run.
#[derive(Debug, Deserialize, Serialize)]
pub struct BenchmarkConfig {
    /// The shape of the indexed point cloud.
    pub shape: PointCloudShape,

    /// The half edge length of the box or the radius of the sphere.
    #[serde(default = "default_extent")]
    pub extent: f32,

    /// The number of indexed points.
    pub num_points: usize,

    /// The number of query points, drawn from the same shape.
    pub num_queries: usize,

    /// The query setups, each of them is run with all query points.
    pub setups: Vec<QuerySetup>,

    /// Should the queries be sorted along the Z-order curve
    #[serde(default)]
    pub sort_queries: bool,

    /// Should the results be compared against a linear scan
    #[serde(default)]
    pub validate: bool,

    /// The number of threads to use
    pub num_threads: usize,

    /// The seed of the random number generator
    #[serde(default)]
    pub seed: u64,
}

fn default_extent() -> f32 {
    1f32
}

impl BenchmarkConfig {
    /// Reads the configuration from the provided reader.
    ///
    /// # Arguments
    /// * `reader` - The reader to read the configuration from.
    pub fn read<R: std::io::Read>(reader: R) -> Result<Self> {
        let config: BenchmarkConfig = serde_yaml::from_reader(reader).map_err(|e| {
            error!("Failed to parse the configuration: {:?}", e);

            Error::DeserializationError(Box::new(e))
        })?;

        Ok(config)
    }

    /// Writes the configuration to the provided writer.
    ///
    /// # Arguments
    /// * `writer` - The writer to write the configuration to.
    pub fn write<W: std::io::Write>(&self, mut writer: W) -> Result<()> {
        let yaml = serde_yaml::to_string(&self).map_err(|e| {
            error!("Failed to serialize the configuration: {:?}", e);

            Error::SerializationError(Box::new(e))
        })?;

        writer.write_all(yaml.as_bytes())?;

        Ok(())
    }
}

/// A kind of query to benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum QuerySetup {
    /// The k nearest neighbors of every query point.
    Nearest { k: usize },

    /// All points within the radius of every query point.
    Within { radius: f32 },
}

impl QuerySetup {
    /// Returns the name of the setup as used for the stats.
    pub fn name(&self) -> String {
        match self {
            QuerySetup::Nearest { k } => format!("nearest_{}", k),
            QuerySetup::Within { radius } => format!("within_{}", radius),
        }
    }
}
