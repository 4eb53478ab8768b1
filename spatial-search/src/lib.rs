//! Parallel spatial search over point clouds and boxes.
//!
//! The [spatial] module builds linear bounding volume hierarchies with rayon and answers nearest,
//! within and intersection queries on them. The [distributor] module implements personalized
//! all-to-all exchanges between the ranks of a process group, on which the [distributed] module
//! builds a search over primitives spread across all ranks.

mod cloud;
mod config;
pub mod distributed;
pub mod distributor;
mod error;
mod executor;
pub mod math;
pub mod spatial;
mod stats;

pub use cloud::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use stats::*;
