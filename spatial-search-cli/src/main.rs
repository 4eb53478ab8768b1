use std::fs::File;

use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use options::Options;
use spatial_search::{BenchmarkConfig, BenchmarkExecutor, Stats, StatsNodeTrait};

mod options;

/// Initializes the program logging
///
/// # Arguments
/// * `filter` - The log level filter, i.e., the minimum log level to be logged.
fn initialize_logging(filter: LevelFilter) {
    let mut builder = pretty_env_logger::formatted_timed_builder();

    builder.filter_level(filter).init();
}

/// Loads the benchmark configuration from the given file.
///
/// # Arguments
/// * `path` - The path to the YAML configuration.
fn load_config(path: &str) -> Result<BenchmarkConfig> {
    let file = File::open(path).map_err(|err| {
        error!("Failed to open the configuration '{}': {:?}", path, err);
        err
    })?;

    Ok(BenchmarkConfig::read(file)?)
}

/// Runs the program.
///
/// # Arguments
/// * `options` - The program options.
fn run_program(options: Options) -> Result<()> {
    let mut config = load_config(&options.config)?;
    if let Some(num_threads) = options.num_threads {
        config.num_threads = num_threads;
    }

    let executor = BenchmarkExecutor::new(config);
    let reports = executor.run(Stats::root().get_child("benchmark"))?;

    for report in reports.iter() {
        info!(
            "{}: {} results, {} mismatches",
            report.name, report.num_results, report.num_mismatches
        );
    }

    let num_mismatches: usize = reports.iter().map(|r| r.num_mismatches).sum();
    if num_mismatches > 0 {
        bail!("{} queries differ from the linear scan", num_mismatches);
    }

    Ok(())
}

fn main() {
    let options = Options::parse();
    initialize_logging(options.log_level.into());
    options.dump_to_log();

    match run_program(options) {
        Ok(_) => {
            info!("Stat:");
            info!("{}", *Stats::root().lock().unwrap());
            info!("Program completed successfully");
        }
        Err(err) => {
            error!("Program failed: {:?}", err);
            std::process::exit(1);
        }
    }
}
