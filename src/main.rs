mod capture;
mod check;
mod config;
mod control;
mod engine;
mod load;
mod record;
mod report;
mod types;

use crate::config::Config;
use crate::engine::Engine;
use crate::engine::TestCase;
use crate::report::Format;
use crate::report::Reporter;
use crate::types::CpuId;
use clap::Parser;
use eyre::Context;
use eyre::eyre;
use std::path::Path;
use std::time::Duration;

/// Used when no config file is given and this one exists.
const DEFAULT_CONFIG_FILE: &str = "ftrace_buffer.toml";

mod cli {
    use crate::types::TracerName;
    use std::path::PathBuf;

    #[derive(clap_derive::Parser)]
    #[command(version, about)]
    /// Drive the ftrace ring buffer under load and check what comes out
    pub struct Cli {
        #[clap(short, long)]
        pub verbose: bool,
        /// TOML configuration file [default: ftrace_buffer.toml, if present]
        #[clap(long)]
        pub config_file: Option<PathBuf>,
        /// CPU for the single-CPU cases
        #[clap(long, default_value_t = 0)]
        pub default_cpu: u32,
        /// Maximum random delay between two writes on a CPU, in microseconds
        #[clap(long, default_value_t = 0)]
        pub max_writes_delay: u64,
        /// CPUs for the multi-CPU cases
        #[clap(long, value_delimiter = ',')]
        pub cpus_to_use: Option<Vec<u32>>,
        /// Tracers to run (function, function_graph, events)
        #[clap(long, value_delimiter = ',')]
        pub tracers_to_test: Option<Vec<TracerName>>,
        /// How long each tracer stays on, in milliseconds
        #[clap(long, value_delimiter = ',')]
        pub tracers_on_intervals: Option<Vec<u64>>,
        /// The live trace file, optionally followed by a persistent one
        #[clap(long, value_delimiter = ',')]
        pub trace_files: Option<Vec<PathBuf>>,
        /// Print one JSON object per case instead of text
        #[clap(long)]
        pub json: bool,
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = cli::Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(&cli)?;
    let cases = TestCase::enumerate(&config, CpuId(cli.default_cpu))?;
    log::info!(
        "{} cases, control surface at {}",
        cases.len(),
        config.tracefs_root().display()
    );

    let mut engine = Engine::new(&config, Duration::from_micros(cli.max_writes_delay));
    let format = if cli.json { Format::Json } else { Format::Text };
    let mut reporter = Reporter::new(std::io::stdout().lock(), format);
    for case in &cases {
        match engine.run_case(case) {
            Ok(report) => reporter.case(&report)?,
            Err(err) => {
                // The remaining cases still run.
                log::error!("{case}: {err}");
                reporter.error(case, &err)?;
            }
        }
    }
    let totals = reporter.finish()?;
    if !totals.success() {
        return Err(eyre!(
            "{} of {} cases failed, {} could not run",
            totals.failed,
            totals.cases,
            totals.errors
        ));
    }
    Ok(())
}

/// Load the config file and apply command line overrides.
fn load_config(cli: &cli::Cli) -> eyre::Result<Config> {
    let path = cli.config_file.as_deref().or_else(|| {
        let default = Path::new(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    });
    let mut config = match path {
        Some(path) => Config::load(path)
            .wrap_err_with(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(cpus) = &cli.cpus_to_use {
        config.cpus = cpus.iter().map(|&cpu| CpuId(cpu)).collect();
    }
    if let Some(tracers) = &cli.tracers_to_test {
        config.tracers.clone_from(tracers);
    }
    if let Some(intervals) = &cli.tracers_on_intervals {
        config.intervals_ms.clone_from(intervals);
    }
    if let Some(files) = &cli.trace_files {
        config.trace_files.clone_from(files);
    }
    config
        .validate()
        .wrap_err("Invalid configuration after command line overrides")?;
    Ok(config)
}
