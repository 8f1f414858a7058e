mod commands;
mod logging;
mod progress;
mod signals;

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, DedupeArgs};
use dotenv::dotenv;
use extent_duper_core::hasher::FingerprintCache;
use extent_duper_core::{
    ByteCompareShare, DedupeConfig, DedupeSession, ExtentShare, FideduperangeShare, SessionReport,
};
use progress::CliReporter;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let _guard = logging::init_logger(&logging::LogSettings::from_env());

    let config = match extent_duper_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    match args.command {
        Some(Commands::Dedupe(dedupe)) => {
            if let Err(err) = run_dedupe(config, dedupe) {
                error!("Error: {:#}", err);
                process::exit(1);
            }
        }
        Some(Commands::CountCache) => match open_cache(&config) {
            Ok(Some(cache)) => info!("{} files in fingerprint cache", cache.len()),
            Ok(None) => warn!("No cache_path configured"),
            Err(err) => error!("Error opening fingerprint cache: {}", err),
        },
        Some(Commands::ClearCache) => match open_cache(&config) {
            Ok(Some(cache)) => {
                cache.clear();
                match cache.save() {
                    Ok(()) => println!("Fingerprint cache cleared"),
                    Err(err) => error!("Error saving fingerprint cache: {}", err),
                }
            }
            Ok(None) => warn!("No cache_path configured"),
            Err(err) => error!("Error opening fingerprint cache: {}", err),
        },
        Some(Commands::PrintConfig) => match toml::to_string_pretty(&config) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("Configuration: {:?}", config),
        },
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn open_cache(config: &DedupeConfig) -> extent_duper_core::Result<Option<FingerprintCache>> {
    match &config.cache_path {
        Some(path) => FingerprintCache::open(path).map(Some),
        None => Ok(None),
    }
}

/// Command-line flags override file and environment settings.
fn apply_overrides(mut config: DedupeConfig, args: &DedupeArgs) -> DedupeConfig {
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(retry_limit) = args.retry_limit {
        config.retry_limit = retry_limit;
    }
    if let Some(max_compare_bytes) = args.max_compare_bytes {
        config.max_compare_bytes = max_compare_bytes;
    }
    if args.open_writable {
        config.open_writable = true;
    }
    if args.cache_path.is_some() {
        config.cache_path = args.cache_path.clone();
    }
    config
}

fn run_dedupe(config: DedupeConfig, args: DedupeArgs) -> anyhow::Result<()> {
    let config = apply_overrides(config, &args);
    let primitive: Arc<dyn ExtentShare> = if args.dry_run {
        info!("Dry run: ranges are compared, nothing is shared");
        Arc::new(ByteCompareShare::new())
    } else {
        Arc::new(FideduperangeShare)
    };

    let session = DedupeSession::new(args.paths, config, primitive)
        .context("Could not start dedupe session")?;
    if let Err(e) = signals::cancel_on_shutdown(session.handle()) {
        warn!("Could not watch for shutdown signals: {}", e);
    }
    let reporter = CliReporter::new();
    let report = session.run(&reporter);

    print_summary(&report);

    if let Some(path) = &args.csv {
        write_csv(path, &report)?;
        info!("Wrote {} range results to {}", report.ranges.len(), path.display());
    }

    Ok(())
}

fn print_summary(report: &SessionReport) {
    println!();
    info!(
        "Scan: {}, Dedupe: {}",
        format!("{:.2}s", report.scan_duration.as_secs_f64()).green(),
        format!("{:.2}s", report.execute_duration.as_secs_f64()).green(),
    );
    info!(
        "{} of {} candidate ranges attempted",
        format!("{}", report.ranges_attempted).cyan(),
        format!("{}", report.candidates_total).cyan(),
    );
    info!(
        "{} merged, {} differ, {} rejected, {} failed",
        format!("{}", report.ranges_merged).green(),
        format!("{}", report.ranges_differ).yellow(),
        format!("{}", report.ranges_rejected).yellow(),
        format!("{}", report.ranges_failed).red(),
    );
    info!(
        "{} bytes deduplicated, {} bytes reclaimed",
        format!("{}", report.bytes_deduplicated).green(),
        format!("{}", report.bytes_reclaimed).green(),
    );
    for file_error in &report.file_errors {
        warn!(
            "{}: {}",
            file_error.path.display().to_string().red(),
            file_error.message
        );
    }
    if report.cancelled {
        warn!("{}", "Session was cancelled before all ranges were attempted".yellow());
    }
}

fn write_csv(path: &Path, report: &SessionReport) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Could not create {}", path.display()))?;
    for range in &report.ranges {
        writer.serialize(range)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_configuration() {
        let cli = Cli::try_parse_from([
            "extent-duper",
            "dedupe",
            "--block-size",
            "8192",
            "--retry-limit",
            "5",
            "--dry-run",
            "a.bin",
            "b.bin",
        ])
        .unwrap();
        let Some(Commands::Dedupe(args)) = cli.command else {
            panic!("Expected dedupe command");
        };

        let config = apply_overrides(DedupeConfig::default(), &args);
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.workers, DedupeConfig::default().workers);
        assert!(args.dry_run);
        assert_eq!(args.paths.len(), 2);
    }

    #[test]
    fn test_dedupe_requires_paths() {
        assert!(Cli::try_parse_from(["extent-duper", "dedupe"]).is_err());
    }
}
