//! tl - command line front end for tierline-core.
//!
//! Validates configuration, explains tier models and replays captured agent
//! frames through an in-process core. There is no network listener here;
//! transport lives outside this workspace.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use tierline_core::catalog::MemoryCatalogStore;
use tierline_core::clock::ManualClock;
use tierline_core::config::Config;
use tierline_core::dispatcher::MemorySink;
use tierline_core::error::PoolError;
use tierline_core::logging::{LogConfig, LogFormat, LogLevel, init_logging};
use tierline_core::{RouterCore, TierModel};

#[derive(Parser)]
#[command(author, version, about = "Metric identity and agent presence engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Override the configured log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    Check {
        /// Config file (defaults to $TIERLINE_CONFIG, then the user config dir)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Parse a tier model and show where timestamps land
    Tiers {
        /// Tier model, e.g. "raw=1s:3600, 15s:5760, 1m:10080"
        model: String,

        /// Timestamp (epoch ms) to address in every tier
        #[arg(long)]
        at: Option<i64>,

        /// Sample age (ms) to pick a tier for
        #[arg(long)]
        age: Option<i64>,
    },

    /// Push hex-encoded frames through an in-memory core and print stats
    Replay {
        /// Config file (defaults to $TIERLINE_CONFIG, then the user config dir)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Pin the core clock to this epoch ms instead of wall time
        #[arg(long)]
        now: Option<i64>,

        /// Frame file, one hex frame per line, or - for stdin
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            setup_logging(&LogConfig::default(), cli.log_level, cli.log_format)?;
            Ok(run_check(config.as_deref()))
        }
        Commands::Tiers { model, at, age } => {
            setup_logging(&LogConfig::default(), cli.log_level, cli.log_format)?;
            Ok(run_tiers(&model, at, age))
        }
        Commands::Replay { config, now, input } => {
            let config = Config::load_or_default(config.as_deref())
                .context("failed to load configuration")?;
            setup_logging(&config.logging, cli.log_level, cli.log_format)?;
            run_replay(config, now, &input).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn setup_logging(
    base: &LogConfig,
    level: Option<LogLevel>,
    format: Option<LogFormat>,
) -> anyhow::Result<()> {
    let mut config = base.clone();
    if let Some(level) = level {
        config.level = level.to_string();
    }
    if let Some(format) = format {
        config.format = format;
    }
    init_logging(&config).context("failed to initialize logging")
}

// =============================================================================
// check
// =============================================================================

fn run_check(explicit: Option<&Path>) -> ExitCode {
    let source = Config::resolve_path(explicit)
        .map_or_else(|| "built-in defaults".to_string(), |p| p.display().to_string());

    let result = Config::load_or_default(explicit)
        .map_err(tierline_core::Error::from)
        .and_then(|config| config.validate().map(|model| (config, model)));

    match result {
        Ok((config, model)) => {
            println!("config: {source}");
            println!("server: {}/{}", config.server.host_name, config.server.agent_name);
            println!("tiers: {model}");
            println!(
                "registry: ttl {}ms, sweep every {}ms",
                config.registry.agent_ttl_ms, config.registry.sweep_interval_ms
            );
            println!(
                "catalog: realtime={}, flush every {}ms",
                config.catalog.realtime, config.catalog.flush_interval_ms
            );
            println!(
                "pool: {} workers, queue {}",
                config.pool.workers, config.pool.queue_capacity
            );
            let collectors: Vec<&str> = config.collectors.iter().map(|c| c.name.as_str()).collect();
            if !collectors.is_empty() {
                println!("collectors: {}", collectors.join(", "));
            }
            println!("OK");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err} ({source})");
            if let Some(remediation) = err.remediation() {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// tiers
// =============================================================================

fn run_tiers(model: &str, at: Option<i64>, age: Option<i64>) -> ExitCode {
    let model = match TierModel::parse(model) {
        Ok(model) => model,
        Err(err) => {
            eprintln!("error: {err}");
            eprint!("{}", err.remediation().render_plain());
            return ExitCode::FAILURE;
        }
    };

    for tier in model.tiers() {
        let mut line = format!(
            "{:>2}  {:<16} retention {}ms",
            tier.index,
            tier.to_string(),
            tier.retention_ms()
        );
        if let Some(ts) = at {
            match tier.address(ts) {
                Some(address) => line.push_str(&format!("  address {address}")),
                None => line.push_str("  address out of range"),
            }
        }
        println!("{line}");
    }

    if let Some(age) = age {
        println!("finest tier for age {age}ms: {}", describe(&model, model.finest_tier_for_age(age)));
        println!("coarsest tier for age {age}ms: {}", describe(&model, model.tier_for_retention(age)));
    }
    ExitCode::SUCCESS
}

fn describe(model: &TierModel, index: Option<usize>) -> String {
    index
        .and_then(|i| model.get(i))
        .map_or_else(|| "none (older than every retention window)".to_string(), |t| {
            format!("{} ({})", t.index, t.name)
        })
}

// =============================================================================
// replay
// =============================================================================

async fn run_replay(config: Config, now: Option<i64>, input: &Path) -> anyhow::Result<()> {
    let text = read_input(input)?;
    let frames = parse_frames(&text)?;
    info!(frames = frames.len(), "replaying frames");

    let mut builder = RouterCore::builder(config)
        .with_store(Arc::new(MemoryCatalogStore::new()))
        .with_sink(Arc::new(MemorySink::new()));
    if let Some(now) = now {
        builder = builder.with_clock(Arc::new(ManualClock::new(now)));
    }
    let core = builder.build().context("failed to build core")?;

    let remote = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
    for frame in frames {
        loop {
            match core.submit_frame(frame.clone(), remote, None) {
                Ok(()) => break,
                Err(PoolError::QueueFull) => tokio::task::yield_now().await,
                Err(PoolError::ShutDown) => bail!("worker pool shut down during replay"),
            }
        }
    }

    let summary = core.shutdown().await;
    debug!(?summary, "core stopped");
    if let Some(err) = summary.flush_error {
        bail!("final catalog flush failed: {err}");
    }

    let stats = core.stats();
    info!("{}", stats.summary_line());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn read_input(input: &Path) -> anyhow::Result<String> {
    if input.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read frames from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(input)
        .with_context(|| format!("failed to read frames from {}", input.display()))
}

/// One hex frame per line. Blank lines and `#` comments are skipped.
fn parse_frames(text: &str) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let compact: String = line.split_whitespace().collect();
        let frame = hex::decode(&compact).with_context(|| format!("line {}: invalid hex", n + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_skip_comments_and_blanks() {
        let text = "# captured from web-1\n\n0a0b # connect\n  0c 0d 0e  \n";
        let frames = parse_frames(text).unwrap();
        assert_eq!(frames, vec![vec![0x0a, 0x0b], vec![0x0c, 0x0d, 0x0e]]);
    }

    #[test]
    fn bad_hex_names_the_line() {
        let err = parse_frames("00\nzz\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn describe_reports_missing_tier() {
        let model = TierModel::parse("raw=1s:10, 10s:6").unwrap();
        assert_eq!(describe(&model, Some(0)), "0 (raw)");
        assert!(describe(&model, None).starts_with("none"));
    }

    #[test]
    fn cli_parses_global_overrides() {
        let cli = Cli::try_parse_from(["tl", "tiers", "1s:60", "--log-level", "debug", "--at", "5"])
            .unwrap();
        assert!(cli.log_level.is_some());
        assert!(matches!(cli.command, Commands::Tiers { at: Some(5), .. }));
    }
}
