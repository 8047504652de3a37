//! # Comtree Router
//!
//! Overlay router binary. Loads a TOML bootstrap configuration, binds a UDP
//! socket and forwards comtree traffic until interrupted, then writes the
//! final statistics as JSON.
//!
//! ## Usage
//!
//! ```bash
//! comtree-router --config router.toml
//! comtree-router --config router.toml --address 2.1 --bind 0.0.0.0:30124
//! comtree-router --config router.toml --stats-out stats.json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use comtree_core::FlatAddr;
use comtree_router::{RouterConfig, RouterRuntime};

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    // ── Configuration ───────────────────────────────────────────
    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let mut config = RouterConfig::from_toml_str(&text)
        .map_err(|e| anyhow::anyhow!("{}: {e}", args.config.display()))?;
    if let Some(addr) = args.address {
        config.address = addr;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    tracing::info!(
        config = %args.config.display(),
        address = %config.address,
        bind = %config.bind,
        links = config.links.len(),
        comtrees = config.comtrees.len(),
        "comtree-router starting"
    );

    // ── Runtime ─────────────────────────────────────────────────
    let mut runtime = RouterRuntime::start(config)?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    while running.load(Ordering::Relaxed) && runtime.is_running() {
        std::thread::sleep(Duration::from_millis(100));
    }

    // ── Cleanup ─────────────────────────────────────────────────
    runtime.shutdown();
    let snapshot = runtime.stats();
    let json = serde_json::to_string_pretty(&snapshot)?;
    match &args.stats_out {
        Some(path) => {
            std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "statistics written");
        }
        None => println!("{json}"),
    }
    tracing::info!(
        received = snapshot.received,
        forwarded = snapshot.forwarded,
        dropped = snapshot.drops.total(),
        send_errors = runtime.send_errors(),
        "comtree-router stopped"
    );

    Ok(())
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: PathBuf,
    address: Option<FlatAddr>,
    bind: Option<SocketAddr>,
    stats_out: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;
    let mut address = None;
    let mut bind = None;
    let mut stats_out = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
                config = Some(PathBuf::from(val));
            }
            "--address" | "-a" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--address requires a value"))?;
                address = Some(
                    val.parse::<FlatAddr>()
                        .map_err(|e| anyhow::anyhow!("invalid address '{}': {}", val, e))?,
                );
            }
            "--bind" | "-b" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--bind requires a value"))?;
                bind = Some(
                    val.parse::<SocketAddr>()
                        .map_err(|e| anyhow::anyhow!("invalid bind address '{}': {}", val, e))?,
                );
            }
            "--stats-out" | "-s" => {
                i += 1;
                let val = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--stats-out requires a value"))?;
                stats_out = Some(PathBuf::from(val));
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    // Fallback: env vars
    if config.is_none() {
        config = std::env::var("COMTREE_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
    }
    if address.is_none() {
        if let Ok(val) = std::env::var("COMTREE_ADDRESS") {
            address = val.parse().ok();
        }
    }
    if bind.is_none() {
        if let Ok(val) = std::env::var("COMTREE_BIND") {
            bind = val.parse().ok();
        }
    }
    if stats_out.is_none() {
        stats_out = std::env::var("COMTREE_STATS_OUT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
    }

    let Some(config) = config else {
        anyhow::bail!("no configuration file. Use --config or COMTREE_CONFIG.\nRun with --help for usage.");
    };

    Ok(Args {
        config,
        address,
        bind,
        stats_out,
    })
}

fn print_help() {
    eprintln!(
        r#"comtree-router: comtree overlay router over UDP

USAGE:
  comtree-router --config <PATH> [OPTIONS]

OPTIONS:
  --config, -c <path>     TOML bootstrap configuration (required)
  --address, -a <zip.local>
                          Router address, overrides the configuration
  --bind, -b <addr>       UDP bind address, overrides the configuration
  --stats-out, -s <path>  Write final statistics JSON here instead of stdout
  --help, -h              Show this help

ENVIRONMENT VARIABLES:
  COMTREE_CONFIG     Configuration path (fallback for --config)
  COMTREE_ADDRESS    Router address (fallback for --address)
  COMTREE_BIND       Bind address (fallback for --bind)
  COMTREE_STATS_OUT  Statistics path (fallback for --stats-out)
  RUST_LOG           Log level filter (e.g. info, debug, comtree_core=trace)
"#
    );
}
