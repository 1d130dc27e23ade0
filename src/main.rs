//! slipway - push a static build to a server and keep it serving

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use slipway::config::{DeployConfig, Strategy, VerifyPolicy};
use slipway::deploy::{self, Phase};
use slipway::logger::{DeployLogger, JsonlLogger, NoopLogger};
use slipway::mirror::{self, TreeEntry};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Slipway - one-shot deploy of a static build over SSH, with service activation"
)]
struct Args {
    /// Path to the deploy configuration file
    #[arg(short, long, default_value = "slipway.toml")]
    config: PathBuf,

    /// Local build directory (overrides the config file)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Remote host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Install a supervised systemd service instead of a detached process
    #[arg(long)]
    service: bool,

    /// Fail the run when the port cannot be verified
    #[arg(long)]
    strict_verify: bool,

    /// List what would be uploaded without connecting (dry run)
    #[arg(short = 'l', long, alias = "list-only")]
    dry_run: bool,

    /// Show individual file operations as they happen
    #[arg(short, long)]
    verbose: bool,

    /// Write JSONL log entries to file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Set up Ctrl-C handler
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // Exit immediately with 130 (128 + SIGINT)
        std::process::exit(130);
    })
    .expect("Error setting Ctrl-C handler");

    let args = Args::parse();

    let mut cfg = DeployConfig::load(&args.config)?;
    if let Some(source) = args.source {
        cfg.local_dist = source;
    }
    if let Some(host) = args.host {
        cfg.host = host;
    }
    if args.service {
        cfg.strategy = Strategy::Supervised;
    }
    if args.strict_verify {
        cfg.verify = VerifyPolicy::Strict;
    }
    cfg.validate()?;

    if args.dry_run {
        return dry_run(&cfg);
    }

    banner(&cfg);

    let logger: Arc<dyn DeployLogger> = if let Some(ref p) = args.log_file {
        match JsonlLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(_) => Arc::new(NoopLogger),
        }
    } else {
        Arc::new(NoopLogger)
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let report = rt.block_on(deploy::run(&cfg, logger.as_ref(), args.verbose))?;

    println!();
    println!("{}", "=".repeat(50));
    match report.phase {
        Phase::Unverified => println!("  DEPLOYMENT COMPLETE (port {} not verified)", cfg.web_port),
        _ => println!("  DEPLOYMENT COMPLETE"),
    }
    println!("  URL: {}", cfg.url());
    println!("{}", "=".repeat(50));

    if report.phase == Phase::Unverified && cfg.verify == VerifyPolicy::Strict {
        anyhow::bail!(
            "service did not bind port {} and verification is strict",
            cfg.web_port
        );
    }
    Ok(())
}

fn banner(cfg: &DeployConfig) {
    println!("{}", "=".repeat(50));
    println!("  Slipway Deploy");
    println!("{}", "=".repeat(50));
    println!();
    println!("Server: {}", cfg.host);
    println!("Target Port: {}", cfg.web_port);
    println!("Remote Path: {}", cfg.remote_root);
    println!();
}

fn dry_run(cfg: &DeployConfig) -> Result<()> {
    println!("DRY RUN MODE - nothing will be uploaded");
    let entries = mirror::scan_local_tree(&cfg.local_dist)?;
    for entry in &entries {
        match entry {
            TreeEntry::Dir { rel } => println!("  dir   {}/", rel.display()),
            TreeEntry::File { rel, size, .. } => {
                println!("  file  {} ({size} bytes)", rel.display())
            }
        }
    }
    println!(
        "{} entries under {}",
        entries.len(),
        cfg.local_dist.display()
    );
    Ok(())
}
