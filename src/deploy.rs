//! The one-shot deploy procedure
//!
//! Reset the remote root, mirror the local build onto it, then activate
//! the static server and verify the port. Strictly sequential: each
//! remote command is drained before the next one is issued, and the
//! session is closed on every exit path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::activate::{self, Backend, Verification};
use crate::config::{DeployConfig, Strategy};
use crate::logger::DeployLogger;
use crate::mirror::{self, MirrorStats, TreeEntry};
use crate::progress::UploadSpinner;
use crate::remote::{ExecOutput, Remote};
use crate::session::SshSession;

/// Where the run got to. Anything thrown before the activator aborts the
/// run with the error naming the step; the activator itself only ever
/// ends verified or unverified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connected,
    RemoteReset,
    Mirrored,
    ServiceStopped,
    ServiceStarting(Backend),
    Verified,
    Unverified,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Connected => "connected",
            Phase::RemoteReset => "remote-reset",
            Phase::Mirrored => "mirrored",
            Phase::ServiceStopped => "service-stopped",
            Phase::ServiceStarting(Backend::Serve) => "service-starting(serve)",
            Phase::ServiceStarting(Backend::PythonHttp) => "service-starting(python3)",
            Phase::Verified => "verified",
            Phase::Unverified => "unverified",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployReport {
    pub phase: Phase,
    pub backend: Backend,
    pub stats: MirrorStats,
    pub elapsed_secs: f64,
}

/// Full run against the configured host: scan locally, connect, then
/// hand off to [`execute`].
pub async fn run(cfg: &DeployConfig, logger: &dyn DeployLogger, verbose: bool) -> Result<DeployReport> {
    logger.phase(Phase::Init);
    // Fail before dialing out if there is nothing to upload.
    let entries = mirror::scan_local_tree(&cfg.local_dist)?;

    println!("Connecting to server...");
    let mut session = SshSession::connect(cfg).await?;
    println!("[OK] Connected");
    logger.phase(Phase::Connected);

    execute(&mut session, cfg, &entries, logger, verbose).await
}

/// Drive the procedure over an established session. The session is
/// closed exactly once whether the procedure succeeds or throws, with
/// the procedure's error taking precedence over a close error.
pub async fn execute(
    remote: &mut dyn Remote,
    cfg: &DeployConfig,
    entries: &[TreeEntry],
    logger: &dyn DeployLogger,
    verbose: bool,
) -> Result<DeployReport> {
    let result = {
        let mut logged = Logged {
            inner: &mut *remote,
            logger,
        };
        run_procedure(&mut logged, cfg, entries, logger, verbose).await
    };
    let close = remote.close().await;
    let report = result?;
    close.context("failed to close session")?;
    Ok(report)
}

async fn run_procedure(
    remote: &mut dyn Remote,
    cfg: &DeployConfig,
    entries: &[TreeEntry],
    logger: &dyn DeployLogger,
    verbose: bool,
) -> Result<DeployReport> {
    let start = Instant::now();

    println!("\nPreparing remote directory...");
    logger.phase(Phase::RemoteReset);
    mirror::reset_remote(remote, cfg).await?;
    println!("[OK] Directory ready");

    println!("\nUploading files...");
    let spinner = (!verbose).then(UploadSpinner::new);
    let stats = mirror::mirror_tree(remote, cfg, entries, |rel: &Path| {
        if verbose {
            println!("  Uploading: {}", rel.display());
        } else if let Some(ref s) = spinner {
            s.set_message(format!("Uploading {}", rel.display()));
        }
    })
    .await?;
    if let Some(s) = spinner {
        s.finish_and_clear();
    }
    logger.phase(Phase::Mirrored);
    println!(
        "[OK] Uploaded {} files, {} dirs ({} bytes)",
        stats.files, stats.dirs, stats.bytes
    );

    println!("\nStopping old services...");
    activate::stop_existing(remote, cfg).await?;
    logger.phase(Phase::ServiceStopped);

    if cfg.open_firewall {
        activate::open_firewall(remote, cfg).await?;
    }

    println!("\nConfiguring port {} service...", cfg.web_port);
    let backend = activate::pick_backend(remote, cfg).await?;
    logger.phase(Phase::ServiceStarting(backend));
    match cfg.strategy {
        Strategy::Detached => activate::start_backend(remote, cfg, backend).await?,
        Strategy::Supervised => activate::install_service(remote, cfg, backend).await?,
    }
    tokio::time::sleep(Duration::from_secs(cfg.settle_secs)).await;

    if cfg.strategy == Strategy::Supervised {
        activate::report_service_status(remote, cfg).await?;
    }

    println!("\nVerifying service...");
    let verification = activate::verify_port(remote, cfg).await?;
    let phase = match verification {
        Verification::Verified => {
            println!("[OK] Service is running on port {}", cfg.web_port);
            Phase::Verified
        }
        Verification::Unverified => {
            println!("[WARN] Could not confirm port {} is listening", cfg.web_port);
            Phase::Unverified
        }
    };
    logger.phase(phase);

    let report = DeployReport {
        phase,
        backend,
        stats,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    logger.done(&report);
    Ok(report)
}

/// Forwards every remote operation, mirroring commands and transfers
/// into the run log.
struct Logged<'a> {
    inner: &'a mut dyn Remote,
    logger: &'a dyn DeployLogger,
}

#[async_trait]
impl Remote for Logged<'_> {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let out = self.inner.exec(command).await;
        match &out {
            Ok(o) => self.logger.command(command, o.exit_status),
            Err(e) => self.logger.error("exec", &format!("{command}: {e:#}")),
        }
        out
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.inner.make_dir(path).await
    }

    async fn dir_exists(&mut self, path: &str) -> Result<bool> {
        self.inner.dir_exists(path).await
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let result = self.inner.upload(local, remote).await;
        match &result {
            Ok(bytes) => self.logger.upload(local, *bytes),
            Err(e) => self.logger.error("upload", &format!("{remote}: {e:#}")),
        }
        result
    }

    async fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<()> {
        self.inner.write_file(remote, contents).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
