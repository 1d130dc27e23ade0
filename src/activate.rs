//! Service activation
//!
//! Ensures a static-file server ends up bound to the target port. The
//! preferred backend is the `serve` binary, installed on demand; the
//! fallback is python's built-in http.server, which the target image is
//! guaranteed to have. Either a detached background process or a
//! supervised systemd service, per configuration.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::DeployConfig;
use crate::remote::Remote;
use crate::unit::render_unit;

/// Server program that ends up bound to the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The `serve` npm package. Handles SPA-style fallback routing.
    Serve,
    /// `python3 -m http.server`, always present on the target image.
    PythonHttp,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Serve => "serve",
            Backend::PythonHttp => "python3 http.server",
        }
    }

    /// Command for the detached strategy. The server must outlive the
    /// session, hence nohup + backgrounding; output goes to a scratch
    /// log on the host.
    pub fn start_command(self, cfg: &DeployConfig) -> String {
        match self {
            Backend::Serve => format!(
                "cd {root} && nohup serve -s . -l {port} > /tmp/serve.log 2>&1 &",
                root = cfg.remote_root,
                port = cfg.web_port
            ),
            Backend::PythonHttp => format!(
                "cd {root} && nohup python3 -m http.server {port} > /tmp/httpserver.log 2>&1 &",
                root = cfg.remote_root,
                port = cfg.web_port
            ),
        }
    }

    /// ExecStart line for the supervised strategy.
    pub fn exec_start(self, cfg: &DeployConfig) -> String {
        match self {
            Backend::Serve => format!("/usr/bin/serve -s . -l {}", cfg.web_port),
            Backend::PythonHttp => format!("/usr/bin/python3 -m http.server {}", cfg.web_port),
        }
    }
}

/// How the activation run ended. Unverified is a soft outcome, not an
/// error; policy decides what it does to the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Unverified,
}

/// Best-effort kill of whatever was serving the port before. Finding
/// nothing to kill is fine.
pub async fn stop_existing(remote: &mut dyn Remote, cfg: &DeployConfig) -> Result<()> {
    remote
        .exec(&format!(
            "pkill -f 'python.*http.server.*{}' 2>/dev/null || true",
            cfg.web_port
        ))
        .await?;
    remote
        .exec(&format!(
            "pkill -f 'serve.*{}' 2>/dev/null || true",
            cfg.web_port
        ))
        .await?;
    tokio::time::sleep(Duration::from_secs(cfg.stop_settle_secs)).await;
    Ok(())
}

/// Open the web port in ufw and iptables. Both commands are best-effort;
/// a host without either tool is not an error.
pub async fn open_firewall(remote: &mut dyn Remote, cfg: &DeployConfig) -> Result<()> {
    println!("Configuring firewall...");
    for cmd in [
        format!("sudo ufw allow {}/tcp 2>/dev/null || true", cfg.web_port),
        format!(
            "sudo iptables -A INPUT -p tcp --dport {} -j ACCEPT 2>/dev/null || true",
            cfg.web_port
        ),
    ] {
        remote.exec(&cmd).await?;
    }
    println!("[OK] Firewall configured");
    Ok(())
}

/// Find a usable backend: `serve` from PATH, installing it if missing,
/// else the python fallback. Never fails outright on an undiscoverable
/// binary.
pub async fn pick_backend(remote: &mut dyn Remote, cfg: &DeployConfig) -> Result<Backend> {
    if serve_on_path(remote).await? {
        return Ok(Backend::Serve);
    }
    println!("Installing 'serve'...");
    let install = remote.exec("sudo npm install -g serve 2>&1").await?;
    let head: String = install.stdout.chars().take(200).collect();
    println!("Install output: {head}...");

    if serve_on_path(remote).await? {
        return Ok(Backend::Serve);
    }
    println!("Using python3 http.server as fallback (port {})...", cfg.web_port);
    Ok(Backend::PythonHttp)
}

async fn serve_on_path(remote: &mut dyn Remote) -> Result<bool> {
    Ok(!remote.exec("which serve").await?.stdout_trimmed().is_empty())
}

/// Start the chosen backend under the configured strategy.
pub async fn start_backend(
    remote: &mut dyn Remote,
    cfg: &DeployConfig,
    backend: Backend,
) -> Result<()> {
    println!("Starting service with '{}'...", backend.name());
    remote.exec(&backend.start_command(cfg)).await?;
    Ok(())
}

/// Install, enable and (re)start the systemd unit. The unit file is
/// staged over SFTP and moved into place with the service manager's own
/// tooling.
pub async fn install_service(
    remote: &mut dyn Remote,
    cfg: &DeployConfig,
    backend: Backend,
) -> Result<()> {
    let name = cfg.service_unit_name();
    let unit = render_unit(cfg, &backend.exec_start(cfg));
    let staged = format!("/tmp/{name}.service");

    println!("Creating systemd service '{name}'...");
    remote
        .write_file(&staged, unit.as_bytes())
        .await
        .context("failed to stage unit file")?;

    for cmd in [
        format!("sudo mv {staged} /etc/systemd/system/{name}.service"),
        "sudo systemctl daemon-reload".to_string(),
        format!("sudo systemctl enable {name}"),
        format!("sudo systemctl restart {name}"),
    ] {
        println!("  Running: {cmd}");
        remote.exec(&cmd).await?;
    }
    Ok(())
}

/// Print a trimmed status report for the supervised unit.
pub async fn report_service_status(remote: &mut dyn Remote, cfg: &DeployConfig) -> Result<()> {
    let status = remote
        .exec(&format!(
            "sudo systemctl status {} --no-pager | head -10",
            cfg.service_unit_name()
        ))
        .await?;
    println!("{}", status.stdout_trimmed());
    Ok(())
}

/// Check the listening-socket table for the port; if that is
/// inconclusive, fall back to an HTTP probe on loopback before
/// concluding the service is not up.
pub async fn verify_port(remote: &mut dyn Remote, cfg: &DeployConfig) -> Result<Verification> {
    let table = remote
        .exec(&format!("ss -tlnp | grep {}", cfg.web_port))
        .await?;
    println!("Port check result: {}", table.stdout_trimmed());
    if socket_table_has_port(&table.stdout, cfg.web_port) {
        return Ok(Verification::Verified);
    }

    let probe = remote
        .exec(&format!(
            "curl -s -o /dev/null -w '%{{http_code}}' http://localhost:{}/ 2>/dev/null || echo failed",
            cfg.web_port
        ))
        .await?;
    let code = probe.stdout_trimmed();
    println!("Curl check: {code}");
    if http_code_is_live(code) {
        Ok(Verification::Verified)
    } else {
        Ok(Verification::Unverified)
    }
}

/// The port must appear as a listen address, not as a substring of a pid
/// or another port.
fn socket_table_has_port(table: &str, port: u16) -> bool {
    let needle = format!(":{port}");
    table
        .lines()
        .any(|line| line.split_whitespace().any(|col| col.ends_with(&needle)))
}

fn http_code_is_live(code: &str) -> bool {
    code.len() == 3
        && code.chars().all(|c| c.is_ascii_digit())
        && (code.starts_with('2') || code.starts_with('3'))
}
