use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tempfile::TempDir;

use slipway::activate::Backend;
use slipway::config::DeployConfig;
use slipway::deploy::{self, Phase};
use slipway::logger::NoopLogger;
use slipway::mirror;
use slipway::remote::{ExecOutput, Remote};

/// Scripted stand-in for the deploy target: an in-memory filesystem plus
/// canned responses for the commands the procedure issues.
#[derive(Default)]
struct FakeRemote {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    /// Ordered record of every operation, for ordering assertions.
    journal: Vec<String>,
    commands: Vec<String>,
    close_calls: usize,
    serve_installed: bool,
    npm_install_works: bool,
    /// Whether starting a server actually binds the port.
    binds_on_start: bool,
    listening: bool,
    curl_code: Option<&'static str>,
    fail_upload_on: Option<String>,
}

impl FakeRemote {
    fn new() -> Self {
        Self {
            binds_on_start: true,
            ..Default::default()
        }
    }

    fn with_serve() -> Self {
        let mut fake = Self::new();
        fake.serve_installed = true;
        fake
    }

    fn add_dir_chain(&mut self, path: &str) {
        let mut cur = String::new();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            cur.push('/');
            cur.push_str(comp);
            self.dirs.insert(cur.clone());
        }
    }

    fn parent_exists(&self, path: &str) -> bool {
        match parent_of(path) {
            p if p == "/" || p.is_empty() => true,
            p => self.dirs.contains(&p),
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => String::new(),
    }
}

fn out(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_status: Some(0),
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        self.commands.push(command.to_string());
        self.journal.push(format!("exec:{command}"));

        if let Some(path) = command.strip_prefix("sudo mkdir -p ") {
            let path = path.to_string();
            self.add_dir_chain(&path);
            return Ok(out(""));
        }
        if let Some(target) = command.strip_prefix("rm -rf ") {
            let root = target.trim_end_matches("/*");
            let prefix = format!("{root}/");
            self.files.retain(|k, _| !k.starts_with(&prefix));
            self.dirs.retain(|d| !d.starts_with(&prefix));
            return Ok(out(""));
        }
        if command == "which serve" {
            return Ok(out(if self.serve_installed {
                "/usr/bin/serve\n"
            } else {
                ""
            }));
        }
        if command.starts_with("sudo npm install -g serve") {
            if self.npm_install_works {
                self.serve_installed = true;
                return Ok(out("added 1 package\n"));
            }
            return Ok(ExecOutput {
                stdout: "sudo: npm: command not found\n".to_string(),
                stderr: String::new(),
                exit_status: Some(127),
            });
        }
        if command.contains("nohup") || command.contains("systemctl restart") {
            if self.binds_on_start {
                self.listening = true;
            }
            return Ok(out(""));
        }
        if command.starts_with("ss -tlnp") {
            if self.listening {
                let port = command.rsplit(' ').next().unwrap_or("");
                return Ok(out(&format!(
                    "LISTEN 0 511 0.0.0.0:{port} 0.0.0.0:* users:((\"serve\",pid=999,fd=18))\n"
                )));
            }
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_status: Some(1),
            });
        }
        if command.starts_with("curl") {
            return Ok(out(self.curl_code.unwrap_or("failed")));
        }
        // chown, pkill, firewall, systemctl admin commands: drained, quiet
        Ok(out(""))
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.journal.push(format!("mkdir:{path}"));
        if self.dirs.contains(path) {
            bail!("mkdir failed: {path}: file exists");
        }
        if !self.parent_exists(path) {
            bail!("mkdir failed: {path}: no such parent directory");
        }
        self.dirs.insert(path.to_string());
        Ok(())
    }

    async fn dir_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.dirs.contains(path))
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64> {
        self.journal.push(format!("put:{remote}"));
        if let Some(ref pattern) = self.fail_upload_on {
            if remote.ends_with(pattern.as_str()) {
                bail!("transfer refused: {remote}");
            }
        }
        if !self.parent_exists(remote) {
            bail!("no such remote directory: {}", parent_of(remote));
        }
        let contents = std::fs::read(local)?;
        let len = contents.len() as u64;
        self.files.insert(remote.to_string(), contents);
        Ok(len)
    }

    async fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<()> {
        self.journal.push(format!("write:{remote}"));
        if !self.parent_exists(remote) {
            bail!("no such remote directory: {}", parent_of(remote));
        }
        self.files.insert(remote.to_string(), contents.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.close_calls += 1;
        Ok(())
    }
}

fn write(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn make_dist() -> TempDir {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "index.html", b"<html>hello</html>");
    write(tmp.path(), "assets/app.js", b"console.log(1)");
    write(tmp.path(), "assets/img/logo.svg", b"<svg/>");
    tmp
}

fn test_config(dist: &Path, strategy: &str) -> DeployConfig {
    let mut cfg: DeployConfig = toml::from_str(&format!(
        r#"
            host = "203.0.113.7"
            username = "ubuntu"
            password = "hunter2"
            remote_root = "/var/www/app"
            web_port = 4173
            settle_secs = 0
            stop_settle_secs = 0
            strategy = "{strategy}"
        "#
    ))
    .unwrap();
    cfg.local_dist = dist.to_path_buf();
    cfg
}

async fn run(remote: &mut FakeRemote, cfg: &DeployConfig) -> Result<deploy::DeployReport> {
    let entries = mirror::scan_local_tree(&cfg.local_dist)?;
    deploy::execute(remote, cfg, &entries, &NoopLogger, false).await
}

#[tokio::test]
async fn mirror_twice_matches_mirror_once() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    let mut remote = FakeRemote::with_serve();

    run(&mut remote, &cfg).await.unwrap();
    let first = remote.files.clone();
    assert!(first.contains_key("/var/www/app/index.html"));
    assert!(first.contains_key("/var/www/app/assets/app.js"));
    assert!(first.contains_key("/var/www/app/assets/img/logo.svg"));

    run(&mut remote, &cfg).await.unwrap();
    assert_eq!(first, remote.files);
    // One close per run, exactly.
    assert_eq!(remote.close_calls, 2);
}

#[tokio::test]
async fn remote_files_not_in_local_tree_are_removed() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    let mut remote = FakeRemote::with_serve();
    remote.add_dir_chain("/var/www/app");
    remote
        .files
        .insert("/var/www/app/stale.txt".to_string(), b"old".to_vec());

    run(&mut remote, &cfg).await.unwrap();
    assert!(!remote.files.contains_key("/var/www/app/stale.txt"));
    assert!(remote.files.contains_key("/var/www/app/index.html"));
}

#[tokio::test]
async fn parent_directories_are_created_before_their_files() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    let mut remote = FakeRemote::with_serve();

    run(&mut remote, &cfg).await.unwrap();

    let idx = |needle: &str| {
        remote
            .journal
            .iter()
            .position(|j| j == needle)
            .unwrap_or_else(|| panic!("missing journal entry {needle}"))
    };
    assert!(idx("mkdir:/var/www/app/assets") < idx("mkdir:/var/www/app/assets/img"));
    assert!(idx("mkdir:/var/www/app/assets/img") < idx("put:/var/www/app/assets/img/logo.svg"));
    assert!(idx("mkdir:/var/www/app/assets") < idx("put:/var/www/app/assets/app.js"));
}

#[tokio::test]
async fn falls_back_to_python_when_serve_unavailable() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    // serve not on PATH and npm install broken
    let mut remote = FakeRemote::new();

    let report = run(&mut remote, &cfg).await.unwrap();
    assert_eq!(report.backend, Backend::PythonHttp);
    assert_eq!(report.phase, Phase::Verified);
    assert!(remote
        .commands
        .iter()
        .any(|c| c.starts_with("sudo npm install -g serve")));
    assert!(remote
        .commands
        .iter()
        .any(|c| c.contains("python3 -m http.server 4173")));
}

#[tokio::test]
async fn http_probe_rescues_an_inconclusive_socket_table() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    let mut remote = FakeRemote::with_serve();
    remote.binds_on_start = false;
    remote.curl_code = Some("200");

    let report = run(&mut remote, &cfg).await.unwrap();
    assert_eq!(report.phase, Phase::Verified);

    let ss = remote
        .commands
        .iter()
        .position(|c| c.starts_with("ss -tlnp"))
        .unwrap();
    let curl = remote
        .commands
        .iter()
        .position(|c| c.starts_with("curl"))
        .unwrap();
    assert!(ss < curl, "socket table must be consulted before the probe");
}

#[tokio::test]
async fn unverified_port_is_a_soft_outcome() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    let mut remote = FakeRemote::with_serve();
    remote.binds_on_start = false;

    let report = run(&mut remote, &cfg).await.unwrap();
    assert_eq!(report.phase, Phase::Unverified);
    // Both checks ran before giving up.
    assert!(remote.commands.iter().any(|c| c.starts_with("ss -tlnp")));
    assert!(remote.commands.iter().any(|c| c.starts_with("curl")));
}

#[tokio::test]
async fn session_is_closed_once_even_when_a_transfer_fails() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "detached");
    let mut remote = FakeRemote::with_serve();
    remote.fail_upload_on = Some("app.js".to_string());

    let result = run(&mut remote, &cfg).await;
    assert!(result.is_err());
    assert_eq!(remote.close_calls, 1);
    // The failed transfer aborted the run before activation.
    assert!(!remote.commands.iter().any(|c| c.contains("nohup")));
}

#[tokio::test]
async fn supervised_strategy_installs_and_enables_the_unit() {
    let dist = make_dist();
    let cfg = test_config(dist.path(), "supervised");
    let mut remote = FakeRemote::with_serve();
    remote.add_dir_chain("/tmp");

    let report = run(&mut remote, &cfg).await.unwrap();
    assert_eq!(report.phase, Phase::Verified);

    let unit = remote
        .files
        .get("/tmp/slipway-4173.service")
        .expect("unit file staged over sftp");
    let unit = String::from_utf8(unit.clone()).unwrap();
    assert!(unit.contains("ExecStart=/usr/bin/serve -s . -l 4173"));
    assert!(unit.contains("WorkingDirectory=/var/www/app"));

    for cmd in [
        "sudo mv /tmp/slipway-4173.service /etc/systemd/system/slipway-4173.service",
        "sudo systemctl daemon-reload",
        "sudo systemctl enable slipway-4173",
        "sudo systemctl restart slipway-4173",
    ] {
        assert!(
            remote.commands.iter().any(|c| c == cmd),
            "missing command {cmd}"
        );
    }
}
