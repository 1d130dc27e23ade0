//! SSH session against the deploy target
//!
//! One authenticated session carries both channels: commands run on
//! short-lived exec channels, file transfers go through a single SFTP
//! subsystem channel opened right after auth and kept for the whole run.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::DeployConfig;
use crate::remote::{ExecOutput, Remote};

/// Accepts whatever host key the server presents. Trust-on-first-use,
/// the same stance the tool has always taken toward this one box.
struct AcceptHostKey;

#[async_trait]
impl client::Handler for AcceptHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshSession {
    handle: Handle<AcceptHostKey>,
    sftp: Option<SftpSession>,
    closed: bool,
}

impl SshSession {
    /// Connect, authenticate, and open the SFTP subsystem. The whole
    /// attempt is bounded by `connect_timeout_secs`; any failure aborts
    /// the run, there is no retry.
    pub async fn connect(cfg: &DeployConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.connect_timeout_secs);
        let mut handle = tokio::time::timeout(timeout, Self::authenticate(cfg))
            .await
            .map_err(|_| {
                anyhow!(
                    "connection to {}:{} timed out after {}s",
                    cfg.host,
                    cfg.port,
                    cfg.connect_timeout_secs
                )
            })??;

        let mut channel = handle
            .channel_open_session()
            .await
            .context("failed to open sftp channel")?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .context("failed to request sftp subsystem")?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .context("failed to start sftp session")?;

        Ok(Self {
            handle,
            sftp: Some(sftp),
            closed: false,
        })
    }

    async fn authenticate(cfg: &DeployConfig) -> Result<Handle<AcceptHostKey>> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (cfg.host.as_str(), cfg.port), AcceptHostKey)
            .await
            .with_context(|| format!("failed to connect to {}:{}", cfg.host, cfg.port))?;

        if let Some(ref key_file) = cfg.key_file {
            let key = russh_keys::load_secret_key(key_file, None)
                .with_context(|| format!("failed to load private key {}", key_file.display()))?;
            if handle
                .authenticate_publickey(&cfg.username, Arc::new(key))
                .await?
            {
                return Ok(handle);
            }
        }
        if let Some(ref password) = cfg.password {
            if handle
                .authenticate_password(&cfg.username, password)
                .await?
            {
                return Ok(handle);
            }
        }
        bail!("authentication failed for {}@{}", cfg.username, cfg.host)
    }

    fn sftp(&self) -> Result<&SftpSession> {
        self.sftp
            .as_ref()
            .ok_or_else(|| anyhow!("session already closed"))
    }
}

#[async_trait]
impl Remote for SshSession {
    async fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open exec channel")?;
        channel
            .exec(true, command)
            .await
            .with_context(|| format!("failed to start remote command: {command}"))?;

        // Drain everything until the channel closes. Exit status is
        // recorded but not enforced here.
        let mut out = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    out.stdout.push_str(&String::from_utf8_lossy(data));
                }
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    out.stderr.push_str(&String::from_utf8_lossy(data));
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    out.exit_status = Some(exit_status);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        self.sftp()?
            .create_dir(path)
            .await
            .with_context(|| format!("remote mkdir failed: {path}"))
    }

    async fn dir_exists(&mut self, path: &str) -> Result<bool> {
        match self.sftp()?.metadata(path).await {
            Ok(attrs) => Ok(attrs.is_dir()),
            Err(russh_sftp::client::error::Error::Status(status))
                if status.status_code == StatusCode::NoSuchFile =>
            {
                Ok(false)
            }
            Err(e) => Err(e).with_context(|| format!("remote stat failed: {path}")),
        }
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64> {
        let mut src = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("failed to open {}", local.display()))?;
        let mut dst = self
            .sftp()?
            .create(remote)
            .await
            .with_context(|| format!("failed to create remote file {remote}"))?;
        let bytes = tokio::io::copy(&mut src, &mut dst)
            .await
            .with_context(|| format!("failed to transfer {}", local.display()))?;
        dst.shutdown()
            .await
            .with_context(|| format!("failed to finalize remote file {remote}"))?;
        Ok(bytes)
    }

    async fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<()> {
        let mut dst = self
            .sftp()?
            .create(remote)
            .await
            .with_context(|| format!("failed to create remote file {remote}"))?;
        dst.write_all(contents)
            .await
            .with_context(|| format!("failed to write remote file {remote}"))?;
        dst.shutdown()
            .await
            .with_context(|| format!("failed to finalize remote file {remote}"))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(sftp) = self.sftp.take() {
            sftp.close().await.ok();
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "deploy finished", "en")
            .await
            .ok();
        Ok(())
    }
}
