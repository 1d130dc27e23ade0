//! Seam between the deploy procedure and the remote host
//!
//! Everything the procedure does to the server goes through [`Remote`]:
//! one command-execution channel and one file-transfer channel over the
//! same authenticated session. Tests drive the procedure with a scripted
//! implementation instead of a live host.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Output of one remote command, fully drained before the next is issued.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[async_trait]
pub trait Remote: Send {
    /// Run a shell command and drain stdout/stderr to completion. An
    /// unread stream would wedge the next command on this session.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput>;

    /// Create a directory. Not idempotent; callers decide what failure
    /// to tolerate (see `mirror::ensure_remote_dir`).
    async fn make_dir(&mut self, path: &str) -> Result<()>;

    /// True if `path` exists and is a directory.
    async fn dir_exists(&mut self, path: &str) -> Result<bool>;

    /// Transfer one local file, overwriting the remote path. Returns the
    /// number of bytes written.
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64>;

    /// Write bytes to a remote file (used for the generated unit file).
    async fn write_file(&mut self, remote: &str, contents: &[u8]) -> Result<()>;

    /// Close both channels. Safe to call more than once; only the first
    /// call does anything.
    async fn close(&mut self) -> Result<()>;
}

/// Join a name onto a remote base path with `/` separators.
pub fn remote_join(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}
