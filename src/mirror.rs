//! Remote directory reset and wholesale mirror of the local build tree
//!
//! The remote root is emptied, then every local entry is replayed onto it
//! depth-first. No checksum or mtime comparison: every file is always
//! re-transferred, and a transfer failure aborts the whole mirror.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::DeployConfig;
use crate::remote::{remote_join, Remote};

/// One local entry scheduled for transfer, relative to the dist root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    Dir { rel: PathBuf },
    File { rel: PathBuf, abs: PathBuf, size: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
}

/// Depth-first scan of the local build tree. Directories always precede
/// their contents, which is what keeps the remote mkdir-before-put
/// ordering valid. Symlinks and special files are skipped; a web build
/// has neither.
pub fn scan_local_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    if !root.is_dir() {
        bail!("local build directory not found: {}", root.display());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("entry escaped root {}", root.display()))?
            .to_path_buf();
        if entry.file_type().is_dir() {
            entries.push(TreeEntry::Dir { rel });
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(TreeEntry::File {
                rel,
                abs: entry.path().to_path_buf(),
                size,
            });
        }
    }
    Ok(entries)
}

/// Forcibly empty the remote root and recreate it plus the asset subdir.
/// The delete targets the root's contents, never the root itself. The
/// mkdir/chown/rm commands are best-effort; their exit status is not
/// inspected.
pub async fn reset_remote(remote: &mut dyn Remote, cfg: &DeployConfig) -> Result<()> {
    remote
        .exec(&format!("sudo mkdir -p {}", cfg.remote_root))
        .await?;
    remote
        .exec(&format!(
            "sudo chown -R {user}:{user} {root}",
            user = cfg.username,
            root = cfg.remote_root
        ))
        .await?;
    remote.exec(&format!("rm -rf {}/*", cfg.remote_root)).await?;
    ensure_remote_dir(remote, &cfg.remote_root).await?;
    ensure_remote_dir(remote, &remote_join(&cfg.remote_root, &cfg.asset_dir)).await?;
    Ok(())
}

/// mkdir that tolerates exactly one failure class: the directory already
/// being there (confirmed by a follow-up stat). Anything else re-raises
/// the original error.
pub async fn ensure_remote_dir(remote: &mut dyn Remote, path: &str) -> Result<()> {
    match remote.make_dir(path).await {
        Ok(()) => Ok(()),
        Err(err) => match remote.dir_exists(path).await {
            Ok(true) => Ok(()),
            _ => Err(err.context(format!("failed to create remote directory {path}"))),
        },
    }
}

/// Replay the scanned tree onto the remote root. `on_file` fires before
/// each transfer so the caller can narrate progress.
pub async fn mirror_tree(
    remote: &mut dyn Remote,
    cfg: &DeployConfig,
    entries: &[TreeEntry],
    mut on_file: impl FnMut(&Path) + Send,
) -> Result<MirrorStats> {
    let mut stats = MirrorStats::default();
    for entry in entries {
        match entry {
            TreeEntry::Dir { rel } => {
                ensure_remote_dir(remote, &remote_path(&cfg.remote_root, rel)).await?;
                stats.dirs += 1;
            }
            TreeEntry::File { rel, abs, .. } => {
                on_file(rel);
                let target = remote_path(&cfg.remote_root, rel);
                let bytes = remote
                    .upload(abs, &target)
                    .await
                    .with_context(|| format!("failed to upload {}", rel.display()))?;
                stats.files += 1;
                stats.bytes += bytes;
            }
        }
    }
    Ok(stats)
}

/// Join a relative local path onto the remote root with `/` separators,
/// whatever the local separator is.
fn remote_path(root: &str, rel: &Path) -> String {
    let mut out = root.trim_end_matches('/').to_string();
    for comp in rel.components() {
        out.push('/');
        out.push_str(&comp.as_os_str().to_string_lossy());
    }
    out
}
