use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::deploy::{DeployReport, Phase};

/// Run log sink. Default methods are no-ops so implementations pick the
/// events they care about.
pub trait DeployLogger: Send + Sync {
    fn phase(&self, _phase: Phase) {}
    fn command(&self, _command: &str, _exit: Option<u32>) {}
    fn upload(&self, _path: &Path, _bytes: u64) {}
    fn error(&self, _context: &str, _message: &str) {}
    fn done(&self, _report: &DeployReport) {}
}

pub struct NoopLogger;
impl DeployLogger for NoopLogger {}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
}

/// Appends one JSON object per line. Logging failures never fail the run.
pub struct JsonlLogger {
    file: Mutex<File>,
}

impl JsonlLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn entry(&self, event: &str, detail: Option<String>, exit: Option<u32>, bytes: Option<u64>) {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
            detail,
            exit,
            bytes,
        };
        if let Ok(mut f) = self.file.lock() {
            if serde_json::to_writer(&mut *f, &entry).is_ok() {
                let _ = writeln!(f);
            }
        }
    }
}

impl DeployLogger for JsonlLogger {
    fn phase(&self, phase: Phase) {
        self.entry("phase", Some(phase.name().to_string()), None, None);
    }
    fn command(&self, command: &str, exit: Option<u32>) {
        self.entry("command", Some(command.to_string()), exit, None);
    }
    fn upload(&self, path: &Path, bytes: u64) {
        self.entry("upload", Some(path.display().to_string()), None, Some(bytes));
    }
    fn error(&self, context: &str, message: &str) {
        self.entry("error", Some(format!("{context}: {message}")), None, None);
    }
    fn done(&self, report: &DeployReport) {
        self.entry(
            "done",
            Some(format!(
                "{} files, {} bytes, {:.3}s, {}",
                report.stats.files,
                report.stats.bytes,
                report.elapsed_secs,
                report.phase.name()
            )),
            None,
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn jsonl_lines_parse_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deploy.jsonl");

        let logger = JsonlLogger::new(&path).unwrap();
        logger.command("which serve", Some(0));
        logger.upload(Path::new("index.html"), 512);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "command");
        assert_eq!(first["exit"], 0);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "upload");
        assert_eq!(second["bytes"], 512);
    }
}
