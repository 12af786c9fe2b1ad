//! Per-host run logs.
//!
//! Every run gets its own directory; every host touched during the run gets
//! an append-only file in it named after the host ID. This is separate from
//! the `log` facade used for the orchestrator's own diagnostics.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Factory for host-specific loggers, configured with the run's log
/// directory. A factory without a directory produces loggers that only echo
/// to the process log.
#[derive(Debug, Clone, Default)]
pub struct Logging {
    pub logdir: Option<PathBuf>,
}

impl Logging {
    pub fn new(logdir: impl Into<PathBuf>) -> Logging {
        Logging {
            logdir: Some(logdir.into()),
        }
    }

    /// Creates a logger for the host. If `stdout` is set the messages are
    /// also printed to the process log.
    pub fn new_logger(&self, host_id: &str, stdout: bool) -> Logger {
        Logger {
            host_id: host_id.to_string(),
            out_file: self.logdir.as_ref().map(|d| d.join(host_id)),
            stdout,
        }
    }
}

/// Returns the run log directory under `logbase` for a run of `pkg`.
pub fn log_dir(logbase: &Path, pkg: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    logbase.join(format!("{}-{}", pkg.replace('/', "_"), now))
}

/// A logger bound to one host of one run.
pub struct Logger {
    host_id: String,
    out_file: Option<PathBuf>,
    stdout: bool,
}

impl Logger {
    /// Appends one message to the host's log file.
    pub fn print(&self, msg: &str) {
        let formatted = format!(
            "{} [{}] {}\n",
            humantime::format_rfc3339_seconds(SystemTime::now()),
            self.host_id,
            msg
        );
        if self.stdout {
            info!("[{}] {}", self.host_id, msg);
        }
        if let Some(path) = &self.out_file {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(mut f) => {
                    let _ = f.write_all(formatted.as_bytes());
                }
                Err(e) => warn!("cannot open log file {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_file_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let logging = Logging::new(dir.path());
        logging.new_logger("h1", false).print("first");
        logging.new_logger("h1", false).print("second");
        logging.new_logger("h2", false).print("other");

        let h1 = std::fs::read_to_string(dir.path().join("h1")).unwrap();
        assert!(h1.contains("[h1] first"));
        assert!(h1.contains("[h1] second"));
        let h2 = std::fs::read_to_string(dir.path().join("h2")).unwrap();
        assert!(h2.contains("[h2] other"));
    }

    #[test]
    fn disabled_factory_swallows_output() {
        Logging::default().new_logger("h1", false).print("nowhere");
    }
}
