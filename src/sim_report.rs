//! Metrics report output.
//!
//! Report entries are `(label, stamp, is_final)` triples appended to a
//! per-run file when file logging is enabled, and mirrored to the log either
//! way. Writes are fire-and-forget: an I/O failure is logged and the run
//! continues, since the simulation must never block on report output.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

/// Appends report entries for one simulation run.
#[derive(Debug)]
pub struct ReportWriter {
    prefix: String,
    path: Option<PathBuf>,
}

impl ReportWriter {
    /// `simulation_id` keys the output file; with `logging_to_file` off the
    /// entries only reach the log stream.
    pub fn new(simulation_id: &str, logging_to_file: bool) -> Self {
        let path = if logging_to_file {
            let dir = PathBuf::from("output");
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!("cannot create report directory {}: {}", dir.display(), e);
                None
            } else {
                Some(dir.join(format!("{}-metrics.log", simulation_id)))
            }
        } else {
            None
        };
        ReportWriter { prefix: simulation_id.to_string(), path }
    }

    pub fn simulation_id(&self) -> &str {
        &self.prefix
    }

    pub fn write(&self, label: &str, stamp: &str, is_final: bool) {
        let line = format!(
            "{}\t{}\t{}",
            label,
            stamp,
            if is_final { "final" } else { "sample" }
        );
        info!("[{}] {}", self.prefix, line);

        if let Some(path) = &self.path {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", line));
            if let Err(e) = appended {
                warn!("report append to {} failed: {}", path.display(), e);
            }
        }
    }
}

/// Wall-clock seconds since the epoch, for report stamps.
pub fn wallclock_time() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => format!("{}.{:03}", elapsed.as_secs(), elapsed.subsec_millis()),
        Err(_) => "0.000".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_writer_has_no_path() {
        let writer = ReportWriter::new("unit-run", false);
        assert_eq!(writer.simulation_id(), "unit-run");
        // must not panic or touch the filesystem
        writer.write("simulation-started", "0.000", false);
        writer.write("simulation-finished", "1.000", true);
    }

    #[test]
    fn test_wallclock_stamp_shape() {
        let stamp = wallclock_time();
        let (secs, millis) = stamp.split_once('.').unwrap();
        assert!(secs.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(millis.len(), 3);
    }
}
