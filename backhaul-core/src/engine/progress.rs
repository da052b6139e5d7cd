/*!
Progress tracking and reporting for engine operations.

restic repeats status lines freely: the 0% line can show up several times
before any data moves, and the 100% line is usually printed more than once
while the snapshot is being written. [`ProgressTracker`] turns that stream
into a start announcement, deduplicated progress and a finish announcement,
each boundary announced at most once. [`ProgressSink`] decides what to do
with the result; the default writes log lines.
*/

use tracing::{info, warn};

use super::events::percent_label;

/// Two percentages closer than this are treated as equal
pub const PERCENT_TOLERANCE: f64 = 1e-9;

/// What a status line means once duplicates are filtered out
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Start,
    Progress,
    Finish,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    started: bool,
    finished: bool,
    last_percent: Option<f64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `percent_done` value; `None` means nothing worth reporting.
    pub fn observe(&mut self, percent_done: f64) -> Option<Phase> {
        if (percent_done - 0.0).abs() < PERCENT_TOLERANCE {
            if self.started {
                return None;
            }
            self.started = true;
            return Some(Phase::Start);
        }

        if (percent_done - 1.0).abs() < PERCENT_TOLERANCE {
            if self.finished {
                return None;
            }
            self.finished = true;
            return Some(Phase::Finish);
        }

        let unchanged = self
            .last_percent
            .is_some_and(|last| (last - percent_done).abs() < PERCENT_TOLERANCE);
        self.last_percent = Some(percent_done);
        if unchanged {
            None
        } else {
            Some(Phase::Progress)
        }
    }

    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn has_finished(&self) -> bool {
        self.finished
    }
}

/// Reportable progress of a backup or restore
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressReport {
    BackupStarted {
        total_files: u64,
        total_bytes: u64,
    },
    BackupProgress {
        percent_done: f64,
        files_done: u64,
        total_files: u64,
        bytes_done: u64,
        total_bytes: u64,
        current_files: Vec<String>,
    },
    BackupFinished {
        total_files: u64,
        total_bytes: u64,
    },
    RestoreStarted {
        total_files: u64,
        total_bytes: u64,
    },
    RestoreProgress {
        percent_done: f64,
        files_restored: u64,
        total_files: u64,
        bytes_restored: u64,
        total_bytes: u64,
    },
    ItemRestored {
        item: String,
        size: u64,
    },
    RestoreFinished {
        snapshot_id: String,
        total_files: u64,
        files_restored: u64,
        total_bytes: u64,
        bytes_restored: u64,
    },
    /// A per-item failure the engine skipped over
    ItemFailed {
        during: String,
        item: String,
        message: String,
    },
}

/// Receives progress for one repository
pub trait ProgressSink: Send + Sync {
    fn report(&self, repo: &str, report: ProgressReport);
}

/// Writes progress as `info` log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn report(&self, repo: &str, report: ProgressReport) {
        match report {
            ProgressReport::BackupStarted {
                total_files,
                total_bytes,
            } => info!(
                repo,
                "[Upload] start, files: {}, size: {}",
                total_files,
                format_bytes(total_bytes)
            ),
            ProgressReport::BackupProgress {
                percent_done,
                files_done,
                total_files,
                bytes_done,
                total_bytes,
                current_files,
            } => info!(
                repo,
                "[Upload] progress {}, files: {}/{}, size: {}/{}, current: {:?}",
                percent_label(percent_done),
                files_done,
                total_files,
                format_bytes(bytes_done),
                format_bytes(total_bytes),
                current_files
            ),
            ProgressReport::BackupFinished {
                total_files,
                total_bytes,
            } => info!(
                repo,
                "[Upload] finished, files: {}, size: {}, please waiting...",
                total_files,
                format_bytes(total_bytes)
            ),
            ProgressReport::RestoreStarted {
                total_files,
                total_bytes,
            } => info!(
                repo,
                "[Download] start, files: {}, size: {}",
                total_files,
                format_bytes(total_bytes)
            ),
            ProgressReport::RestoreProgress {
                percent_done,
                files_restored,
                total_files,
                bytes_restored,
                total_bytes,
            } => info!(
                repo,
                "[Download] progress {}, files: {}/{}, size: {}/{}",
                percent_label(percent_done),
                files_restored,
                total_files,
                format_bytes(bytes_restored),
                format_bytes(total_bytes)
            ),
            ProgressReport::ItemRestored { item, size } => info!(
                repo,
                "[Download] restored file: {}, size: {}",
                item,
                format_bytes(size)
            ),
            ProgressReport::RestoreFinished {
                snapshot_id,
                total_files,
                files_restored,
                total_bytes,
                bytes_restored,
            } => info!(
                repo,
                "[Download] snapshot {} finished, total files: {}, restored files: {}, total size: {}, restored size: {}, please waiting...",
                snapshot_id,
                total_files,
                files_restored,
                format_bytes(total_bytes),
                format_bytes(bytes_restored)
            ),
            ProgressReport::ItemFailed {
                during,
                item,
                message,
            } => warn!(repo, during = %during, item = %item, "Engine skipped item: {}", message),
        }
    }
}

/// Human readable size using 1024 steps
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    const TB: u64 = 1 << 40;

    match bytes {
        b if b >= TB => format!("{:.2} TB", b as f64 / TB as f64),
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} Byte"),
    }
}

/// Strip `prefix` from each current-file entry
pub fn tidy_file_names(files: &[String], prefix: &str) -> Vec<String> {
    files
        .iter()
        .map(|file| file.strip_prefix(prefix).unwrap_or(file).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_announced_once() {
        let mut tracker = ProgressTracker::new();
        let phases: Vec<_> = [0.0, 0.0, 1e-12, 0.25, 0.25, 0.5, 1.0, 1.0 - 1e-12, 1.0]
            .into_iter()
            .filter_map(|p| tracker.observe(p))
            .collect();

        assert_eq!(
            phases,
            vec![Phase::Start, Phase::Progress, Phase::Progress, Phase::Finish]
        );
        assert!(tracker.has_started());
        assert!(tracker.has_finished());
    }

    #[test]
    fn test_out_of_order_boundaries() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe(1.0), Some(Phase::Finish));
        assert_eq!(tracker.observe(0.0), Some(Phase::Start));
        assert_eq!(tracker.observe(0.0), None);
        assert_eq!(tracker.observe(1.0), None);
    }

    #[test]
    fn test_progress_resumes_after_different_value() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.observe(0.3), Some(Phase::Progress));
        assert_eq!(tracker.observe(0.4), Some(Phase::Progress));
        assert_eq!(tracker.observe(0.3), Some(Phase::Progress));
        assert_eq!(tracker.observe(0.3 + 1e-12), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 Byte");
        assert_eq!(format_bytes(1023), "1023 Byte");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 << 30), "3.00 GB");
        assert_eq!(format_bytes(1 << 41), "2.00 TB");
    }

    #[test]
    fn test_tidy_file_names() {
        let files = vec![
            "/olares/userspace/photos/a.jpg".to_string(),
            "/tmp/other".to_string(),
        ];
        assert_eq!(
            tidy_file_names(&files, "/olares/userspace"),
            vec!["/photos/a.jpg", "/tmp/other"]
        );
        assert_eq!(tidy_file_names(&files, ""), files);
    }
}
