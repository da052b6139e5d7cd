/*!
Structured records emitted by `restic --json`.

Backup and restore print one JSON object per line, distinguished by a
`message_type` field. `init` prints a single `initialized` record and
`snapshots` prints one JSON array.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded line of backup or restore output
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type")]
pub enum ProgressEvent<S, V, T> {
    #[serde(rename = "status")]
    Status(S),
    #[serde(rename = "verbose_status")]
    Verbose(V),
    #[serde(rename = "error")]
    Error(ErrorUpdate),
    #[serde(rename = "summary")]
    Summary(T),
    /// Printed by newer engine versions right before a non-zero exit
    #[serde(rename = "exit_error")]
    ExitError(ExitError),
    /// A record type this version does not act on
    #[serde(other)]
    Unknown,
}

pub type BackupEvent = ProgressEvent<StatusUpdate, VerboseUpdate, BackupSummary>;
pub type RestoreEvent = ProgressEvent<RestoreStatus, RestoreVerbose, RestoreSummary>;

/// Periodic backup progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    pub seconds_elapsed: u64,
    pub seconds_remaining: u64,
    pub percent_done: f64,
    pub total_files: u64,
    pub files_done: u64,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub error_count: u64,
    pub current_files: Vec<String>,
}

/// Per-item backup detail, only printed with `-v`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerboseUpdate {
    pub action: String,
    pub item: String,
    /// Seconds
    pub duration: f64,
    pub data_size: u64,
    pub data_size_in_repo: u64,
    pub metadata_size: u64,
    pub metadata_size_in_repo: u64,
    pub total_files: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    pub message: String,
}

/// A per-item failure. The operation continues after these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorUpdate {
    pub error: ErrorMessage,
    pub during: String,
    pub item: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

/// Final record of a successful backup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSummary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unmodified: u64,
    pub data_blobs: i64,
    pub tree_blobs: i64,
    pub data_added: u64,
    pub data_added_packed: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    /// Seconds
    pub total_duration: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

/// Periodic restore progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreStatus {
    pub seconds_elapsed: u64,
    pub percent_done: f64,
    pub total_files: u64,
    pub files_restored: u64,
    pub files_skipped: u64,
    pub total_bytes: u64,
    pub bytes_restored: u64,
    pub bytes_skipped: u64,
}

/// One restored item, printed at `-v=3`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreVerbose {
    pub action: String,
    pub item: String,
    pub size: u64,
}

/// Final record of a successful restore
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSummary {
    pub seconds_elapsed: u64,
    pub total_files: u64,
    pub files_restored: u64,
    pub files_skipped: u64,
    pub total_bytes: u64,
    pub bytes_restored: u64,
    pub bytes_skipped: u64,
}

/// Output of `restic init --json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitSummary {
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repository: String,
}

/// Statistics attached to snapshots written by newer engine versions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSummary {
    pub backup_start: Option<DateTime<Utc>>,
    pub backup_end: Option<DateTime<Utc>>,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub dirs_changed: u64,
    pub dirs_unmodified: u64,
    pub data_blobs: i64,
    pub tree_blobs: i64,
    pub data_added: u64,
    pub data_added_packed: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
}

/// One entry of `restic snapshots --json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SnapshotSummary>,
}

impl Snapshot {
    /// The path that was backed up; restores target `<id>:<path>`
    pub fn source_path(&self) -> Option<&str> {
        self.paths.first().map(String::as_str)
    }
}

/// `0.4213` renders as `42.13%`
pub fn percent_label(percent_done: f64) -> String {
    format!("{:.2}%", percent_done * 100.0)
}
