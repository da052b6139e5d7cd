/*!
restic driver.

Each operation launches one `restic` subprocess in a child of the engine's
current cancellation scope, decodes its output line by line and stops at the
first terminal record: a summary, or a failure recognized by
[`classify`](super::classify). On a failure the command's own scope is
cancelled, which kills the process; the engine's scope stays usable.
*/

use async_trait::async_trait;
use backhaul_retry::{classify as retry_classify, retry_on_error, RetryPolicy};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::{self, LOCKED};
use super::events::{
    BackupEvent, BackupSummary, InitSummary, ProgressEvent, RestoreEvent, RestoreSummary, Snapshot,
};
use super::pool::BufferPool;
use super::progress::{
    tidy_file_names, Phase, ProgressReport, ProgressSink, ProgressTracker, TracingProgressSink,
};
use super::{Engine, InitOutcome};
use crate::config::EngineOptions;
use crate::error::EngineErrorKind;
use crate::process::{find_executable, Command, CommandOptions, RunOutcome};
use crate::{BackhaulError, Result};

#[cfg(feature = "metrics")]
use crate::observability::MetricsTimer;

/// Name of the engine executable looked up on `PATH`
pub const RESTIC_BINARY: &str = "restic";

const JSON_OUTPUT: &str = "--json";
const INSECURE_TLS: &str = "--insecure-tls";

/// What a consumed line means for the running command
enum LineAction<T> {
    Continue,
    Done(T),
    Fail(EngineErrorKind),
}

pub struct ResticEngine {
    binary: PathBuf,
    repo: String,
    envs: HashMap<String, String>,
    options: EngineOptions,
    root: CancellationToken,
    current: CancellationToken,
    pool: Arc<BufferPool>,
    sink: Arc<dyn ProgressSink>,
    repair_policy: RetryPolicy,
}

impl ResticEngine {
    /// Create a driver for the repository named `repo`.
    ///
    /// Fails when no engine binary can be found.
    pub fn new(
        repo: impl Into<String>,
        options: EngineOptions,
        root: CancellationToken,
    ) -> Result<Self> {
        let binary = match &options.binary {
            Some(binary) => find_executable(&binary.to_string_lossy())?,
            None => find_executable(RESTIC_BINARY)?,
        };
        let current = root.child_token();

        Ok(Self {
            binary,
            repo: repo.into(),
            envs: HashMap::new(),
            options,
            root,
            current,
            pool: BufferPool::shared(),
            sink: Arc::new(TracingProgressSink),
            repair_policy: RetryPolicy::repair_index(),
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_repair_policy(mut self, policy: RetryPolicy) -> Self {
        self.repair_policy = policy;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn with_tls_flag(&self, mut args: Vec<String>) -> Vec<String> {
        if self.options.insecure_tls {
            args.push(INSECURE_TLS.to_string());
        }
        args
    }

    fn command(&self, args: Vec<String>) -> Command {
        let options = CommandOptions::new(&self.binary, self.with_tls_flag(args), self.envs.clone());
        Command::new(options, &self.current).with_buffer_pool(Arc::clone(&self.pool))
    }

    /// Run one command, feeding every non-empty line to `on_line` until it
    /// reports a terminal result.
    ///
    /// A classified failure takes precedence over the process exit status.
    /// `Ok(None)` means the process exited cleanly without a terminal record.
    async fn drive<T, F>(
        &self,
        operation: &'static str,
        args: Vec<String>,
        mut on_line: F,
    ) -> Result<Option<T>>
    where
        T: Send,
        F: FnMut(&[u8]) -> LineAction<T> + Send,
    {
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start_engine_operation(operation);

        let result = self.drive_inner(operation, args, &mut on_line).await;

        #[cfg(feature = "metrics")]
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }

        result
    }

    async fn drive_inner<T, F>(
        &self,
        operation: &'static str,
        args: Vec<String>,
        on_line: &mut F,
    ) -> Result<Option<T>>
    where
        T: Send,
        F: FnMut(&[u8]) -> LineAction<T> + Send,
    {
        if self.current.is_cancelled() {
            return Err(BackhaulError::Cancelled(operation));
        }
        let mut running = self.command(args).start()?;
        let mut terminal = None;

        while let Some(line) = running.next_line().await {
            if line.iter().all(u8::is_ascii_whitespace) {
                running.recycle(line);
                continue;
            }
            debug!(
                repo = %self.repo,
                operation,
                line = %String::from_utf8_lossy(&line),
                "Engine output"
            );
            let action = on_line(&line);
            running.recycle(line);

            match action {
                LineAction::Continue => {}
                LineAction::Done(value) => {
                    terminal = Some(Ok(value));
                    break;
                }
                LineAction::Fail(kind) => {
                    running.cancel();
                    terminal = Some(Err(kind));
                    break;
                }
            }
        }

        let exit = running.wait().await;
        match (terminal, exit) {
            (Some(Err(kind)), _) => Err(BackhaulError::Engine(kind)),
            (Some(Ok(value)), Ok(_)) => Ok(Some(value)),
            (Some(Ok(value)), Err(err)) => {
                warn!(
                    repo = %self.repo,
                    operation,
                    error = %err,
                    "Engine reported a result but exited abnormally"
                );
                Ok(Some(value))
            }
            (None, Ok(RunOutcome::Exited)) => Ok(None),
            (None, Ok(RunOutcome::Cancelled)) => Err(BackhaulError::Cancelled(operation)),
            (None, Err(err)) => Err(err),
        }
    }

    /// Run a command and collect its raw output, regardless of exit status
    async fn collect_output(&self, operation: &'static str, args: Vec<String>) -> (String, Result<()>) {
        let mut output = String::new();
        let result = self
            .drive::<(), _>(operation, args, |line| {
                output.push_str(&String::from_utf8_lossy(line));
                output.push('\n');
                LineAction::Continue
            })
            .await
            .map(|_| ());
        (output, result)
    }

    async fn repair_index(&self) -> (String, Result<()>) {
        self.collect_output("repair index", vec!["repair".to_string(), "index".to_string()])
            .await
    }

    fn report(&self, report: ProgressReport) {
        self.sink.report(&self.repo, report);
    }

    fn report_item_error(&self, update: super::events::ErrorUpdate) {
        self.report(ProgressReport::ItemFailed {
            during: update.during,
            item: update.item,
            message: update.error.message,
        });
    }
}

#[async_trait]
impl Engine for ResticEngine {
    async fn init(&self) -> Result<InitOutcome> {
        let args = vec!["init".to_string(), JSON_OUTPUT.to_string()];
        let result = self
            .drive("init", args, |line| {
                match serde_json::from_slice::<InitSummary>(line) {
                    Ok(summary) => LineAction::Done(summary),
                    Err(_) => LineAction::Fail(classify::classify_line(&String::from_utf8_lossy(line))),
                }
            })
            .await;

        match result {
            Ok(summary) => {
                let summary = summary.unwrap_or_default();
                info!(repo = %self.repo, id = %summary.id, "Repository initialized");
                Ok(InitOutcome::Initialized(summary))
            }
            Err(BackhaulError::Engine(EngineErrorKind::AlreadyInitialized)) => {
                info!(repo = %self.repo, "Repository already initialized");
                Ok(InitOutcome::AlreadyInitialized)
            }
            Err(err) => Err(err),
        }
    }

    async fn backup(&self, name: &str, source: &Path, strip_prefix: &str) -> Result<BackupSummary> {
        let args = vec![
            "backup".to_string(),
            source.to_string_lossy().into_owned(),
            self.options.upload_rate_arg(),
            JSON_OUTPUT.to_string(),
            "--tag".to_string(),
            format!("name={name}"),
        ];

        let mut tracker = ProgressTracker::new();
        let summary = self
            .drive("backup", args, |line| {
                let event = match serde_json::from_slice::<BackupEvent>(line) {
                    Ok(event) => event,
                    Err(_) => {
                        return LineAction::Fail(classify::classify_line(&String::from_utf8_lossy(line)))
                    }
                };

                match event {
                    ProgressEvent::Status(status) => {
                        let report = match tracker.observe(status.percent_done) {
                            Some(Phase::Start) => ProgressReport::BackupStarted {
                                total_files: status.total_files,
                                total_bytes: status.total_bytes,
                            },
                            Some(Phase::Progress) => ProgressReport::BackupProgress {
                                percent_done: status.percent_done,
                                files_done: status.files_done,
                                total_files: status.total_files,
                                bytes_done: status.bytes_done,
                                total_bytes: status.total_bytes,
                                current_files: tidy_file_names(&status.current_files, strip_prefix),
                            },
                            Some(Phase::Finish) => ProgressReport::BackupFinished {
                                total_files: status.total_files,
                                total_bytes: status.total_bytes,
                            },
                            None => return LineAction::Continue,
                        };
                        self.report(report);
                        LineAction::Continue
                    }
                    ProgressEvent::Error(update) => {
                        self.report_item_error(update);
                        LineAction::Continue
                    }
                    ProgressEvent::Summary(summary) => LineAction::Done(summary),
                    ProgressEvent::ExitError(exit) => {
                        LineAction::Fail(classify::classify_line(&exit.message))
                    }
                    ProgressEvent::Verbose(_) | ProgressEvent::Unknown => LineAction::Continue,
                }
            })
            .await?;

        summary.ok_or_else(|| {
            BackhaulError::Engine(EngineErrorKind::Generic(
                "backup finished without a summary".to_string(),
            ))
        })
    }

    async fn repair(&self) -> Result<()> {
        retry_on_error("repair index", &self.repair_policy, |attempt| async move {
            let (output, result) = self.repair_index().await;
            if output.contains(LOCKED) {
                info!(repo = %self.repo, attempt, "Repository is locked, removing stale locks");
                if let Err(err) = self.unlock().await {
                    warn!(repo = %self.repo, error = %err, "Unlock failed");
                }
                #[cfg(feature = "metrics")]
                if let Some(metrics) = crate::observability::BackhaulMetrics::global() {
                    metrics.record_retry("repair index");
                }
                return Err(backoff::Error::transient(BackhaulError::Engine(
                    EngineErrorKind::Locked,
                )));
            }
            result.map_err(retry_classify)
        })
        .await
        .map_err(BackhaulError::from)?;

        info!(repo = %self.repo, "Repository index repaired");
        Ok(())
    }

    async fn unlock(&self) -> Result<String> {
        let args = vec!["unlock".to_string(), "--remove-all".to_string()];
        let (output, result) = self.collect_output("unlock", args).await;
        result.map(|_| output)
    }

    async fn snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let args = vec![
            "snapshots".to_string(),
            JSON_OUTPUT.to_string(),
            snapshot_id.to_string(),
        ];

        let snapshots = self
            .drive("snapshots", args, |line| {
                match serde_json::from_slice::<Vec<Snapshot>>(line) {
                    Ok(snapshots) => LineAction::Done(snapshots),
                    Err(_) => LineAction::Fail(classify::classify_line(&String::from_utf8_lossy(line))),
                }
            })
            .await?;

        snapshots
            .and_then(|list| list.into_iter().next())
            .ok_or(BackhaulError::Engine(EngineErrorKind::SnapshotNotFound))
    }

    async fn restore(
        &self,
        snapshot_id: &str,
        source_path: &str,
        target: &Path,
    ) -> Result<RestoreSummary> {
        let args = vec![
            "restore".to_string(),
            self.options.download_rate_arg(),
            "-t".to_string(),
            target.to_string_lossy().into_owned(),
            "-v=3".to_string(),
            JSON_OUTPUT.to_string(),
            format!("{snapshot_id}:{source_path}"),
        ];

        let mut tracker = ProgressTracker::new();
        let summary = self
            .drive("restore", args, |line| {
                let event = match serde_json::from_slice::<RestoreEvent>(line) {
                    Ok(event) => event,
                    Err(_) => {
                        return LineAction::Fail(classify::classify_line(&String::from_utf8_lossy(line)))
                    }
                };

                match event {
                    ProgressEvent::Status(status) => {
                        let report = match tracker.observe(status.percent_done) {
                            Some(Phase::Start) => ProgressReport::RestoreStarted {
                                total_files: status.total_files,
                                total_bytes: status.total_bytes,
                            },
                            Some(Phase::Progress) => ProgressReport::RestoreProgress {
                                percent_done: status.percent_done,
                                files_restored: status.files_restored,
                                total_files: status.total_files,
                                bytes_restored: status.bytes_restored,
                                total_bytes: status.total_bytes,
                            },
                            Some(Phase::Finish) => ProgressReport::RestoreFinished {
                                snapshot_id: snapshot_id.to_string(),
                                total_files: status.total_files,
                                files_restored: status.files_restored,
                                total_bytes: status.total_bytes,
                                bytes_restored: status.bytes_restored,
                            },
                            None => return LineAction::Continue,
                        };
                        self.report(report);
                        LineAction::Continue
                    }
                    ProgressEvent::Verbose(item) => {
                        self.report(ProgressReport::ItemRestored {
                            item: item.item,
                            size: item.size,
                        });
                        LineAction::Continue
                    }
                    ProgressEvent::Error(update) => {
                        self.report_item_error(update);
                        LineAction::Continue
                    }
                    ProgressEvent::Summary(summary) => LineAction::Done(summary),
                    ProgressEvent::ExitError(exit) => {
                        LineAction::Fail(classify::classify_line(&exit.message))
                    }
                    ProgressEvent::Unknown => LineAction::Continue,
                }
            })
            .await?;

        summary.ok_or_else(|| {
            BackhaulError::Engine(EngineErrorKind::Generic(
                "restore finished without a summary".to_string(),
            ))
        })
    }

    fn new_context(&mut self) {
        self.current = self.root.child_token();
    }

    fn cancel(&self) {
        self.current.cancel();
    }

    fn refresh_env(&mut self, envs: HashMap<String, String>) {
        self.envs = envs;
    }

    fn root_scope(&self) -> CancellationToken {
        self.root.clone()
    }
}
