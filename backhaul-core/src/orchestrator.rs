/*!
Backup and restore calls from start to finish.

[`StorageOrchestrator`] sequences the session and the engine:

```text
Start -> AccountResolved -> TokenAcquired -> RepoConfigured -> EngineInitialized
      -> (Repairing) -> OperationRunning -> Done | Failed
```

Expired credentials during an engine run send the call back to
`RepoConfigured` with refreshed credentials and a fresh engine scope. The
whole call is bounded by a wall-clock deadline; when it fires the engine's
root scope is cancelled, which kills any running engine process.
*/

use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{BackendKind, OrchestratorOptions};
use crate::engine::{BackupSummary, Engine, InitOutcome, RestoreSummary};
use crate::error::EngineErrorKind;
use crate::session::SessionManager;
use crate::storage::LocalLocation;
use crate::{BackhaulError, Result};

/// Drives one repository through backup and restore calls
pub struct StorageOrchestrator<E: Engine> {
    session: SessionManager,
    engine: E,
    options: OrchestratorOptions,
}

impl<E: Engine> StorageOrchestrator<E> {
    pub fn new(session: SessionManager, engine: E, options: OrchestratorOptions) -> Self {
        Self {
            session,
            engine,
            options,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Back up `source` into the configured repository
    pub async fn backup(&mut self, source: &Path) -> Result<BackupSummary> {
        let repo = self.session.repo_name().to_string();
        if !source.exists() {
            return Err(BackhaulError::validation(format!(
                "backup path {} does not exist",
                source.display()
            )));
        }
        self.ensure_local_root()?;
        self.session.set_cluster_path(source);

        let root = self.engine.root_scope();
        let deadline = self.options.deadline;
        let result = bounded("backup", &repo, root, deadline, self.run_backup(source)).await;

        match &result {
            Ok(summary) => info!(repo = %repo, "Upload successful, data: {}", to_json(summary)),
            Err(e) => error!(repo = %repo, error = %e, "Backup failed"),
        }
        result
    }

    /// Restore `snapshot_id` into the existing directory `target`
    pub async fn restore(&mut self, snapshot_id: &str, target: &Path) -> Result<RestoreSummary> {
        let repo = self.session.repo_name().to_string();
        if snapshot_id.trim().is_empty() {
            return Err(BackhaulError::validation("snapshot id is empty"));
        }
        if !target.exists() {
            return Err(BackhaulError::validation(format!(
                "restore target {} does not exist",
                target.display()
            )));
        }
        self.ensure_local_root()?;
        self.session.set_cluster_path(target);

        let root = self.engine.root_scope();
        let deadline = self.options.deadline;
        let result = bounded(
            "restore",
            &repo,
            root,
            deadline,
            self.run_restore(snapshot_id, target),
        )
        .await;

        match &result {
            Ok(summary) => info!(repo = %repo, "Download successful, data: {}", to_json(summary)),
            Err(e) => error!(repo = %repo, snapshot_id, error = %e, "Restore failed"),
        }
        result
    }

    fn ensure_local_root(&self) -> Result<()> {
        if self.session.backend() != BackendKind::Local {
            return Ok(());
        }
        match self.session.config().local_path.as_deref() {
            Some(root) => LocalLocation::new(root).ensure_exists(),
            None => Err(BackhaulError::validation("local repository root is not set")),
        }
    }

    async fn acquire_session(&mut self) -> Result<()> {
        if self.session.backend().uses_issued_tokens() {
            self.session.resolve_account().await?;
        }
        self.session.refresh_token(false).await
    }

    /// Derive the repository address and hand the environment to the engine
    fn configure(&mut self) -> Result<()> {
        self.session.set_repo_url()?;
        let env = self.session.set_env()?.clone();
        self.engine.refresh_env(env);
        Ok(())
    }

    async fn prepare_repository(&mut self) -> Result<()> {
        match self.engine.init().await? {
            InitOutcome::Initialized(summary) => {
                info!(repo = %self.session.repo_name(), id = %summary.id, "Repository initialized");
                Ok(())
            }
            InitOutcome::AlreadyInitialized => {
                info!(repo = %self.session.repo_name(), "Repository exists, repairing index");
                self.engine.repair().await
            }
        }
    }

    fn recoverable(&self, err: &BackhaulError) -> bool {
        err.is_token_expired() && self.session.backend().uses_issued_tokens()
    }

    /// Refresh expired credentials and give the engine a fresh scope
    async fn recover(&mut self, refreshes: &mut u32, err: BackhaulError) -> Result<()> {
        if *refreshes >= self.options.max_credential_refreshes {
            return Err(BackhaulError::RetriesExhausted {
                operation: "refresh credentials",
                attempts: *refreshes,
                source: Box::new(err),
            });
        }
        *refreshes += 1;

        info!(
            repo = %self.session.repo_name(),
            attempt = *refreshes,
            "Credentials expired, refreshing"
        );
        self.session.refresh_token(false).await?;
        self.engine.new_context();
        Ok(())
    }

    async fn run_backup(&mut self, source: &Path) -> Result<BackupSummary> {
        let name = self.session.repo_name().to_string();
        let strip_prefix = source.to_string_lossy().into_owned();

        self.acquire_session().await?;

        let mut refreshes = 0;
        loop {
            self.configure()?;

            if let Err(e) = self.prepare_repository().await {
                if self.recoverable(&e) {
                    self.recover(&mut refreshes, e).await?;
                    continue;
                }
                return Err(e.context("prepare repository", name));
            }

            match self.engine.backup(&name, source, &strip_prefix).await {
                Ok(summary) => return Ok(summary),
                Err(e) if self.recoverable(&e) => self.recover(&mut refreshes, e).await?,
                Err(e) => return Err(e.context("backup", name)),
            }
        }
    }

    async fn run_restore(&mut self, snapshot_id: &str, target: &Path) -> Result<RestoreSummary> {
        self.acquire_session().await?;

        let mut refreshes = 0;
        loop {
            self.configure()?;

            let snapshot = match self.engine.snapshot(snapshot_id).await {
                Ok(snapshot) => snapshot,
                Err(e) if self.recoverable(&e) => {
                    self.recover(&mut refreshes, e).await?;
                    continue;
                }
                Err(e) => return Err(e.context("find snapshot", snapshot_id)),
            };
            let source_path = snapshot
                .source_path()
                .ok_or_else(|| {
                    BackhaulError::Engine(EngineErrorKind::SnapshotNotFound)
                        .context("find snapshot", snapshot_id)
                })?
                .to_string();

            match self.engine.restore(&snapshot.id, &source_path, target).await {
                Ok(summary) => return Ok(summary),
                Err(e) if self.recoverable(&e) => self.recover(&mut refreshes, e).await?,
                Err(e) => return Err(e.context("restore", snapshot_id)),
            }
        }
    }
}

/// First of `work` and the deadline wins. On the deadline `root` is
/// cancelled so the engine process is killed before the work is dropped.
async fn bounded<T, F>(
    operation: &'static str,
    resource: &str,
    root: CancellationToken,
    deadline: Duration,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = tokio::time::sleep(deadline) => {
            root.cancel();
            Err(BackhaulError::Timeout {
                operation,
                resource: resource.to_string(),
                after: deadline,
            })
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}
