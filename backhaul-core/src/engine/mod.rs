/*!
Engine abstraction and the restic driver.

An [`Engine`] runs one repository operation at a time as a subprocess and
turns its output into a typed result. All operations of one engine share a
root cancellation scope; [`Engine::new_context`] swaps in a fresh child of
that root before retrying, so an earlier cancellation cannot leak into the
next attempt.
*/

pub mod classify;
pub mod events;
pub mod pool;
pub mod progress;
pub mod restic;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::Result;
pub use events::{BackupSummary, InitSummary, RestoreSummary, Snapshot};
pub use restic::ResticEngine;

/// How `init` ended
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    /// A new repository was created
    Initialized(InitSummary),
    /// The repository exists already; it needs a repair before reuse
    AlreadyInitialized,
}

/// Interface for engine operations against one repository
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create the repository
    async fn init(&self) -> Result<InitOutcome>;

    /// Back up `source`, tagging the snapshot with `name=<name>`.
    /// `strip_prefix` is removed from file names in progress output.
    async fn backup(&self, name: &str, source: &Path, strip_prefix: &str) -> Result<BackupSummary>;

    /// Rebuild the index, clearing stale locks when another run left them behind
    async fn repair(&self) -> Result<()>;

    /// Remove all locks, returning the engine's raw output
    async fn unlock(&self) -> Result<String>;

    /// Look up one snapshot by id or id prefix
    async fn snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    /// Restore `<snapshot_id>:<source_path>` into `target`
    async fn restore(
        &self,
        snapshot_id: &str,
        source_path: &str,
        target: &Path,
    ) -> Result<RestoreSummary>;

    /// Replace the current scope with a fresh child of the root scope
    fn new_context(&mut self);

    /// Cancel the current scope
    fn cancel(&self);

    /// Environment used by subsequent commands
    fn refresh_env(&mut self, envs: HashMap<String, String>);

    /// The scope every command of this engine descends from
    fn root_scope(&self) -> CancellationToken;
}
