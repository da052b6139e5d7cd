/*!
# Backhaul Core

Storage session and execution engine for restic-driven backup and restore.

The crate drives the `restic` binary as a subprocess against four kinds of
storage:

- Managed cloud space, with short-lived credentials issued per session
- Self-configured S3 and Tencent COS buckets, with static keys
- Local directories

## Architecture

- [`process`] runs one engine command and streams its merged output
- [`engine`] decodes and classifies that output into typed results
- [`session`] obtains credentials and derives the repository address
- [`orchestrator`] sequences both for one backup or restore call, recovering
  from expired credentials and bounding the call with a deadline

## Usage

```rust,no_run
use std::path::Path;
use std::sync::Arc;
use backhaul_core::config::{EngineOptions, OrchestratorOptions, StorageConfig};
use backhaul_core::engine::ResticEngine;
use backhaul_core::session::{ClusterClients, ClusterIdentityResolver, HttpTokenService, SessionManager};
use backhaul_core::StorageOrchestrator;
use tokio_util::sync::CancellationToken;

# async fn run() -> backhaul_core::Result<()> {
let config = StorageConfig::managed_space("photos", "alice");
let resolver = Arc::new(ClusterIdentityResolver::new(ClusterClients::in_cluster()?));
let tokens = Arc::new(HttpTokenService::new(config.cloud_api_url())?);
let session = SessionManager::new(config, "repository password", resolver, tokens)?;

let engine = ResticEngine::new("photos", EngineOptions::default(), CancellationToken::new())?;
let mut orchestrator = StorageOrchestrator::new(session, engine, OrchestratorOptions::default());

let summary = orchestrator.backup(Path::new("/data/photos")).await?;
println!("snapshot {}", summary.snapshot_id);
# Ok(())
# }
```
*/

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod process;
pub mod session;
pub mod storage;

#[cfg(test)]
mod error_tests;

pub use config::{BackendKind, EngineOptions, OrchestratorOptions, StorageConfig};
pub use engine::{BackupSummary, Engine, ResticEngine, RestoreSummary, Snapshot};
pub use error::{BackhaulError, EngineErrorKind, Result};
pub use orchestrator::StorageOrchestrator;
pub use session::{Session, SessionManager};
