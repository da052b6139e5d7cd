/*!
End-to-end tests for backup and restore calls.

Each test drives the real process runner, restic driver and orchestrator
against a shell script standing in for `restic`, with in-memory identity and
token services.
*/

#![cfg(unix)]

use async_trait::async_trait;
use backhaul_core::config::{EngineOptions, OrchestratorOptions, StorageConfig};
use backhaul_core::engine::progress::{ProgressReport, ProgressSink};
use backhaul_core::engine::ResticEngine;
use backhaul_core::session::{
    IdentityResolver, IssuedSession, SessionManager, SessionTokenRequest, TokenService, UserToken,
};
use backhaul_core::{BackhaulError, EngineErrorKind, Result, StorageOrchestrator};
use backhaul_retry::RetryPolicy;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct FakeResolver;

#[async_trait]
impl IdentityResolver for FakeResolver {
    async fn resolve_account_email(&self, _identity_id: &str) -> Result<String> {
        Ok("alice@olares.com".to_string())
    }

    async fn system_service_pod_address(&self, _identity_id: &str) -> Result<String> {
        Ok("10.233.0.5".to_string())
    }

    async fn fetch_shared_secret(&self, _ns: &str, _name: &str, _key: &str) -> Result<Vec<u8>> {
        Ok(b"0123456789abcdef".to_vec())
    }
}

/// Issues `ak-1`, `ak-2`, ... on successive calls
#[derive(Default)]
struct CountingTokens {
    issued: AtomicU32,
}

#[async_trait]
impl TokenService for CountingTokens {
    async fn retrieve_account(&self, _pod: &str, _nonce: &str, _email: &str) -> Result<UserToken> {
        Ok(UserToken {
            user_id: "u-1".to_string(),
            access_token: "tok".to_string(),
            expires_at: None,
        })
    }

    async fn issue_session(
        &self,
        _user: &UserToken,
        _request: &SessionTokenRequest,
    ) -> Result<IssuedSession> {
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(IssuedSession {
            bucket: "olares-space".to_string(),
            prefix: "did:key:z6Mk".to_string(),
            key: format!("ak-{generation}"),
            secret: "sk".to_string(),
            session_token: "st".to_string(),
            expiration: "2030-01-01T00:00:00Z".to_string(),
            region: "us-east-1".to_string(),
            ..IssuedSession::default()
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<ProgressReport>>,
}

impl RecordingSink {
    fn started(&self) -> usize {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r, ProgressReport::BackupStarted { .. }))
            .count()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, _repo: &str, report: ProgressReport) {
        self.reports.lock().unwrap().push(report);
    }
}

struct Harness {
    dir: TempDir,
    sink: Arc<RecordingSink>,
    tokens: Arc<CountingTokens>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            sink: Arc::new(RecordingSink::default()),
            tokens: Arc::new(CountingTokens::default()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Install the fake restic; every invocation appends its subcommand to `calls`
    fn restic(&self, body: &str) -> PathBuf {
        let path = self.path("restic");
        let script = format!(
            "#!/bin/sh\necho \"$1\" >> {}\n{body}\n",
            self.path("calls").display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.path("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn orchestrator(
        &self,
        config: StorageConfig,
        body: &str,
        options: OrchestratorOptions,
    ) -> StorageOrchestrator<ResticEngine> {
        let quick = RetryPolicy::new(Duration::from_millis(5), 2.0, 0.0, 3);
        let session = SessionManager::new(
            config,
            "hunter2",
            Arc::new(FakeResolver),
            self.tokens.clone(),
        )
        .unwrap()
        .with_policies(quick.clone(), quick.clone());

        let engine_options = EngineOptions {
            binary: Some(self.restic(body)),
            ..EngineOptions::default()
        };
        let engine = ResticEngine::new("photos", engine_options, CancellationToken::new())
            .unwrap()
            .with_progress_sink(self.sink.clone())
            .with_repair_policy(quick);

        StorageOrchestrator::new(session, engine, options)
    }

    fn source(&self) -> PathBuf {
        let source = self.path("source");
        std::fs::create_dir_all(&source).unwrap();
        source
    }
}

fn space() -> StorageConfig {
    StorageConfig::managed_space("photos", "alice")
}

const INIT_OK: &str = r#"echo '{"message_type":"initialized","id":"8d1f","repository":"repo"}'"#;

#[tokio::test]
async fn test_backup_returns_summary_with_single_start_line() {
    let harness = Harness::new();
    let repos = harness.path("repos");
    std::fs::create_dir_all(&repos).unwrap();
    let body = format!(
        r#"case "$1" in
init) {INIT_OK} ;;
backup)
  echo "$RESTIC_REPOSITORY" > {repo_file}
  echo '{{"message_type":"status","percent_done":0,"total_files":10,"total_bytes":1000}}'
  echo '{{"message_type":"summary","files_new":10,"data_added":900,"snapshot_id":"abc123"}}'
  ;;
esac"#,
        repo_file = harness.path("repo").display()
    );

    let mut orchestrator = harness.orchestrator(
        StorageConfig::local("photos", &repos),
        &body,
        OrchestratorOptions::default(),
    );
    let summary = orchestrator.backup(&harness.source()).await.unwrap();

    assert_eq!(summary.snapshot_id, "abc123");
    assert_eq!(summary.data_added, 900);
    assert_eq!(harness.sink.started(), 1);
    assert_eq!(harness.calls(), vec!["init", "backup"]);

    let repository = std::fs::read_to_string(harness.path("repo")).unwrap();
    assert_eq!(Path::new(repository.trim()), repos.join("photos"));
}

#[tokio::test]
async fn test_existing_repository_is_repaired_before_backup() {
    let harness = Harness::new();
    let body = String::from(
        r#"case "$1" in
init) echo "Fatal: create key in repository at s3:... failed: repository master key and config already initialized" >&2; exit 1 ;;
repair) echo "loading indexes..." ;;
backup) echo '{"message_type":"summary","snapshot_id":"abc123"}' ;;
esac"#,
    );

    let mut orchestrator = harness.orchestrator(space(), &body, OrchestratorOptions::default());
    let summary = orchestrator.backup(&harness.source()).await.unwrap();

    assert_eq!(summary.snapshot_id, "abc123");
    assert_eq!(harness.calls(), vec!["init", "repair", "backup"]);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_backup_rerun() {
    let harness = Harness::new();
    let body = format!(
        r#"case "$1" in
init) {INIT_OK} ;;
backup)
  echo '{{"message_type":"status","percent_done":0,"total_files":4,"total_bytes":400}}'
  if [ "$AWS_ACCESS_KEY_ID" = "ak-1" ]; then
    echo "Fatal: unable to save snapshot: The provided token has expired" >&2
    sleep 1
    echo '{{"message_type":"summary","snapshot_id":"stale"}}'
    exit 1
  fi
  echo '{{"message_type":"summary","snapshot_id":"fresh"}}'
  ;;
esac"#
    );

    let mut orchestrator = harness.orchestrator(space(), &body, OrchestratorOptions::default());
    let summary = orchestrator.backup(&harness.source()).await.unwrap();

    assert_eq!(summary.snapshot_id, "fresh");
    assert_eq!(harness.tokens.issued.load(Ordering::SeqCst), 2);
    assert_eq!(orchestrator.session().session().credentials.access_key_id, "ak-2");
    assert_eq!(harness.calls(), vec!["init", "backup", "init", "backup"]);
    assert!(harness.sink.started() >= 1);
}

#[tokio::test]
async fn test_repeated_expiry_stops_at_refresh_cap() {
    let harness = Harness::new();
    let body = format!(
        r#"case "$1" in
init) {INIT_OK} ;;
backup) echo "Fatal: unable to open repository at s3:...: 400 Bad Request" >&2; exit 1 ;;
esac"#
    );
    let options = OrchestratorOptions {
        max_credential_refreshes: 2,
        ..OrchestratorOptions::default()
    };

    let mut orchestrator = harness.orchestrator(space(), &body, options);
    let err = orchestrator.backup(&harness.source()).await.unwrap_err();

    assert!(
        matches!(err, BackhaulError::RetriesExhausted { attempts: 2, .. }),
        "{err}"
    );
    assert_eq!(err.engine_kind(), Some(&EngineErrorKind::TokenExpired));
    assert_eq!(harness.tokens.issued.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_restore_unknown_snapshot() {
    let harness = Harness::new();
    let target = harness.path("target");
    std::fs::create_dir_all(&target).unwrap();
    let body = r#"case "$1" in
snapshots) echo 'Fatal: failed to find snapshot: no matching ID found for prefix "deadbeef"' >&2; exit 1 ;;
esac"#;

    let mut orchestrator = harness.orchestrator(space(), body, OrchestratorOptions::default());
    let err = orchestrator.restore("deadbeef", &target).await.unwrap_err();

    assert_eq!(err.engine_kind(), Some(&EngineErrorKind::SnapshotNotFound));
    assert_eq!(harness.calls(), vec!["snapshots"]);
}

#[tokio::test]
async fn test_restore_from_original_path() {
    let harness = Harness::new();
    let target = harness.path("target");
    std::fs::create_dir_all(&target).unwrap();
    let body = format!(
        r#"case "$1" in
snapshots) echo '[{{"id":"deadbeefcafe","short_id":"deadbeef","time":"2024-05-01T10:00:00Z","paths":["/data/photos"],"tags":["name=photos"]}}]' ;;
restore)
  echo "$@" > {args}
  echo '{{"message_type":"status","percent_done":0,"total_files":2,"total_bytes":20}}'
  echo '{{"message_type":"verbose_status","action":"restored","item":"/data/photos/a.jpg","size":10}}'
  echo '{{"message_type":"summary","total_files":2,"files_restored":2,"total_bytes":20,"bytes_restored":20}}'
  ;;
esac"#,
        args = harness.path("args").display()
    );

    let mut orchestrator = harness.orchestrator(space(), &body, OrchestratorOptions::default());
    let summary = orchestrator.restore("deadbeef", &target).await.unwrap();

    assert_eq!(summary.files_restored, 2);
    let args = std::fs::read_to_string(harness.path("args")).unwrap();
    assert!(args.contains(&format!("-t {}", target.display())), "{args}");
    assert!(args.contains("deadbeefcafe:/data/photos"), "{args}");
    assert!(args.contains("--limit-download=0"), "{args}");
}

#[tokio::test]
async fn test_deadline_kills_engine_and_reports_timeout() {
    let harness = Harness::new();
    let body = format!(
        r#"case "$1" in
init) {INIT_OK} ;;
backup) sleep 30 ;;
esac"#
    );
    let options = OrchestratorOptions {
        deadline: Duration::from_millis(500),
        ..OrchestratorOptions::default()
    };

    let mut orchestrator = harness.orchestrator(space(), &body, options);
    let started = Instant::now();
    let err = orchestrator.backup(&harness.source()).await.unwrap_err();

    assert!(
        matches!(err, BackhaulError::Timeout { operation: "backup", .. }),
        "{err}"
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}
