//! Configuration for backend selection, engine invocation and orchestration
//!
//! This module provides configuration structures and enums for selecting
//! between the supported storage backends (managed space, S3, COS, local
//! filesystem) and tuning how the engine is driven.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{BackhaulError, Result};

/// Default base URL of the credential-issuing service
pub const DEFAULT_CLOUD_API_URL: &str = "https://cloud-api.bttcdn.com";

/// Region used for managed space sessions
pub const DEFAULT_SPACE_REGION: &str = "us-east-1";

pub const AWS_DOMAIN: &str = "amazonaws.com";
pub const TENCENT_DOMAIN: &str = "myqcloud.com";

/// Token lifetime requested when none is configured
pub const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(12 * 60 * 60);

/// Wall-clock bound for one backup or restore call
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(2 * 60 * 60);

/// Which physical storage target a repository resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Managed cloud space with short-lived issued credentials
    #[serde(rename = "olares-space")]
    ManagedSpace,
    /// Self-configured AWS S3 bucket
    #[serde(rename = "s3")]
    S3Compatible,
    /// Self-configured Tencent COS bucket
    #[serde(rename = "cos")]
    CosCompatible,
    /// Local filesystem path
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::ManagedSpace => "olares-space",
            BackendKind::S3Compatible => "s3",
            BackendKind::CosCompatible => "cos",
            BackendKind::Local => "local",
        }
    }

    /// Whether credentials come from the token service and can expire mid-run
    pub fn uses_issued_tokens(&self) -> bool {
        matches!(self, BackendKind::ManagedSpace)
    }

    /// Cloud name sent with a session token request
    pub fn cloud_name(&self) -> &'static str {
        match self {
            BackendKind::CosCompatible => "cos",
            BackendKind::S3Compatible => "s3",
            BackendKind::ManagedSpace | BackendKind::Local => "aws",
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::ManagedSpace
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackhaulError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "olares-space" | "space" => Ok(BackendKind::ManagedSpace),
            "s3" => Ok(BackendKind::S3Compatible),
            "cos" => Ok(BackendKind::CosCompatible),
            "local" => Ok(BackendKind::Local),
            other => Err(BackhaulError::validation(format!(
                "unknown backend type '{other}', expected one of olares-space, s3, cos, local"
            ))),
        }
    }
}

/// Where a repository lives and how to reach it
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: BackendKind,
    /// Repository name, also used as the snapshot `name=` tag
    pub repo_name: String,
    /// Identity whose account owns the managed space
    pub identity_id: Option<String>,
    /// Bucket endpoint for S3/COS backends
    pub endpoint: Option<String>,
    /// Static access key for S3/COS backends
    pub access_key_id: Option<String>,
    /// Static secret key for S3/COS backends
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Root directory for the local backend
    pub local_path: Option<PathBuf>,
    /// Override for the credential-issuing service base URL
    pub cloud_api_mirror: Option<String>,
    /// Requested token lifetime in minutes, as given on the command line
    pub token_duration_minutes: Option<String>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("repo_name", &self.repo_name)
            .field("identity_id", &self.identity_id)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("local_path", &self.local_path)
            .field("cloud_api_mirror", &self.cloud_api_mirror)
            .field("token_duration_minutes", &self.token_duration_minutes)
            .finish()
    }
}

impl StorageConfig {
    /// Configuration for the managed cloud space of an identity
    pub fn managed_space(repo_name: impl Into<String>, identity_id: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::ManagedSpace,
            repo_name: repo_name.into(),
            identity_id: Some(identity_id.into()),
            ..Self::default()
        }
    }

    /// Configuration for a self-managed S3 bucket endpoint
    pub fn s3(
        repo_name: impl Into<String>,
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            backend: BackendKind::S3Compatible,
            repo_name: repo_name.into(),
            endpoint: Some(endpoint.into()),
            access_key_id: Some(access_key_id.into()),
            secret_access_key: Some(secret_access_key.into()),
            ..Self::default()
        }
    }

    /// Configuration for a self-managed Tencent COS bucket endpoint
    pub fn cos(
        repo_name: impl Into<String>,
        endpoint: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            backend: BackendKind::CosCompatible,
            ..Self::s3(repo_name, endpoint, access_key_id, secret_access_key)
        }
    }

    /// Configuration for a repository under a local directory
    pub fn local(repo_name: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::Local,
            repo_name: repo_name.into(),
            local_path: Some(local_path.into()),
            ..Self::default()
        }
    }

    /// Token lifetime to request; absent or unparsable values fall back to 12 hours
    pub fn token_duration(&self) -> Duration {
        self.token_duration_minutes
            .as_deref()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|minutes| *minutes > 0)
            .map(|minutes| Duration::from_secs(minutes * 60))
            .unwrap_or(DEFAULT_TOKEN_DURATION)
    }

    /// Base URL of the credential-issuing service
    pub fn cloud_api_url(&self) -> &str {
        match self.cloud_api_mirror.as_deref() {
            Some(mirror) if !mirror.trim().is_empty() => mirror,
            _ => DEFAULT_CLOUD_API_URL,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.repo_name.trim().is_empty() {
            return Err(BackhaulError::validation("repository name is empty"));
        }

        match self.backend {
            BackendKind::ManagedSpace => {
                if is_blank(&self.identity_id) {
                    return Err(BackhaulError::validation(
                        "managed space backend requires an identity id",
                    ));
                }
            }
            BackendKind::S3Compatible | BackendKind::CosCompatible => {
                if is_blank(&self.endpoint) {
                    return Err(BackhaulError::invalid_endpoint("endpoint is empty"));
                }
                if is_blank(&self.access_key_id) || is_blank(&self.secret_access_key) {
                    return Err(BackhaulError::validation(format!(
                        "{} backend requires an access key id and a secret access key",
                        self.backend
                    )));
                }
            }
            BackendKind::Local => {
                if self.local_path.is_none() {
                    return Err(BackhaulError::validation(
                        "local backend requires a repository root path",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// How the engine binary is invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Explicit engine binary; looked up on `PATH` when absent
    pub binary: Option<PathBuf>,
    /// Upload limit in KiB/s as given by the caller
    pub limit_upload_rate: Option<String>,
    /// Download limit in KiB/s as given by the caller
    pub limit_download_rate: Option<String>,
    /// Pass `--insecure-tls` to every engine command. Meant for self-hosted
    /// endpoints with private certificates; turn off for public clouds.
    pub insecure_tls: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            binary: None,
            limit_upload_rate: None,
            limit_download_rate: None,
            insecure_tls: true,
        }
    }
}

impl EngineOptions {
    /// `--limit-upload=N`, with `0` (unlimited) for absent or unparsable rates
    pub fn upload_rate_arg(&self) -> String {
        format!("--limit-upload={}", parse_rate(self.limit_upload_rate.as_deref()))
    }

    /// `--limit-download=N`, with `0` (unlimited) for absent or unparsable rates
    pub fn download_rate_arg(&self) -> String {
        format!(
            "--limit-download={}",
            parse_rate(self.limit_download_rate.as_deref())
        )
    }
}

fn parse_rate(raw: Option<&str>) -> i64 {
    raw.and_then(|r| r.trim().parse::<i64>().ok()).unwrap_or(0)
}

/// Bounds applied by the orchestrator to one backup or restore call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorOptions {
    /// Wall-clock deadline for the whole call
    pub deadline: Duration,
    /// How many times expired credentials may be refreshed within one call
    pub max_credential_refreshes: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            max_credential_refreshes: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("olares-space".parse::<BackendKind>().unwrap(), BackendKind::ManagedSpace);
        assert_eq!("".parse::<BackendKind>().unwrap(), BackendKind::ManagedSpace);
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::S3Compatible);
        assert_eq!("cos".parse::<BackendKind>().unwrap(), BackendKind::CosCompatible);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("gcs".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_serde_names() {
        let json = serde_json::to_string(&BackendKind::ManagedSpace).unwrap();
        assert_eq!(json, "\"olares-space\"");
        let kind: BackendKind = serde_json::from_str("\"cos\"").unwrap();
        assert_eq!(kind, BackendKind::CosCompatible);
    }

    #[test]
    fn test_cloud_name_mapping() {
        assert_eq!(BackendKind::ManagedSpace.cloud_name(), "aws");
        assert_eq!(BackendKind::S3Compatible.cloud_name(), "s3");
        assert_eq!(BackendKind::CosCompatible.cloud_name(), "cos");
    }

    #[test]
    fn test_token_duration_fallbacks() {
        let mut config = StorageConfig::managed_space("repo", "alice");
        assert_eq!(config.token_duration(), DEFAULT_TOKEN_DURATION);

        config.token_duration_minutes = Some("90".to_string());
        assert_eq!(config.token_duration(), Duration::from_secs(90 * 60));

        config.token_duration_minutes = Some("ninety".to_string());
        assert_eq!(config.token_duration(), DEFAULT_TOKEN_DURATION);
    }

    #[test]
    fn test_cloud_api_url_override() {
        let mut config = StorageConfig::managed_space("repo", "alice");
        assert_eq!(config.cloud_api_url(), DEFAULT_CLOUD_API_URL);
        config.cloud_api_mirror = Some("https://mirror.example.com/".to_string());
        assert_eq!(config.cloud_api_url(), "https://mirror.example.com/");
        config.cloud_api_mirror = Some("  ".to_string());
        assert_eq!(config.cloud_api_url(), DEFAULT_CLOUD_API_URL);
    }

    #[test]
    fn test_validate_configs() {
        assert!(StorageConfig::managed_space("repo", "alice").validate().is_ok());
        assert!(StorageConfig::managed_space("", "alice").validate().is_err());
        assert!(StorageConfig::local("repo", "/backups").validate().is_ok());

        let s3 = StorageConfig::s3("repo", "", "ak", "sk");
        assert!(matches!(s3.validate(), Err(BackhaulError::InvalidEndpoint(_))));

        let cos = StorageConfig::cos("repo", "cos.ap-beijing.myqcloud.com/b", "ak", "");
        assert!(matches!(cos.validate(), Err(BackhaulError::Validation(_))));
        assert_eq!(cos.backend, BackendKind::CosCompatible);
    }

    #[test]
    fn test_debug_redacts_secret_key() {
        let config = StorageConfig::s3("repo", "b.us-east-1.amazonaws.com", "AKIA", "very-secret");
        let rendered = format!("{config:?}");
        assert!(rendered.contains("AKIA"));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn test_rate_arguments() {
        let mut options = EngineOptions::default();
        assert_eq!(options.upload_rate_arg(), "--limit-upload=0");
        assert_eq!(options.download_rate_arg(), "--limit-download=0");

        options.limit_upload_rate = Some("2048".to_string());
        options.limit_download_rate = Some("fast".to_string());
        assert_eq!(options.upload_rate_arg(), "--limit-upload=2048");
        assert_eq!(options.download_rate_arg(), "--limit-download=0");
    }

    #[test]
    fn test_orchestrator_defaults() {
        let options = OrchestratorOptions::default();
        assert_eq!(options.deadline, Duration::from_secs(7200));
        assert_eq!(options.max_credential_refreshes, 10);
        assert!(EngineOptions::default().insecure_tls);
    }
}
