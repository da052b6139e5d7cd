/*!
Session lifecycle: credentials, repository address and engine environment.

A [`SessionManager`] owns the [`Session`] for one repository. The orchestrator
drives it between engine runs:

1. [`SessionManager::resolve_account`] once per call, for managed space.
2. [`SessionManager::refresh_token`] to obtain or renew issued credentials.
3. [`SessionManager::set_repo_url`] and [`SessionManager::set_env`] to derive
   the repository string and the variables handed to the engine.

The engine copies the environment when a process starts, so credentials can be
replaced here while nothing is running without affecting a finished run.
*/

pub mod identity;
pub mod prompt;
pub mod token;

pub use identity::{ClusterClients, ClusterIdentityResolver, IdentityResolver};
pub use prompt::{enter_repository_password, SecretPrompt};
pub use token::{HttpTokenService, IssuedSession, SessionTokenRequest, TokenService, UserToken};

use backhaul_retry::{classify, retry_on_error, RetryPolicy};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, StorageConfig, DEFAULT_SPACE_REGION};
use crate::storage::{CosEndpoint, LocalLocation, RepositoryLocation, S3Endpoint, SpaceLocation};
use crate::{BackhaulError, Result};

pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_REPOSITORY: &str = "RESTIC_REPOSITORY";
pub const ENV_PASSWORD: &str = "RESTIC_PASSWORD";

/// Backend credentials for one session
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Empty for static keys
    pub session_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Credentials and addressing for one repository
#[derive(Clone, Default)]
pub struct Session {
    pub backend: BackendKind,
    pub repo_name: String,
    pub credentials: Credentials,
    pub repo_url: String,
    pub repo_password: String,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend)
            .field("repo_name", &self.repo_name)
            .field("credentials", &self.credentials)
            .field("repo_url", &self.repo_url)
            .field("repo_password", &"<redacted>")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Owns the [`Session`] of one repository and keeps it current
pub struct SessionManager {
    config: StorageConfig,
    session: Session,
    resolver: Arc<dyn IdentityResolver>,
    tokens: Arc<dyn TokenService>,
    account_policy: RetryPolicy,
    token_policy: RetryPolicy,
    account_email: Option<String>,
    user: Option<UserToken>,
    cluster_path: String,
    env: HashMap<String, String>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("account_email", &self.account_email)
            .field("user", &self.user)
            .field("cluster_path", &self.cluster_path)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager for `config`, protected by `password`
    pub fn new(
        config: StorageConfig,
        password: impl Into<String>,
        resolver: Arc<dyn IdentityResolver>,
        tokens: Arc<dyn TokenService>,
    ) -> Result<Self> {
        config.validate()?;
        let password = password.into();
        if password.is_empty() {
            return Err(BackhaulError::validation("repository password is empty"));
        }

        let session = Session {
            backend: config.backend,
            repo_name: config.repo_name.clone(),
            repo_password: password,
            ..Session::default()
        };

        Ok(Self {
            config,
            session,
            resolver,
            tokens,
            account_policy: RetryPolicy::account_lookup(),
            token_policy: RetryPolicy::token_issuance(),
            account_email: None,
            user: None,
            cluster_path: String::new(),
            env: HashMap::new(),
        })
    }

    /// Replace the account-lookup and token-issuance retry policies
    pub fn with_policies(mut self, account: RetryPolicy, token: RetryPolicy) -> Self {
        self.account_policy = account;
        self.token_policy = token;
        self
    }

    /// Path whose MD5 identifies the cluster in token requests
    pub fn set_cluster_path(&mut self, path: impl AsRef<Path>) {
        self.cluster_path = path.as_ref().to_string_lossy().into_owned();
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn backend(&self) -> BackendKind {
        self.config.backend
    }

    pub fn repo_name(&self) -> &str {
        &self.config.repo_name
    }

    pub fn account_email(&self) -> Option<&str> {
        self.account_email.as_deref()
    }

    /// Environment for the next engine run, as of the last [`Self::set_env`]
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Resolve the configured identity to its account email
    pub async fn resolve_account(&mut self) -> Result<String> {
        let identity = self
            .config
            .identity_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| BackhaulError::validation("no identity configured"))?;

        let resolver = Arc::clone(&self.resolver);
        let email = retry_on_error("resolve account", &self.account_policy, |_| {
            let resolver = Arc::clone(&resolver);
            let identity = identity.clone();
            async move {
                resolver
                    .resolve_account_email(&identity)
                    .await
                    .map_err(classify)
            }
        })
        .await
        .map_err(|e| BackhaulError::from(e).context("resolve account", identity.as_str()))?;

        if email.is_empty() {
            return Err(BackhaulError::session(format!(
                "identity {identity} has no account email"
            )));
        }

        info!(identity = %identity, email = %email, "Resolved account");
        self.account_email = Some(email.clone());
        Ok(email)
    }

    /// Obtain fresh issued credentials.
    ///
    /// Backends with static or no credentials return immediately. Unless
    /// `force_rediscover_user` is set, the cached user token is tried first;
    /// if that fails the user is rediscovered through the settings service.
    pub async fn refresh_token(&mut self, force_rediscover_user: bool) -> Result<()> {
        if !self.config.backend.uses_issued_tokens() {
            debug!(backend = %self.config.backend, "Backend has no issued credentials");
            return Ok(());
        }

        let request = self.token_request();

        if !force_rediscover_user {
            if let Some(user) = self.user.clone() {
                match self.issue(&user, &request).await {
                    Ok(issued) => return self.apply_issued(issued),
                    Err(e) => {
                        warn!(error = %e, "Cached user token rejected, rediscovering user")
                    }
                }
            }
        }

        let user = self.discover_user().await?;
        let issued = self.issue(&user, &request).await?;
        self.user = Some(user);
        self.apply_issued(issued)
    }

    fn token_request(&self) -> SessionTokenRequest {
        let region = match self.config.backend {
            BackendKind::ManagedSpace => DEFAULT_SPACE_REGION.to_string(),
            _ => self.session.region.clone(),
        };
        SessionTokenRequest {
            cloud_name: self.config.backend.cloud_name().to_string(),
            region,
            cluster_id: token::md5_hex(&self.cluster_path),
            duration: self.config.token_duration(),
        }
    }

    async fn discover_user(&mut self) -> Result<UserToken> {
        let email = match self.account_email.clone() {
            Some(email) => email,
            None => self.resolve_account().await?,
        };
        let identity = self.config.identity_id.clone().unwrap_or_default();

        let pod_address = self
            .resolver
            .system_service_pod_address(&identity)
            .await
            .map_err(|e| e.context("locate system service", identity.as_str()))?;
        let secret = self
            .resolver
            .fetch_shared_secret(
                identity::SHARED_SECRET_NAMESPACE,
                identity::SHARED_SECRET_NAME,
                identity::SHARED_SECRET_KEY,
            )
            .await
            .map_err(|e| e.context("fetch shared secret", identity::SHARED_SECRET_NAME))?;
        let nonce = token::generate_nonce(&secret, Utc::now().timestamp())?;

        let user = self
            .tokens
            .retrieve_account(&pod_address, &nonce, &email)
            .await
            .map_err(|e| e.context("retrieve account", email.as_str()))?;
        debug!(user_id = %user.user_id, "Retrieved integration account");
        Ok(user)
    }

    async fn issue(
        &self,
        user: &UserToken,
        request: &SessionTokenRequest,
    ) -> Result<IssuedSession> {
        let tokens = Arc::clone(&self.tokens);
        retry_on_error("issue session token", &self.token_policy, |_| {
            let tokens = Arc::clone(&tokens);
            async move { tokens.issue_session(user, request).await.map_err(classify) }
        })
        .await
        .map_err(BackhaulError::from)
    }

    fn apply_issued(&mut self, issued: IssuedSession) -> Result<()> {
        if issued.key.is_empty() || issued.secret.is_empty() || issued.bucket.is_empty() {
            return Err(BackhaulError::session("issued session is missing credentials"));
        }

        let expiration = if issued.expiration.is_empty() {
            None
        } else {
            match DateTime::parse_from_rfc3339(&issued.expiration) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(e) => {
                    warn!(expiration = %issued.expiration, error = %e, "Unparsable session expiration");
                    None
                }
            }
        };

        self.session.credentials = Credentials {
            access_key_id: issued.key,
            secret_access_key: issued.secret,
            session_token: issued.session_token,
        };
        self.session.bucket = issued.bucket;
        self.session.prefix = issued.prefix;
        self.session.region = if issued.region.is_empty() {
            DEFAULT_SPACE_REGION.to_string()
        } else {
            issued.region
        };
        self.session.expiration = expiration;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = crate::observability::BackhaulMetrics::global() {
            metrics.record_credential_refresh();
        }

        info!(
            repo = %self.session.repo_name,
            bucket = %self.session.bucket,
            expiration = ?self.session.expiration,
            "Session credentials refreshed"
        );
        Ok(())
    }

    /// Derive the repository address for the configured backend
    pub fn set_repo_url(&mut self) -> Result<&str> {
        let repo_name = self.config.repo_name.clone();
        let url = match self.config.backend {
            BackendKind::ManagedSpace => {
                if self.session.bucket.is_empty() {
                    return Err(BackhaulError::session(
                        "no session credentials, refresh the token first",
                    ));
                }
                SpaceLocation::new(
                    self.session.region.as_str(),
                    self.session.bucket.as_str(),
                    self.session.prefix.as_str(),
                )
                .repository_url(&repo_name)
            }
            BackendKind::S3Compatible => {
                let endpoint = S3Endpoint::parse(self.config.endpoint.as_deref().unwrap_or(""))?;
                self.apply_static_credentials(&endpoint);
                endpoint.repository_url(&repo_name)
            }
            BackendKind::CosCompatible => {
                let endpoint = CosEndpoint::parse(self.config.endpoint.as_deref().unwrap_or(""))?;
                self.apply_static_credentials(&endpoint);
                endpoint.repository_url(&repo_name)
            }
            BackendKind::Local => {
                let root = self
                    .config
                    .local_path
                    .as_deref()
                    .ok_or_else(|| BackhaulError::validation("local repository root is not set"))?;
                LocalLocation::new(root).repository_url(&repo_name)
            }
        };

        debug!(repo = %repo_name, url = %url, "Repository address");
        self.session.repo_url = url;
        Ok(&self.session.repo_url)
    }

    fn apply_static_credentials(&mut self, location: &dyn RepositoryLocation) {
        self.session.credentials = Credentials {
            access_key_id: self.config.access_key_id.clone().unwrap_or_default(),
            secret_access_key: self.config.secret_access_key.clone().unwrap_or_default(),
            session_token: String::new(),
        };
        self.session.region = location.region().unwrap_or_default().to_string();
    }

    /// Materialize the engine environment from the current session
    pub fn set_env(&mut self) -> Result<&HashMap<String, String>> {
        if self.session.repo_url.is_empty() {
            return Err(BackhaulError::session("repository address is not set"));
        }

        let mut env = HashMap::with_capacity(5);
        if self.config.backend != BackendKind::Local {
            let credentials = &self.session.credentials;
            env.insert(ENV_ACCESS_KEY_ID.to_string(), credentials.access_key_id.clone());
            env.insert(
                ENV_SECRET_ACCESS_KEY.to_string(),
                credentials.secret_access_key.clone(),
            );
            env.insert(ENV_SESSION_TOKEN.to_string(), credentials.session_token.clone());
        }
        env.insert(ENV_REPOSITORY.to_string(), self.session.repo_url.clone());
        env.insert(ENV_PASSWORD.to_string(), self.session.repo_password.clone());

        debug!(
            repository = %self.session.repo_url,
            access_key_id = %self.session.credentials.access_key_id,
            "Engine environment prepared"
        );
        self.env = env;
        Ok(&self.env)
    }
}
