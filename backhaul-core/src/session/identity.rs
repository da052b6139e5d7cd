/*!
Cluster lookups needed to build a managed space session.

[`ClusterClients`] is a small Kubernetes REST client. It is built once by the
process entry point, usually from the in-cluster service account, and handed
to [`ClusterIdentityResolver`].
*/

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{BackhaulError, Result};

/// Namespace, name and key of the shared application secret
pub const SHARED_SECRET_NAMESPACE: &str = "os-system";
pub const SHARED_SECRET_NAME: &str = "app-key";
pub const SHARED_SECRET_KEY: &str = "random-key";

const SYSTEM_SERVER_SELECTOR: &str = "app=systemserver";
const USER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const CLUSTER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Cluster lookups for one identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// The account email registered for `identity_id`
    async fn resolve_account_email(&self, identity_id: &str) -> Result<String>;

    /// Network address of the identity's system-service pod
    async fn system_service_pod_address(&self, identity_id: &str) -> Result<String>;

    /// Raw bytes stored under `key` in a secret
    async fn fetch_shared_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>>;
}

/// Namespace holding the system services of an identity
pub fn system_namespace(identity_id: &str) -> String {
    format!("user-system-{identity_id}")
}

/// Explicitly constructed Kubernetes API handle
#[derive(Clone)]
pub struct ClusterClients {
    api_url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for ClusterClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClients")
            .field("api_url", &self.api_url)
            .field("authenticated", &self.bearer_token.is_some())
            .finish()
    }
}

impl ClusterClients {
    pub fn new(api_url: impl Into<String>, bearer_token: Option<String>) -> Result<Self> {
        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            bearer_token,
            client: reqwest::Client::builder().build()?,
        })
    }

    /// Build from the pod's service account and the `KUBERNETES_SERVICE_*`
    /// environment
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            BackhaulError::session("not running in a cluster: KUBERNETES_SERVICE_HOST is unset")
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let account_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(account_dir.join("token"))?;
        let ca = std::fs::read(account_dir.join("ca.crt"))?;
        let certificate = reqwest::Certificate::from_pem(&ca)?;

        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .build()?;

        Ok(Self {
            api_url: format!("https://{host}:{port}"),
            bearer_token: Some(token.trim().to_string()),
            client,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// GET an API path and decode the JSON body
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value> {
        let url = format!("{}{}", self.api_url, path);
        debug!(url = %url, "Cluster API request");

        let mut request = self.client.get(&url).timeout(timeout).query(query);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackhaulError::session(format!(
                "cluster API request {path} failed with status {status}"
            )));
        }
        Ok(response.json().await?)
    }
}

/// [`IdentityResolver`] backed by the Kubernetes API
#[derive(Debug, Clone)]
pub struct ClusterIdentityResolver {
    clients: ClusterClients,
}

impl ClusterIdentityResolver {
    pub fn new(clients: ClusterClients) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl IdentityResolver for ClusterIdentityResolver {
    async fn resolve_account_email(&self, identity_id: &str) -> Result<String> {
        let user = self
            .clients
            .get_json(
                &format!("/apis/iam.kubesphere.io/v1alpha2/users/{identity_id}"),
                &[],
                USER_LOOKUP_TIMEOUT,
            )
            .await?;

        user.pointer("/spec/email")
            .and_then(Value::as_str)
            .filter(|email| !email.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BackhaulError::session(format!("user {identity_id} has no email")))
    }

    async fn system_service_pod_address(&self, identity_id: &str) -> Result<String> {
        let namespace = system_namespace(identity_id);
        let pods = self
            .clients
            .get_json(
                &format!("/api/v1/namespaces/{namespace}/pods"),
                &[("labelSelector", SYSTEM_SERVER_SELECTOR)],
                CLUSTER_REQUEST_TIMEOUT,
            )
            .await?;

        let pod = pods
            .pointer("/items/0")
            .ok_or_else(|| BackhaulError::session("system server pod not found"))?;
        pod.pointer("/status/podIP")
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BackhaulError::session("system server pod ip invalid"))
    }

    async fn fetch_shared_secret(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>> {
        let secret = self
            .clients
            .get_json(
                &format!("/api/v1/namespaces/{namespace}/secrets/{name}"),
                &[],
                CLUSTER_REQUEST_TIMEOUT,
            )
            .await?;

        let data = secret
            .get("data")
            .and_then(Value::as_object)
            .filter(|data| !data.is_empty())
            .ok_or_else(|| BackhaulError::session(format!("secret {namespace}/{name} not found")))?;
        let encoded = data
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| BackhaulError::session(format!("key {key} not found in secret {name}")))?;

        STANDARD
            .decode(encoded)
            .map_err(|e| BackhaulError::session(format!("secret {name} is not valid base64: {e}")))
    }
}
