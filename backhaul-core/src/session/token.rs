/*!
Token service: exchanges an identity for short-lived backend credentials.

Two requests are involved. The settings service running in the identity's
system namespace hands out the integration account (a user id and access
token) when called with a nonce derived from the cluster's shared secret.
The cloud token service then trades that pair for bucket credentials.
*/

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::{BackhaulError, Result};

pub const ACCOUNT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const SESSION_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const NONCE_HEADER: &str = "Terminus-Nonce";
const NONCE_PREFIX: &str = "appservice:";
const ACCOUNT_RETRIEVE_PATH: &str = "/legacy/v1alpha1/service.settings/v1/api/account/retrieve";
const SESSION_TOKEN_PATH: &str = "/v1/resource/stsToken/backup";

/// Integration account of an identity
#[derive(Clone, PartialEq, Eq)]
pub struct UserToken {
    pub user_id: String,
    pub access_token: String,
    /// Unix milliseconds, when reported
    pub expires_at: Option<i64>,
}

impl fmt::Debug for UserToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserToken")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Parameters of a session credential request
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTokenRequest {
    pub cloud_name: String,
    pub region: String,
    /// Hex MD5 of the path being backed up or restored
    pub cluster_id: String,
    pub duration: Duration,
}

/// Backend credentials issued for one session
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IssuedSession {
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(rename = "st", default)]
    pub session_token: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(alias = "sk", default)]
    pub secret: String,
    #[serde(alias = "ak", default)]
    pub key: String,
    /// RFC 3339
    #[serde(default)]
    pub expiration: String,
    #[serde(default)]
    pub region: String,
}

impl fmt::Debug for IssuedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedSession")
            .field("cloud", &self.cloud)
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .field("region", &self.region)
            .finish()
    }
}

/// The two token-service calls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Fetch the integration account for `account_email` from the settings
    /// service at `pod_address`
    async fn retrieve_account(
        &self,
        pod_address: &str,
        nonce: &str,
        account_email: &str,
    ) -> Result<UserToken>;

    /// Exchange a user token for backend credentials
    async fn issue_session(
        &self,
        user: &UserToken,
        request: &SessionTokenRequest,
    ) -> Result<IssuedSession>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AccountData {
    #[serde(default)]
    raw_data: Option<AccountRawData>,
}

#[derive(Debug, Deserialize)]
struct AccountRawData {
    #[serde(default, rename = "userid")]
    user_id: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Serialize)]
struct AccountRequest<'a> {
    name: &'a str,
}

/// [`TokenService`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpTokenService {
    client: reqwest::Client,
    cloud_api_url: String,
}

impl HttpTokenService {
    /// Create a client for the token service at `cloud_api_url`
    pub fn new(cloud_api_url: impl Into<String>) -> Result<Self> {
        Self::with_tls_verification(cloud_api_url, true)
    }

    /// As [`HttpTokenService::new`], optionally accepting self-signed certificates
    pub fn with_tls_verification(cloud_api_url: impl Into<String>, verify: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify)
            .build()?;
        Ok(Self {
            client,
            cloud_api_url: cloud_api_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn retrieve_account(
        &self,
        pod_address: &str,
        nonce: &str,
        account_email: &str,
    ) -> Result<UserToken> {
        let url = format!("http://{pod_address}{ACCOUNT_RETRIEVE_PATH}");
        let name = format!("integration-account:space:{account_email}");
        info!(url = %url, "Fetching integration account from settings");

        let response = self
            .client
            .post(&url)
            .timeout(ACCOUNT_REQUEST_TIMEOUT)
            .header(NONCE_HEADER, nonce)
            .json(&AccountRequest { name: &name })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackhaulError::session(format!(
                "settings account request failed with status {status}"
            )));
        }

        let envelope: Envelope<AccountData> = response.json().await?;
        if envelope.code == 1 && envelope.message.is_empty() {
            return Err(BackhaulError::session(
                "Space is not enabled. Add Space on the Settings - Integration page first",
            ));
        }
        if envelope.code != 0 {
            return Err(BackhaulError::session(format!(
                "settings account request returned code {}: {}",
                envelope.code, envelope.message
            )));
        }

        let raw = envelope
            .data
            .and_then(|data| data.raw_data)
            .ok_or_else(|| BackhaulError::session("settings account response has no data"))?;
        if raw.user_id.is_empty() || raw.access_token.is_empty() {
            return Err(BackhaulError::session("access token invalid"));
        }

        Ok(UserToken {
            user_id: raw.user_id,
            access_token: raw.access_token,
            expires_at: raw.expires_at,
        })
    }

    async fn issue_session(
        &self,
        user: &UserToken,
        request: &SessionTokenRequest,
    ) -> Result<IssuedSession> {
        let url = format!("{}{SESSION_TOKEN_PATH}", self.cloud_api_url);
        let duration = request.duration.as_secs().to_string();
        debug!(
            url = %url,
            user_id = %user.user_id,
            cloud = %request.cloud_name,
            region = %request.region,
            "Requesting session credentials"
        );

        let form = [
            ("userid", user.user_id.as_str()),
            ("token", user.access_token.as_str()),
            ("cloudName", request.cloud_name.as_str()),
            ("region", request.region.as_str()),
            ("clusterId", request.cluster_id.as_str()),
            ("durationSeconds", duration.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .timeout(SESSION_REQUEST_TIMEOUT)
            .form(&form[..])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackhaulError::session(format!(
                "session token request to {url} failed with status {status}: {body}"
            )));
        }

        let envelope: Envelope<IssuedSession> = response.json().await?;
        if envelope.code != 200 {
            return Err(BackhaulError::session(format!(
                "session token request returned code {}: {}",
                envelope.code, envelope.message
            )));
        }

        envelope.data.ok_or_else(|| {
            BackhaulError::session(format!(
                "session token response is empty, code {}: {}",
                envelope.code, envelope.message
            ))
        })
    }
}

/// Request nonce for the settings service.
///
/// `appservice:` followed by the base64 AES-CBC (PKCS#7) encryption of the
/// unix time in seconds, keyed by the shared secret with the first 16 key
/// bytes as IV.
pub fn generate_nonce(app_key: &[u8], unix_seconds: i64) -> Result<String> {
    let plaintext = unix_seconds.to_string();
    let ciphertext = encrypt_cbc(app_key, plaintext.as_bytes())?;
    Ok(format!("{NONCE_PREFIX}{}", STANDARD.encode(ciphertext)))
}

fn encrypt_cbc(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let iv = key
        .get(..16)
        .ok_or_else(|| invalid_key_length(key.len()))?;
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| invalid_key_length(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|_| invalid_key_length(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| invalid_key_length(key.len()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        other => return Err(invalid_key_length(other)),
    };
    Ok(ciphertext)
}

fn invalid_key_length(len: usize) -> BackhaulError {
    BackhaulError::validation(format!(
        "shared secret must be 16, 24 or 32 bytes, got {len}"
    ))
}

/// Hex MD5 digest, used as the cluster id in session requests
pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}
