use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gdrive_core::{GOOGLE_TOKEN_URI, OAuthClient, OAuthError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token file {0} not found; authorize this machine and place token.json there")]
    MissingTokenFile(PathBuf),
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth client id/secret are required to refresh an expired token")]
    MissingOAuthClient,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] OAuthError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid credential file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode token state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CredentialError {
    /// The token endpoint could not be reached or answered 429/5xx; the grant
    /// itself may still be fine.
    pub fn is_transient(&self) -> bool {
        match self {
            CredentialError::OAuth(OAuthError::Request(err)) => !err.is_decode() && !err.is_builder(),
            CredentialError::OAuth(OAuthError::Api { status, .. }) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Source of bearer tokens for the remote store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn valid_token(&self) -> Result<String, CredentialError>;
}

/// A fixed access token; never refreshed.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn valid_token(&self) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Authorized-user token file, as written by Google's client libraries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    #[serde(rename = "token", alias = "access_token")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
}

impl OAuthState {
    /// Unix seconds of expiry. An unparseable expiry counts as already expired.
    pub fn expires_at(&self) -> Option<i64> {
        let expiry = self.expiry.as_deref()?;
        Some(
            OffsetDateTime::parse(expiry, &Rfc3339)
                .map(|at| at.unix_timestamp())
                .unwrap_or(0),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    #[serde(default)]
    installed: Option<ClientSecretSection>,
    #[serde(default)]
    web: Option<ClientSecretSection>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretSection {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    token_uri: Option<String>,
}

pub struct TokenProvider {
    state: Mutex<OAuthState>,
    oauth_client: Option<OAuthClient>,
    token_path: Option<PathBuf>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: OAuthState, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state: Mutex::new(state),
            oauth_client,
            token_path: None,
            refresh_skew_secs: 60,
        }
    }

    /// Persist refreshed tokens back to `path`.
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = Some(path.into());
        self
    }

    /// Loads `token.json`, filling missing client credentials from `credentials.json`.
    pub async fn load(
        token_path: &Path,
        credentials_path: Option<&Path>,
    ) -> Result<Self, CredentialError> {
        let raw = match tokio::fs::read(token_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialError::MissingTokenFile(token_path.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        let mut state: OAuthState =
            serde_json::from_slice(&raw).map_err(|source| CredentialError::Parse {
                path: token_path.to_path_buf(),
                source,
            })?;

        if (state.client_id.is_none() || state.client_secret.is_none())
            && let Some(path) = credentials_path
            && let Some(section) = read_client_secrets(path).await?
        {
            state.client_id.get_or_insert(section.client_id);
            state.client_secret.get_or_insert(section.client_secret);
            if state.token_uri.is_none() {
                state.token_uri = section.token_uri;
            }
        }

        let oauth_client = match (&state.client_id, &state.client_secret) {
            (Some(id), Some(secret)) => Some(OAuthClient::with_token_uri(
                state.token_uri.as_deref().unwrap_or(GOOGLE_TOKEN_URI),
                id.clone(),
                secret.clone(),
            )?),
            _ => None,
        };

        Ok(Self::new(state, oauth_client).with_token_path(token_path))
    }

    #[cfg(test)]
    async fn state(&self) -> OAuthState {
        self.state.lock().await.clone()
    }

    fn should_refresh(&self, state: &OAuthState) -> bool {
        if state.access_token.is_empty() {
            return true;
        }
        let Some(expires_at) = state.expires_at() else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn refresh(&self, state: &mut OAuthState) -> Result<(), CredentialError> {
        let refresh_token = state
            .refresh_token
            .clone()
            .ok_or(CredentialError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(CredentialError::MissingOAuthClient)?;
        let token = match client.refresh_token(&refresh_token).await {
            Ok(token) => token,
            Err(err) => {
                if err.is_invalid_grant() {
                    tracing::error!("refresh token was rejected; re-authorize this machine");
                } else {
                    tracing::warn!(error = %err, "access token refresh failed");
                }
                return Err(err.into());
            }
        };

        state.access_token = token.access_token;
        if let Some(new_refresh) = token.refresh_token {
            state.refresh_token = Some(new_refresh);
        }
        if let Some(scope) = token.scope {
            state.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        state.expiry = token.expires_in.and_then(|secs| {
            let at = OffsetDateTime::now_utc() + time::Duration::seconds(secs as i64);
            at.format(&Rfc3339).ok()
        });
        tracing::debug!("access token refreshed");

        if let Some(path) = &self.token_path {
            save_atomic(path, state).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialProvider for TokenProvider {
    async fn valid_token(&self) -> Result<String, CredentialError> {
        let mut state = self.state.lock().await;
        if self.should_refresh(&state) {
            self.refresh(&mut state).await?;
        }
        Ok(state.access_token.clone())
    }
}

async fn read_client_secrets(path: &Path) -> Result<Option<ClientSecretSection>, CredentialError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let secrets: ClientSecrets =
        serde_json::from_slice(&raw).map_err(|source| CredentialError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(secrets.installed.or(secrets.web))
}

async fn save_atomic(path: &Path, state: &OAuthState) -> Result<(), CredentialError> {
    let body = serde_json::to_vec_pretty(state)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&tmp).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
