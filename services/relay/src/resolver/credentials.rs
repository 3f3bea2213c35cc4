//! Signing credentials for registry queries.
//!
//! Sources, highest precedence first:
//!
//! 1. Static keys: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and optional
//!    `AWS_SESSION_TOKEN`
//! 2. The ECS agent: `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI`, served from
//!    `169.254.170.2`
//! 3. A full container credentials URL: `AWS_CONTAINER_CREDENTIALS_FULL_URI`,
//!    authorized by `AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE` or
//!    `AWS_CONTAINER_AUTHORIZATION_TOKEN` when set
//!
//! Container credentials are temporary. They are cached and fetched again
//! shortly before they expire.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CredentialsError;

/// ECS task metadata endpoint serving relative credential URIs.
const ECS_CREDENTIALS_HOST: &str = "http://169.254.170.2";

/// Credentials are refreshed this many seconds before they expire.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Keys used to sign one request.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Authorization header for a full container credentials URL.
#[derive(Clone, PartialEq, Eq)]
pub enum ContainerAuth {
    Token(String),
    /// Read on every fetch; the agent may rotate it.
    TokenFile(PathBuf),
}

impl fmt::Debug for ContainerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerAuth::Token(_) => f.write_str("Token(<redacted>)"),
            ContainerAuth::TokenFile(path) => f.debug_tuple("TokenFile").field(path).finish(),
        }
    }
}

/// Where signing credentials come from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Static(Credentials),
    Container {
        url: String,
        auth: Option<ContainerAuth>,
    },
}

impl CredentialSource {
    /// Detect a source from environment variables.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Detect a source from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let (Some(access_key_id), Some(secret_access_key)) =
            (var("AWS_ACCESS_KEY_ID"), var("AWS_SECRET_ACCESS_KEY"))
        {
            return Some(Self::Static(Credentials {
                access_key_id,
                secret_access_key,
                session_token: var("AWS_SESSION_TOKEN"),
            }));
        }

        if let Some(relative) = var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI") {
            return Some(Self::Container {
                url: format!("{ECS_CREDENTIALS_HOST}{}", relative.trim()),
                auth: None,
            });
        }

        var("AWS_CONTAINER_CREDENTIALS_FULL_URI").map(|url| {
            let auth = var("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE")
                .map(|path| ContainerAuth::TokenFile(PathBuf::from(path.trim())))
                .or_else(|| var("AWS_CONTAINER_AUTHORIZATION_TOKEN").map(ContainerAuth::Token));
            Self::Container {
                url: url.trim().to_string(),
                auth,
            }
        })
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::Static(_) => "static",
            CredentialSource::Container { .. } => "container",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCredentials {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

struct CachedCredentials {
    credentials: Credentials,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedCredentials {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + chrono::Duration::seconds(REFRESH_MARGIN_SECS) < expires_at,
            None => true,
        }
    }
}

/// Hands out current credentials for a [`CredentialSource`].
pub struct CredentialProvider {
    source: CredentialSource,
    client: reqwest::Client,
    cached: Mutex<Option<CachedCredentials>>,
}

impl CredentialProvider {
    pub fn new(source: CredentialSource, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("preview-relay/0.1.0")
            .timeout(request_timeout)
            .build()
            .context("Failed to build credentials HTTP client")?;

        Ok(Self {
            source,
            client,
            cached: Mutex::new(None),
        })
    }

    pub fn source(&self) -> &CredentialSource {
        &self.source
    }

    /// Current credentials, fetching from the container endpoint when the
    /// cached ones are missing or about to expire.
    pub async fn credentials(&self) -> Result<Credentials, CredentialsError> {
        let (url, auth) = match &self.source {
            CredentialSource::Static(credentials) => return Ok(credentials.clone()),
            CredentialSource::Container { url, auth } => (url, auth),
        };

        // Held across the fetch so concurrent callers share one request.
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.is_fresh(Utc::now()) {
                return Ok(current.credentials.clone());
            }
        }

        let fetched = self.fetch(url, auth.as_ref()).await?;
        debug!(
            url = %url,
            expires_at = ?fetched.expires_at,
            "Fetched container credentials"
        );
        let credentials = fetched.credentials.clone();
        *cached = Some(fetched);
        Ok(credentials)
    }

    async fn fetch(
        &self,
        url: &str,
        auth: Option<&ContainerAuth>,
    ) -> Result<CachedCredentials, CredentialsError> {
        let fetch_error = |detail: String| CredentialsError::Fetch {
            url: url.to_string(),
            detail,
        };

        let mut request = self.client.get(url);
        match auth {
            Some(ContainerAuth::Token(token)) => {
                request = request.header(AUTHORIZATION, token.trim());
            }
            Some(ContainerAuth::TokenFile(path)) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|source| {
                    CredentialsError::TokenFile {
                        path: path.clone(),
                        source,
                    }
                })?;
                request = request.header(AUTHORIZATION, token.trim());
            }
            None => {}
        }

        let resp = request.send().await.map_err(|e| fetch_error(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CredentialsError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let body: ContainerCredentials =
            resp.json().await.map_err(|e| fetch_error(e.to_string()))?;

        Ok(CachedCredentials {
            credentials: Credentials {
                access_key_id: body.access_key_id,
                secret_access_key: body.secret_access_key,
                session_token: body.token.filter(|t| !t.is_empty()),
            },
            expires_at: body.expiration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(vars: &[(&str, &str)]) -> Option<CredentialSource> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CredentialSource::from_lookup(|key| vars.get(key).cloned())
    }

    fn cached(expires_at: Option<DateTime<Utc>>) -> CachedCredentials {
        CachedCredentials {
            credentials: Credentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            },
            expires_at,
        }
    }

    #[test]
    fn test_no_source_without_variables() {
        assert!(source(&[]).is_none());
        assert!(source(&[("AWS_ACCESS_KEY_ID", "AKID")]).is_none());
    }

    #[test]
    fn test_static_keys_take_precedence() {
        let found = source(&[
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
            ("AWS_SESSION_TOKEN", "token"),
            ("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI", "/v2/credentials/abc"),
        ]);
        match found {
            Some(CredentialSource::Static(credentials)) => {
                assert_eq!(credentials.access_key_id, "AKID");
                assert_eq!(credentials.session_token.as_deref(), Some("token"));
            }
            other => panic!("Expected static credentials, got {:?}", other),
        }
    }

    #[test]
    fn test_relative_uri_uses_ecs_agent() {
        let found = source(&[
            ("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI", "/v2/credentials/abc"),
            ("AWS_CONTAINER_CREDENTIALS_FULL_URI", "http://localhost:9000/creds"),
        ]);
        match found {
            Some(CredentialSource::Container { url, auth }) => {
                assert_eq!(url, "http://169.254.170.2/v2/credentials/abc");
                assert!(auth.is_none());
            }
            other => panic!("Expected container credentials, got {:?}", other),
        }
    }

    #[test]
    fn test_full_uri_with_authorization() {
        let found = source(&[
            ("AWS_CONTAINER_CREDENTIALS_FULL_URI", "http://localhost:9000/creds"),
            ("AWS_CONTAINER_AUTHORIZATION_TOKEN", "Basic abc"),
        ]);
        match found {
            Some(CredentialSource::Container { url, auth }) => {
                assert_eq!(url, "http://localhost:9000/creds");
                assert_eq!(auth, Some(ContainerAuth::Token("Basic abc".to_string())));
            }
            other => panic!("Expected container credentials, got {:?}", other),
        }

        let with_file = source(&[
            ("AWS_CONTAINER_CREDENTIALS_FULL_URI", "http://localhost:9000/creds"),
            ("AWS_CONTAINER_AUTHORIZATION_TOKEN", "Basic abc"),
            ("AWS_CONTAINER_AUTHORIZATION_TOKEN_FILE", "/var/run/token"),
        ]);
        assert!(matches!(
            with_file,
            Some(CredentialSource::Container {
                auth: Some(ContainerAuth::TokenFile(_)),
                ..
            })
        ));
    }

    #[test]
    fn test_refresh_before_expiry() {
        let now = Utc::now();
        assert!(cached(None).is_fresh(now));
        assert!(cached(Some(now + chrono::Duration::hours(1))).is_fresh(now));
        assert!(!cached(Some(now + chrono::Duration::minutes(4))).is_fresh(now));
        assert!(!cached(Some(now - chrono::Duration::minutes(1))).is_fresh(now));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credentials = cached(None).credentials;
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("secret\""));
        assert_eq!(
            format!("{:?}", ContainerAuth::Token("Basic abc".to_string())),
            "Token(<redacted>)"
        );
    }

    #[tokio::test]
    async fn test_static_source_needs_no_fetch() {
        let provider = CredentialProvider::new(
            CredentialSource::Static(cached(None).credentials),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(provider.credentials().await.unwrap().access_key_id, "AKID");
        assert_eq!(provider.source().kind(), "static");
    }
}
