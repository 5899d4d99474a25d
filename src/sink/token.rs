//! OAuth2 client-credentials token manager for the sink stream.
//!
//! Fresh tokens are read lock-free; a stale token triggers a refresh under
//! a single-flight lock so concurrent callers hit the identity provider
//! exactly once. Secrets are never logged; previews only.

use crate::credentials::secret_preview;
use crate::error::{truncate_body, SinkError};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Refresh this long before the reported expiry.
pub const REFRESH_LEEWAY: Duration = Duration::from_secs(60);

/// Token endpoint paths tried in order; the second is a fallback for
/// workspaces that only expose the longer form (tried on 404).
const TOKEN_PATHS: [&str; 2] = ["/oidc/v1/token", "/oidc/oauth2/v1/token"];

/// One bearer token, replaced atomically on refresh.
#[derive(Debug, Clone)]
pub struct Token {
    pub access_token: String,
    pub obtained_at: SystemTime,
    /// Absent when the provider omits `expires_in`.
    pub expires_at: Option<SystemTime>,
    pub endpoint_used: String,
}

impl Token {
    /// Fresh iff `now < expires_at − leeway` (a token without a reported
    /// expiry never goes stale on its own; `invalidate` handles revocation).
    pub fn is_fresh(&self, leeway: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => match expires_at.checked_sub(leeway) {
                Some(deadline) => SystemTime::now() < deadline,
                None => false,
            },
            None => true,
        }
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Source of tokens; production uses [`OAuthClientCredentials`].
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Token, SinkError>;
}

/// Table privileges requested by the scoped Zerobus grant.
#[derive(Debug, Clone)]
pub struct ZerobusScope {
    pub workspace_id: String,
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl ZerobusScope {
    fn resource(&self) -> String {
        format!(
            "api://databricks/workspaces/{}/zerobusDirectWriteApi",
            self.workspace_id
        )
    }

    fn authorization_details(&self) -> String {
        let details = serde_json::json!([
            {
                "type": "unity_catalog_privileges",
                "privileges": ["USE CATALOG"],
                "object_type": "CATALOG",
                "object_full_path": self.catalog,
            },
            {
                "type": "unity_catalog_privileges",
                "privileges": ["USE SCHEMA"],
                "object_type": "SCHEMA",
                "object_full_path": format!("{}.{}", self.catalog, self.schema),
            },
            {
                "type": "unity_catalog_privileges",
                "privileges": ["SELECT", "MODIFY"],
                "object_type": "TABLE",
                "object_full_path": format!("{}.{}.{}", self.catalog, self.schema, self.table),
            },
        ]);
        details.to_string()
    }
}

/// Client-credentials grant against `<workspace_host>/oidc/v1/token`.
pub struct OAuthClientCredentials {
    http: reqwest::Client,
    workspace_host: String,
    client_id: String,
    client_secret: String,
    scope: String,
    zerobus: Option<ZerobusScope>,
}

impl OAuthClientCredentials {
    pub fn new(
        http: reqwest::Client,
        workspace_host: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
        zerobus: Option<ZerobusScope>,
    ) -> Self {
        let client_id = client_id.into();
        tracing::info!(client_id = %secret_preview(&client_id), "token fetcher configured");
        Self {
            http,
            workspace_host: workspace_host.into().trim_end_matches('/').to_string(),
            client_id,
            client_secret: client_secret.into(),
            scope: scope.into(),
            zerobus,
        }
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[async_trait]
impl TokenFetcher for OAuthClientCredentials {
    async fn fetch(&self) -> Result<Token, SinkError> {
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "client_credentials".to_string()),
            ("scope", self.scope.clone()),
        ];
        let resource;
        let details;
        if let Some(scope) = &self.zerobus {
            resource = scope.resource();
            details = scope.authorization_details();
            form.push(("resource", resource.clone()));
            form.push(("authorization_details", details.clone()));
        }

        let mut last_err: Option<String> = None;
        for path in TOKEN_PATHS {
            let url = format!("{}{}", self.workspace_host, path);
            let response = self
                .http
                .post(&url)
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(&form)
                .timeout(Duration::from_secs(20))
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(format!("{url} -> {e}"));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 404 {
                let body = response.text().await.unwrap_or_default();
                last_err = Some(format!("{url} -> HTTP 404: {}", truncate_body(&body)));
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SinkError::Auth(format!(
                    "{url} -> HTTP {status}: {}",
                    truncate_body(&body)
                )));
            }

            let payload: TokenResponse = response
                .json()
                .await
                .map_err(|e| SinkError::Auth(format!("{url} -> malformed token response: {e}")))?;
            if payload.access_token.is_empty() {
                return Err(SinkError::Auth(format!("{url} -> empty access_token")));
            }

            let now = SystemTime::now();
            let expires_at = payload.expires_in.map(|s| now + Duration::from_secs(s));
            tracing::info!(
                endpoint = %url,
                token = %secret_preview(&payload.access_token),
                "obtained sink access token"
            );
            return Ok(Token {
                access_token: payload.access_token,
                obtained_at: now,
                expires_at,
                endpoint_used: url,
            });
        }

        Err(SinkError::Auth(
            last_err.unwrap_or_else(|| "failed to fetch token".to_string()),
        ))
    }
}

/// Cache + refresher with a single-flight lock.
pub struct TokenManager {
    fetcher: Arc<dyn TokenFetcher>,
    cached: ArcSwapOption<Token>,
    refresh: Mutex<()>,
    leeway: Duration,
    refreshes: AtomicU64,
}

impl TokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self::with_leeway(fetcher, REFRESH_LEEWAY)
    }

    pub fn with_leeway(fetcher: Arc<dyn TokenFetcher>, leeway: Duration) -> Self {
        Self {
            fetcher,
            cached: ArcSwapOption::empty(),
            refresh: Mutex::new(()),
            leeway,
            refreshes: AtomicU64::new(0),
        }
    }

    /// A fresh token, refreshing if necessary. The fast path is lock-free.
    pub async fn bearer(&self) -> Result<Arc<Token>, SinkError> {
        if let Some(token) = self.cached.load_full() {
            if token.is_fresh(self.leeway) {
                return Ok(token);
            }
        }

        let _flight = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.cached.load_full() {
            if token.is_fresh(self.leeway) {
                return Ok(token);
            }
        }

        let token = Arc::new(self.fetcher.fetch().await?);
        self.cached.store(Some(token.clone()));
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(token)
    }

    /// Drop the cached token so the next caller refreshes (forced refresh
    /// after a 401/403).
    pub fn invalidate(&self) {
        self.cached.store(None);
    }

    /// Seed the cache, e.g. from a startup prefetch.
    pub fn prime(&self, token: Token) {
        self.cached.store(Some(Arc::new(token)));
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}
