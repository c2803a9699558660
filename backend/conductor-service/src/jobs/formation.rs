//! Batch-job system client
//!
//! Authenticates with an OAuth2 client-credentials grant against Keycloak and
//! caches the access token until shortly before it expires. All calls are
//! single round trips; callers decide when to poll.

use crate::adapters::http::{build_client, join_url};
use crate::config::FormationSettings;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Refresh this long before the token's expiry
const REFRESH_BUFFER_SECS: i64 = 60;

/// Lifetime assumed when the token response omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 300;

#[derive(Debug, Clone, Error)]
pub enum JobSystemError {
    #[error("batch-job system unreachable: {0}")]
    Unavailable(String),

    #[error("authentication with the batch-job system failed: {0}")]
    Auth(String),

    #[error("batch-job system rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("job template `{0}` not found")]
    TemplateNotFound(String),

    #[error("unexpected batch-job system response: {0}")]
    Protocol(String),
}

/// Remote batch-job system as seen by the tracker
#[async_trait]
pub trait BatchJobSystem: Send + Sync {
    /// Resolve a job template name to its identifier
    async fn resolve_template(&self, name: &str) -> Result<String, JobSystemError>;

    /// Launch the deletion template for `username`, returning the job id
    async fn launch(&self, template_id: &str, username: &str) -> Result<String, JobSystemError>;

    /// Native status string of a job
    async fn status(&self, job_id: &str) -> Result<String, JobSystemError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct TokenCache {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl TokenCache {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::seconds(REFRESH_BUFFER_SECS) > now
    }
}

#[derive(Debug, Serialize)]
struct Submission<'a> {
    name: String,
    app_id: &'a str,
    system_id: &'a str,
    debug: bool,
    notify: bool,
    config: HashMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    analysis_id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct AppListing {
    #[serde(default)]
    apps: Vec<AppSummary>,
}

#[derive(Debug, Deserialize)]
struct AppSummary {
    id: String,
    name: String,
}

pub struct FormationClient {
    client: Client,
    settings: FormationSettings,
    token: Mutex<Option<TokenCache>>,
}

impl FormationClient {
    pub fn new(settings: FormationSettings, timeout: Duration) -> Result<Self, JobSystemError> {
        if !settings.verify_tls {
            warn!("TLS verification disabled for the batch-job system client");
        }
        let client = build_client(timeout, settings.verify_tls)
            .map_err(|e| JobSystemError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            settings,
            token: Mutex::new(None),
        })
    }

    fn token_endpoint(&self) -> String {
        join_url(
            &self.settings.keycloak_url,
            &[
                "realms",
                self.settings.realm.as_str(),
                "protocol",
                "openid-connect",
                "token",
            ],
        )
    }

    fn api_url(&self, parts: &[&str]) -> String {
        join_url(&self.settings.url, parts)
    }

    /// Cached access token, refreshed when within the buffer of expiry
    async fn access_token(&self) -> Result<String, JobSystemError> {
        // Held across the refresh so concurrent callers wait for one fetch
        let mut cache = self.token.lock().await;
        let now = Utc::now();
        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh(now)) {
            return Ok(cached.access_token.clone());
        }

        let resp = self
            .client
            .post(self.token_endpoint())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| JobSystemError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token request rejected");
            return Err(if status.is_server_error() {
                JobSystemError::Unavailable(format!(
                    "token endpoint returned HTTP {}",
                    status.as_u16()
                ))
            } else {
                JobSystemError::Auth(format!("HTTP {}: {}", status.as_u16(), body))
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| JobSystemError::Auth(format!("invalid token response: {e}")))?;
        let lifetime = token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        info!(expires_in = lifetime, "Batch-job system token refreshed");
        *cache = Some(TokenCache {
            access_token: token.access_token.clone(),
            expires_at: now + ChronoDuration::seconds(lifetime),
        });
        Ok(token.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, JobSystemError> {
        let token = self.access_token().await?;
        let resp = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| JobSystemError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => JobSystemError::Auth(format!("HTTP {}: {}", status.as_u16(), body)),
            s if status.is_client_error() => JobSystemError::Rejected {
                status: s,
                message: body,
            },
            s => JobSystemError::Unavailable(format!("HTTP {s}: {body}")),
        })
    }
}

#[async_trait]
impl BatchJobSystem for FormationClient {
    async fn resolve_template(&self, name: &str) -> Result<String, JobSystemError> {
        let request = self
            .client
            .get(self.api_url(&["apps", self.settings.system_id.as_str()]))
            .query(&[("search", name)]);
        let listing: AppListing = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| JobSystemError::Protocol(e.to_string()))?;

        let id = listing
            .apps
            .into_iter()
            .find(|app| app.name == name)
            .map(|app| app.id)
            .ok_or_else(|| JobSystemError::TemplateNotFound(name.to_string()))?;

        debug!(template = %name, template_id = %id, "Resolved job template");
        Ok(id)
    }

    async fn launch(&self, template_id: &str, username: &str) -> Result<String, JobSystemError> {
        let submission = Submission {
            name: format!("delete-user-{username}"),
            app_id: template_id,
            system_id: &self.settings.system_id,
            debug: false,
            notify: false,
            config: HashMap::from([(self.settings.username_parameter.as_str(), username)]),
        };

        let request = self
            .client
            .post(self.api_url(&[
                "app",
                "launch",
                self.settings.system_id.as_str(),
                template_id,
            ]))
            .json(&submission);
        let launched: LaunchResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| JobSystemError::Protocol(e.to_string()))?;

        info!(
            username = %username,
            job_id = %launched.analysis_id,
            status = launched.status.as_deref().unwrap_or("unknown"),
            "Launched deletion job"
        );
        Ok(launched.analysis_id)
    }

    async fn status(&self, job_id: &str) -> Result<String, JobSystemError> {
        let request = self
            .client
            .get(self.api_url(&["apps", "analyses", job_id, "status"]));
        let status: StatusResponse = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| JobSystemError::Protocol(e.to_string()))?;
        Ok(status.status)
    }
}
