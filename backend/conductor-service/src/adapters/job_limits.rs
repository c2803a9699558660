//! Job-limit (service registration) adapter
//!
//! Each call fetches a bearer token from `token/keycloak` with the service
//! account's basic credentials, then manages the per-user concurrent job
//! limit override. Every change reads the override first and returns an
//! undo that puts it back.
use super::http::{build_client, check_status, join_url, status_error, transport_error};
use super::{
    AdapterError, AdapterOutcome, Backend, Detail, Query, ResourceSpec, ServiceAdapter, Undo,
};
use crate::config::TerrainSettings;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use resilience::{with_retry_if, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const BACKEND: Backend = Backend::JobLimits;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct JobLimitsResponse {
    #[serde(default)]
    concurrent_jobs: Option<u32>,
}

#[derive(Debug, Serialize)]
struct JobLimitsBody {
    concurrent_jobs: u32,
}

pub struct JobLimitsAdapter {
    client: Client,
    settings: TerrainSettings,
}

impl JobLimitsAdapter {
    pub fn new(settings: TerrainSettings, timeout: Duration) -> Result<Self, AdapterError> {
        let client = build_client(timeout, true).map_err(|e| transport_error(BACKEND, e))?;
        Ok(Self { client, settings })
    }

    fn limits_url(&self, username: &str) -> String {
        join_url(
            &self.settings.url,
            &["admin", "settings", "concurrent-job-limits", username],
        )
    }

    async fn fetch_token(&self) -> Result<String, AdapterError> {
        let resp = self
            .client
            .get(join_url(&self.settings.url, &["token", "keycloak"]))
            .basic_auth(&self.settings.user, Some(&self.settings.password))
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let token: TokenResponse = check_status(BACKEND, resp)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::protocol(BACKEND, e.to_string()))?;
        Ok(token.access_token)
    }

    async fn token(&self) -> Result<String, AdapterError> {
        with_retry_if(
            RetryConfig::default(),
            || self.fetch_token(),
            AdapterError::is_transient,
        )
        .await
        .map_err(|e| e.into_inner())
    }

    /// Current override, `None` when the user has none
    pub async fn current_limit(&self, username: &str) -> Result<Option<u32>, AdapterError> {
        let token = self.token().await?;
        let resp = self
            .client
            .get(self.limits_url(username))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: JobLimitsResponse = check_status(BACKEND, resp)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::protocol(BACKEND, e.to_string()))?;
        Ok(body.concurrent_jobs)
    }

    async fn set_limit(&self, username: &str, limit: u32) -> Result<AdapterOutcome, AdapterError> {
        let prior = self.current_limit(username).await?;
        if prior == Some(limit) {
            debug!(username = %username, limit, "Job limit already set");
            return Ok(AdapterOutcome::AlreadyExists);
        }

        let token = self.token().await?;
        let resp = self
            .client
            .put(self.limits_url(username))
            .bearer_auth(&token)
            .json(&JobLimitsBody {
                concurrent_jobs: limit,
            })
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        check_status(BACKEND, resp).await?;

        info!(username = %username, limit, prior = ?prior, "Set concurrent job limit");
        Ok(AdapterOutcome::reversible(
            format!("job limit set to {limit}"),
            restore(prior),
        ))
    }
}

#[async_trait]
impl ServiceAdapter for JobLimitsAdapter {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn exists(&self, username: &str) -> Result<bool, AdapterError> {
        Ok(self.current_limit(username).await?.is_some())
    }

    async fn create(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        self.register(username, spec).await
    }

    async fn delete(
        &self,
        username: &str,
        _spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let Some(prior) = self.current_limit(username).await? else {
            debug!(username = %username, "No job limit override to remove");
            return Ok(AdapterOutcome::AlreadyAbsent);
        };

        let token = self.token().await?;
        let resp = self
            .client
            .delete(self.limits_url(username))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(AdapterOutcome::AlreadyAbsent);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(BACKEND, status, body));
        }

        info!(username = %username, prior, "Removed concurrent job limit override");
        Ok(AdapterOutcome::reversible(
            format!("job limit override {prior} removed"),
            restore(Some(prior)),
        ))
    }

    async fn register(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        match spec {
            ResourceSpec::JobLimit { concurrent_jobs } => {
                self.set_limit(username, *concurrent_jobs).await
            }
            other => Err(AdapterError::mismatched_spec(BACKEND, "register", other)),
        }
    }

    async fn query(&self, username: &str, query: &Query) -> Result<Detail, AdapterError> {
        match query {
            Query::JobLimit => Ok(Detail::JobLimit(self.current_limit(username).await?)),
            other => Err(AdapterError::Unsupported {
                backend: BACKEND,
                capability: other.label(),
            }),
        }
    }
}

/// Call that returns the override to `prior`
fn restore(prior: Option<u32>) -> Undo {
    match prior {
        Some(concurrent_jobs) => Undo::Register(ResourceSpec::JobLimit { concurrent_jobs }),
        None => Undo::Delete(ResourceSpec::Identity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_puts_back_prior_override() {
        assert_eq!(
            restore(Some(8)),
            Undo::Register(ResourceSpec::JobLimit { concurrent_jobs: 8 })
        );
        assert_eq!(restore(None), Undo::Delete(ResourceSpec::Identity));
    }
}
