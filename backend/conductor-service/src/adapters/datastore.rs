//! Data store (storage account) adapter
//!
//! Talks to the data store HTTP API. Creating an account also creates its
//! home directory, grants `own` on it to the services and admin accounts, and
//! registers any requested service paths. A create that fails after the user
//! was added removes the user again.
use super::http::{build_client, check_status, join_url, transport_error};
use super::{AdapterError, AdapterOutcome, Backend, Password, ResourceSpec, ServiceAdapter};
use crate::config::DatastoreSettings;
use crate::models::DatastoreService;
use async_trait::async_trait;
use reqwest::Client;
use resilience::{with_retry_if, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKEND: Backend = Backend::Storage;

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct HomeResponse {
    home: String,
}

#[derive(Debug, Serialize)]
struct PathPermission<'a> {
    username: &'a str,
    path: &'a str,
    permission: &'a str,
}

#[derive(Debug, Serialize)]
struct ServiceRegistration<'a> {
    username: &'a str,
    irods_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    irods_user: Option<&'a str>,
}

pub struct DatastoreAdapter {
    client: Client,
    settings: DatastoreSettings,
}

impl DatastoreAdapter {
    pub fn new(settings: DatastoreSettings, timeout: Duration) -> Result<Self, AdapterError> {
        let client = build_client(timeout, true).map_err(|e| transport_error(BACKEND, e))?;
        Ok(Self { client, settings })
    }

    fn url(&self, parts: &[&str]) -> String {
        join_url(&self.settings.url, parts)
    }

    /// Check the API root answers before any write
    pub async fn health_check(&self) -> Result<(), AdapterError> {
        let url = self.settings.url.trim_end_matches('/');
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;

        if resp.status().as_u16() < 400 {
            debug!(status = resp.status().as_u16(), "Data store health check passed");
            Ok(())
        } else {
            Err(AdapterError::unavailable(
                BACKEND,
                format!("health check returned HTTP {}", resp.status().as_u16()),
            ))
        }
    }

    async fn user_exists(&self, username: &str) -> Result<bool, AdapterError> {
        let resp = self
            .client
            .get(self.url(&["users", username, "exists"]))
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let body: ExistsResponse = check_status(BACKEND, resp)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::protocol(BACKEND, e.to_string()))?;
        Ok(body.exists)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        parts: &[&str],
        body: Option<&T>,
    ) -> Result<(), AdapterError> {
        let mut req = self.client.post(self.url(parts));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| transport_error(BACKEND, e))?;
        check_status(BACKEND, resp).await?;
        Ok(())
    }

    async fn delete_path(&self, parts: &[&str]) -> Result<(), AdapterError> {
        let resp = self
            .client
            .delete(self.url(parts))
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        check_status(BACKEND, resp).await?;
        Ok(())
    }

    async fn user_home(&self, username: &str) -> Result<String, AdapterError> {
        let resp = self
            .client
            .get(self.url(&["users", username, "home"]))
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let body: HomeResponse = check_status(BACKEND, resp)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::protocol(BACKEND, e.to_string()))?;
        Ok(body.home)
    }

    async fn grant_own(&self, account: &str, path: &str) -> Result<(), AdapterError> {
        let perm = PathPermission {
            username: account,
            path,
            permission: "own",
        };
        self.post_json(&["path", "chmod"], Some(&perm)).await
    }

    async fn register_services(
        &self,
        username: &str,
        services: &[DatastoreService],
    ) -> Result<usize, AdapterError> {
        for service in services {
            let registration = ServiceRegistration {
                username,
                irods_path: &service.irods_path,
                irods_user: service.irods_user.as_deref(),
            };
            self.post_json(&["services", "register"], Some(&registration))
                .await?;
            debug!(username = %username, path = %service.irods_path, "Registered data store service");
        }
        Ok(services.len())
    }

    async fn set_password(&self, username: &str, password: &Password) -> Result<(), AdapterError> {
        self.post_json(
            &["users", username, "password"],
            Some(&serde_json::json!({ "password": password.expose() })),
        )
        .await
    }

    /// Everything after the user itself was added
    async fn finish_user(
        &self,
        username: &str,
        password: &Password,
        services: &[DatastoreService],
    ) -> Result<(String, usize), AdapterError> {
        self.set_password(username, password).await?;

        let home = self.user_home(username).await?;
        self.grant_own(&self.settings.ipcservices_user, &home).await?;
        self.grant_own(&self.settings.admin_user, &home).await?;

        let registered = self.register_services(username, services).await?;
        Ok((home, registered))
    }

    async fn remove_user(&self, username: &str) -> Result<(), AdapterError> {
        self.delete_path(&["users", username, "home"]).await?;
        self.delete_path(&["users", username]).await
    }

    async fn require_user(&self, username: &str) -> Result<(), AdapterError> {
        if self.user_exists(username).await? {
            Ok(())
        } else {
            Err(AdapterError::Rejected {
                backend: BACKEND,
                status: 404,
                message: format!("no data store user `{username}`"),
            })
        }
    }
}

#[async_trait]
impl ServiceAdapter for DatastoreAdapter {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn exists(&self, username: &str) -> Result<bool, AdapterError> {
        with_retry_if(
            RetryConfig::default(),
            || self.user_exists(username),
            AdapterError::is_transient,
        )
        .await
        .map_err(|e| e.into_inner())
    }

    async fn create(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let ResourceSpec::Storage { password, services } = spec else {
            return Err(AdapterError::mismatched_spec(BACKEND, "create", spec));
        };

        self.health_check().await?;

        if self.user_exists(username).await? {
            info!(username = %username, "Data store user already exists");
            return Ok(AdapterOutcome::AlreadyExists);
        }

        self.post_json::<()>(&["users", username], None).await?;

        let (home, registered) = match self.finish_user(username, password, services).await {
            Ok(done) => done,
            Err(e) => {
                warn!(username = %username, error = %e, "Data store create failed after add, removing user");
                if let Err(cleanup) = self.remove_user(username).await {
                    warn!(username = %username, error = %cleanup, "Failed to remove partial data store user");
                    return Err(AdapterError::partial(BACKEND, &e, &cleanup));
                }
                return Err(e);
            }
        };

        info!(
            username = %username,
            home = %home,
            services = registered,
            "Created data store user"
        );
        Ok(AdapterOutcome::applied(format!(
            "created data store user with home {home}"
        )))
    }

    async fn delete(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        if !matches!(spec, ResourceSpec::Identity) {
            return Err(AdapterError::mismatched_spec(BACKEND, "delete", spec));
        }
        if !self.user_exists(username).await? {
            return Ok(AdapterOutcome::AlreadyAbsent);
        }

        self.remove_user(username).await?;

        info!(username = %username, "Deleted data store user and home directory");
        Ok(AdapterOutcome::applied("deleted data store user and home"))
    }

    async fn register(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        match spec {
            ResourceSpec::Password(password) => {
                self.require_user(username).await?;
                self.set_password(username, password).await?;
                info!(username = %username, "Changed data store password");
                Ok(AdapterOutcome::applied("data store password changed"))
            }
            ResourceSpec::Services(services) => {
                if services.is_empty() {
                    return Ok(AdapterOutcome::AlreadyExists);
                }
                let n = self.register_services(username, services).await?;
                Ok(AdapterOutcome::applied(format!(
                    "registered {n} data store services"
                )))
            }
            other => Err(AdapterError::mismatched_spec(BACKEND, "register", other)),
        }
    }
}
