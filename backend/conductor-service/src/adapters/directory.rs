//! LDAP directory adapter
//!
//! One connection per capability call: connect, bind as the configured
//! administrator, do the work, unbind. Accounts live under `ou=People`,
//! groups under `ou=Groups`, membership is tracked with `memberUid`.
//!
//! If anything fails after the account entry was added, the partial entry is
//! purged before the error is returned. When the purge fails too the error is
//! `PartiallyApplied`, so the coordinator reports the account as left behind.

use super::{
    AccountSpec, AdapterError, AdapterOutcome, Backend, Detail, Query, ResourceSpec,
    ServiceAdapter, Undo,
};
use crate::config::DirectorySettings;
use async_trait::async_trait;
use chrono::Utc;
use ldap3::exop::PasswordModify;
use ldap3::{
    dn_escape, ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Mod,
    Scope, SearchEntry,
};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKEND: Backend = Backend::Directory;

const RC_SUCCESS: u32 = 0;
const RC_NO_SUCH_ATTRIBUTE: u32 = 16;
const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_ALREADY_EXISTS: u32 = 68;

const GID_NUMBER: &str = "10013";
const LOGIN_SHELL: &str = "/bin/bash";
const SHADOW_MIN: &str = "1";
const SHADOW_MAX: &str = "730";
const SHADOW_INACTIVE: &str = "10";
const SHADOW_WARNING: &str = "10";

type Attrs = Vec<(String, HashSet<String>)>;

pub struct DirectoryAdapter {
    settings: DirectorySettings,
    timeout: Duration,
}

impl DirectoryAdapter {
    pub fn new(settings: DirectorySettings, timeout: Duration) -> Self {
        Self { settings, timeout }
    }

    fn user_dn(&self, username: &str) -> String {
        format!("uid={},ou=People,{}", dn_escape(username), self.settings.base_dn)
    }

    fn group_dn(&self, group: &str) -> String {
        format!("cn={},ou=Groups,{}", dn_escape(group), self.settings.base_dn)
    }

    fn groups_base(&self) -> String {
        format!("ou=Groups,{}", self.settings.base_dn)
    }

    /// Default groups followed by the requested ones, without duplicates
    fn groups_for(&self, extra: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        [&self.settings.everyone_group, &self.settings.community_group]
            .into_iter()
            .chain(extra.iter())
            .filter(|g| !g.trim().is_empty())
            .filter(|g| seen.insert(g.as_str()))
            .cloned()
            .collect()
    }

    async fn connect(&self) -> Result<Ldap, AdapterError> {
        let conn_settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, &self.settings.url)
            .await
            .map_err(ldap_error)?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection terminated");
            }
        });

        ldap.simple_bind(&self.settings.bind_dn, &self.settings.password)
            .await
            .and_then(LdapResult::success)
            .map_err(ldap_error)?;

        Ok(ldap)
    }

    async fn user_present(&self, ldap: &mut Ldap, username: &str) -> Result<bool, AdapterError> {
        let filter = format!(
            "(&(objectClass=posixAccount)(uid={}))",
            ldap_escape(username)
        );
        let (entries, _) = ldap
            .search(&self.settings.base_dn, Scope::Subtree, &filter, vec!["uid"])
            .await
            .and_then(|r| r.success())
            .map_err(ldap_error)?;
        Ok(!entries.is_empty())
    }

    async fn member_groups(
        &self,
        ldap: &mut Ldap,
        username: &str,
    ) -> Result<Vec<String>, AdapterError> {
        let filter = format!(
            "(&(objectClass=posixGroup)(memberUid={}))",
            ldap_escape(username)
        );
        let (entries, _) = ldap
            .search(&self.groups_base(), Scope::Subtree, &filter, vec!["cn"])
            .await
            .and_then(|r| r.success())
            .map_err(ldap_error)?;

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .filter_map(|e| e.attrs.get("cn").and_then(|v| v.first().cloned()))
            .collect())
    }

    /// `Ok(false)` when the membership was already as asked
    async fn change_membership(
        &self,
        ldap: &mut Ldap,
        username: &str,
        group: &str,
        add: bool,
    ) -> Result<bool, AdapterError> {
        let values = HashSet::from([username.to_string()]);
        let change = if add {
            Mod::Add("memberUid".to_string(), values)
        } else {
            Mod::Delete("memberUid".to_string(), values)
        };

        let result = ldap
            .modify(&self.group_dn(group), vec![change])
            .await
            .map_err(ldap_error)?;

        match result.rc {
            RC_SUCCESS => Ok(true),
            // already a member / already gone
            RC_ATTRIBUTE_OR_VALUE_EXISTS | RC_NO_SUCH_ATTRIBUTE => {
                debug!(group = %group, username = %username, "Group membership already in place");
                Ok(false)
            }
            _ => Err(rejected(result)),
        }
    }

    /// Join or leave each group; the groups actually changed
    async fn change_groups(
        &self,
        ldap: &mut Ldap,
        username: &str,
        groups: &[String],
        add: bool,
    ) -> Result<Vec<String>, AdapterError> {
        let mut changed = Vec::new();
        for group in groups {
            if self.change_membership(ldap, username, group, add).await? {
                changed.push(group.clone());
            }
        }
        Ok(changed)
    }

    async fn require_account(&self, ldap: &mut Ldap, username: &str) -> Result<(), AdapterError> {
        if self.user_present(ldap, username).await? {
            Ok(())
        } else {
            Err(AdapterError::Rejected {
                backend: BACKEND,
                status: 404,
                message: format!("no directory account for `{username}`"),
            })
        }
    }

    /// New password plus a fresh `shadowLastChange`
    async fn change_password(
        &self,
        ldap: &mut Ldap,
        username: &str,
        password: &str,
    ) -> Result<AdapterOutcome, AdapterError> {
        self.require_account(ldap, username).await?;
        self.set_password(ldap, username, password).await?;

        let last_change = HashSet::from([days_since_epoch().to_string()]);
        ldap.modify(
            &self.user_dn(username),
            vec![Mod::Replace("shadowLastChange".to_string(), last_change)],
        )
        .await
        .and_then(LdapResult::success)
        .map_err(ldap_error)?;

        info!(username = %username, "Changed directory password");
        Ok(AdapterOutcome::applied("directory password changed"))
    }

    async fn set_password(
        &self,
        ldap: &mut Ldap,
        username: &str,
        password: &str,
    ) -> Result<(), AdapterError> {
        let dn = self.user_dn(username);
        ldap.extended(PasswordModify {
            user_id: Some(dn.as_str()),
            old_pass: None,
            new_pass: Some(password),
        })
        .await
        .and_then(|r| r.success())
        .map_err(ldap_error)?;
        Ok(())
    }

    /// Leave every group, then remove the entry
    async fn purge(&self, ldap: &mut Ldap, username: &str) -> Result<AdapterOutcome, AdapterError> {
        let groups = self.member_groups(ldap, username).await?;
        self.change_groups(ldap, username, &groups, false).await?;

        let result = ldap
            .delete(&self.user_dn(username))
            .await
            .map_err(ldap_error)?;
        match result.rc {
            RC_SUCCESS => Ok(AdapterOutcome::applied("removed directory account")),
            RC_NO_SUCH_OBJECT => Ok(AdapterOutcome::AlreadyAbsent),
            _ => Err(rejected(result)),
        }
    }

    async fn create_account(
        &self,
        ldap: &mut Ldap,
        username: &str,
        account: &AccountSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        if self.user_present(ldap, username).await? {
            info!(username = %username, "Directory account already exists");
            return Ok(AdapterOutcome::AlreadyExists);
        }

        let attrs = account_attributes(username, account, days_since_epoch());
        let result = ldap
            .add(&self.user_dn(username), attrs)
            .await
            .map_err(ldap_error)?;
        match result.rc {
            RC_SUCCESS => {}
            RC_ALREADY_EXISTS => return Ok(AdapterOutcome::AlreadyExists),
            _ => return Err(rejected(result)),
        }

        let groups = self.groups_for(&account.groups);
        if let Err(e) = self.finish_account(ldap, username, account, &groups).await {
            warn!(username = %username, error = %e, "Directory create failed after add, purging entry");
            if let Err(purge_err) = self.purge(ldap, username).await {
                warn!(username = %username, error = %purge_err, "Failed to purge partial directory entry");
                return Err(AdapterError::partial(BACKEND, &e, &purge_err));
            }
            return Err(e);
        }

        info!(username = %username, groups = ?groups, "Created directory account");
        Ok(AdapterOutcome::applied(format!(
            "created directory account in {} groups",
            groups.len()
        )))
    }

    async fn finish_account(
        &self,
        ldap: &mut Ldap,
        username: &str,
        account: &AccountSpec,
        groups: &[String],
    ) -> Result<(), AdapterError> {
        self.set_password(ldap, username, account.password.expose())
            .await?;
        self.change_groups(ldap, username, groups, true).await?;
        Ok(())
    }
}

#[async_trait]
impl ServiceAdapter for DirectoryAdapter {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn exists(&self, username: &str) -> Result<bool, AdapterError> {
        let mut ldap = self.connect().await?;
        let present = self.user_present(&mut ldap, username).await;
        let _ = ldap.unbind().await;
        present
    }

    async fn create(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let ResourceSpec::Account(account) = spec else {
            return Err(AdapterError::mismatched_spec(BACKEND, "create", spec));
        };

        let mut ldap = self.connect().await?;
        let outcome = self.create_account(&mut ldap, username, account).await;
        let _ = ldap.unbind().await;
        outcome
    }

    async fn delete(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let mut ldap = self.connect().await?;
        let outcome = match spec {
            ResourceSpec::Identity => match self.user_present(&mut ldap, username).await {
                Ok(false) => Ok(AdapterOutcome::AlreadyAbsent),
                Ok(true) => self.purge(&mut ldap, username).await,
                Err(e) => Err(e),
            },
            ResourceSpec::Groups(groups) => self
                .change_groups(&mut ldap, username, groups, false)
                .await
                .map(|removed| groups_outcome(removed, false)),
            other => Err(AdapterError::mismatched_spec(BACKEND, "delete", other)),
        };
        let _ = ldap.unbind().await;

        if matches!(spec, ResourceSpec::Identity) && matches!(outcome, Ok(AdapterOutcome::Applied(_))) {
            info!(username = %username, "Deleted directory account");
        }
        outcome
    }

    async fn register(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let mut ldap = self.connect().await?;
        let outcome = match spec {
            ResourceSpec::Password(password) => {
                self.change_password(&mut ldap, username, password.expose())
                    .await
            }
            ResourceSpec::Groups(groups) => match self.require_account(&mut ldap, username).await {
                Ok(()) => self
                    .change_groups(&mut ldap, username, groups, true)
                    .await
                    .map(|added| groups_outcome(added, true)),
                Err(e) => Err(e),
            },
            other => Err(AdapterError::mismatched_spec(BACKEND, "register", other)),
        };
        let _ = ldap.unbind().await;
        outcome
    }

    async fn query(&self, username: &str, query: &Query) -> Result<Detail, AdapterError> {
        let Query::Groups = query else {
            return Err(AdapterError::Unsupported {
                backend: BACKEND,
                capability: query.label(),
            });
        };

        let mut ldap = self.connect().await?;
        let groups = self.member_groups(&mut ldap, username).await;
        let _ = ldap.unbind().await;
        groups.map(Detail::Groups)
    }
}

fn groups_outcome(changed: Vec<String>, added: bool) -> AdapterOutcome {
    match (changed.is_empty(), added) {
        (true, true) => AdapterOutcome::AlreadyExists,
        (true, false) => AdapterOutcome::AlreadyAbsent,
        (false, true) => AdapterOutcome::reversible(
            format!("joined {}", changed.join(", ")),
            Undo::Delete(ResourceSpec::Groups(changed)),
        ),
        (false, false) => AdapterOutcome::reversible(
            format!("left {}", changed.join(", ")),
            Undo::Register(ResourceSpec::Groups(changed)),
        ),
    }
}

fn ldap_error(err: LdapError) -> AdapterError {
    match err {
        LdapError::LdapResult { result } => rejected(result),
        other => AdapterError::unavailable(BACKEND, other.to_string()),
    }
}

fn rejected(result: LdapResult) -> AdapterError {
    AdapterError::Rejected {
        backend: BACKEND,
        status: u16::try_from(result.rc).unwrap_or(u16::MAX),
        message: if result.text.is_empty() {
            format!("result code {}", result.rc)
        } else {
            result.text
        },
    }
}

fn days_since_epoch() -> i64 {
    Utc::now().timestamp() / 86_400
}

fn attr(name: &str, values: &[&str]) -> (String, HashSet<String>) {
    (
        name.to_string(),
        values.iter().map(|v| v.to_string()).collect(),
    )
}

/// Entry attributes for a new posix account
fn account_attributes(username: &str, account: &AccountSpec, last_change_days: i64) -> Attrs {
    let full_name = format!("{} {}", account.first_name, account.last_name);
    let home = format!("/home/{username}");
    let uid_number = account.uid_number.to_string();
    let last_change = last_change_days.to_string();

    vec![
        attr(
            "objectClass",
            &["posixAccount", "shadowAccount", "inetOrgPerson"],
        ),
        attr("givenName", &[&account.first_name]),
        attr("sn", &[&account.last_name]),
        attr("cn", &[&full_name]),
        attr("uid", &[username]),
        attr("mail", &[&account.email]),
        attr("departmentNumber", &[&account.department]),
        attr("o", &[&account.organization]),
        attr("title", &[&account.title]),
        attr("homeDirectory", &[&home]),
        attr("loginShell", &[LOGIN_SHELL]),
        attr("gidNumber", &[GID_NUMBER]),
        attr("uidNumber", &[&uid_number]),
        attr("shadowLastChange", &[&last_change]),
        attr("shadowMin", &[SHADOW_MIN]),
        attr("shadowMax", &[SHADOW_MAX]),
        attr("shadowInactive", &[SHADOW_INACTIVE]),
        attr("shadowWarning", &[SHADOW_WARNING]),
    ]
}
