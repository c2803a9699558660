//! Mailing list adapter (Mailman 2.1 admin interface)
//!
//! Membership is read from the admin roster page, filtered by the first letter
//! of the address. Subscribing and unsubscribing go through the bulk member
//! forms with every notification turned off.
//!
//! A change returns the exact list/address pairs it touched as its undo. If a
//! batch fails part way, the pairs already changed are reverted before the
//! error is returned.
use super::http::{build_client, check_status, join_url, transport_error};
use super::{
    AdapterError, AdapterOutcome, Backend, Detail, Membership, Query, ResourceSpec,
    ServiceAdapter, Undo,
};
use crate::config::MailmanSettings;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const BACKEND: Backend = Backend::MailingList;

/// Roster matcher for one address, compiled once per batch
///
/// Word boundaries keep `al@x.org` from matching `val@x.org`.
#[derive(Debug, Clone)]
pub struct AddressMatcher {
    address: String,
    pattern: Regex,
}

impl AddressMatcher {
    pub fn new(address: &str) -> Result<Self, AdapterError> {
        let address = address.to_lowercase();
        let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(&address)))
            .map_err(|e| AdapterError::protocol(BACKEND, e.to_string()))?;
        Ok(Self { address, pattern })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Roster filter Mailman pages by
    fn letter(&self) -> String {
        self.address.chars().take(1).collect()
    }

    /// `roster` must already be lowercase
    pub fn matches(&self, roster: &str) -> bool {
        self.pattern.is_match(roster)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Subscribe,
    Unsubscribe,
}

impl Direction {
    fn reverse(self) -> Self {
        match self {
            Direction::Subscribe => Direction::Unsubscribe,
            Direction::Unsubscribe => Direction::Subscribe,
        }
    }
}

pub struct MailingListAdapter {
    client: Client,
    settings: MailmanSettings,
}

impl MailingListAdapter {
    pub fn new(settings: MailmanSettings, timeout: Duration) -> Result<Self, AdapterError> {
        let client = build_client(timeout, true).map_err(|e| transport_error(BACKEND, e))?;
        Ok(Self { client, settings })
    }

    fn members_url(&self, list: &str, action: Option<&str>) -> String {
        let mut parts = vec!["mailman", "admin", list, "members"];
        if let Some(action) = action {
            parts.push(action);
        }
        join_url(&self.settings.url, &parts)
    }

    async fn is_member(&self, list: &str, matcher: &AddressMatcher) -> Result<bool, AdapterError> {
        let letter = matcher.letter();
        let resp = self
            .client
            .get(self.members_url(list, None))
            .query(&[
                ("adminpw", self.settings.password.as_str()),
                ("letter", letter.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        let html = check_status(BACKEND, resp)
            .await?
            .text()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;

        Ok(matcher.matches(&html.to_lowercase()))
    }

    async fn subscribe(&self, list: &str, email: &str) -> Result<(), AdapterError> {
        let resp = self
            .client
            .post(self.members_url(list, Some("add")))
            .query(&[
                ("subscribe_or_invite", "0"),
                ("send_welcome_msg_to_this_batch", "0"),
                ("subscribees_upload", email),
                ("adminpw", self.settings.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        check_status(BACKEND, resp).await?;
        debug!(list = %list, email = %email, "Subscribed address");
        Ok(())
    }

    async fn unsubscribe(&self, list: &str, email: &str) -> Result<(), AdapterError> {
        let resp = self
            .client
            .post(self.members_url(list, Some("remove")))
            .query(&[
                ("send_unsub_ack_to_this_batch", "0"),
                ("send_unsub_notifications_to_list_owner", "0"),
                ("unsubscribees_upload", email),
                ("adminpw", self.settings.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, e))?;
        check_status(BACKEND, resp).await?;
        debug!(list = %list, email = %email, "Unsubscribed address");
        Ok(())
    }

    async fn toggle(&self, direction: Direction, list: &str, email: &str) -> Result<(), AdapterError> {
        match direction {
            Direction::Subscribe => self.subscribe(list, email).await,
            Direction::Unsubscribe => self.unsubscribe(list, email).await,
        }
    }

    /// Bring every pair to `direction`, returning the pairs actually changed
    async fn apply(
        &self,
        direction: Direction,
        pairs: &[Membership],
    ) -> Result<Vec<Membership>, AdapterError> {
        let mut changed = Vec::new();
        for (matcher, lists) in group_by_address(pairs)? {
            for list in lists {
                match self.change_one(direction, &list, &matcher).await {
                    Ok(true) => changed.push(Membership::new(list, matcher.address())),
                    Ok(false) => {}
                    Err(cause) => return Err(self.unwind(direction, &changed, cause).await),
                }
            }
        }
        Ok(changed)
    }

    async fn change_one(
        &self,
        direction: Direction,
        list: &str,
        matcher: &AddressMatcher,
    ) -> Result<bool, AdapterError> {
        let member = self.is_member(list, matcher).await?;
        if member == (direction == Direction::Subscribe) {
            return Ok(false);
        }
        self.toggle(direction, list, matcher.address()).await?;
        Ok(true)
    }

    /// Revert `changed` after `cause`; the error to hand back
    async fn unwind(
        &self,
        direction: Direction,
        changed: &[Membership],
        cause: AdapterError,
    ) -> AdapterError {
        for pair in changed.iter().rev() {
            if let Err(cleanup) = self
                .toggle(direction.reverse(), &pair.list, &pair.address)
                .await
            {
                warn!(
                    list = %pair.list,
                    email = %pair.address,
                    error = %cleanup,
                    "Could not revert mailing list change"
                );
                return AdapterError::partial(BACKEND, &cause, &cleanup);
            }
        }
        if !changed.is_empty() {
            info!(reverted = changed.len(), "Reverted mailing list changes after failure");
        }
        cause
    }
}

/// One matcher per distinct address, with its lists in request order
fn group_by_address(pairs: &[Membership]) -> Result<Vec<(AddressMatcher, Vec<String>)>, AdapterError> {
    let mut groups: Vec<(AddressMatcher, Vec<String>)> = Vec::new();
    for pair in pairs {
        let address = pair.address.to_lowercase();
        match groups.iter_mut().find(|(m, _)| m.address() == address) {
            Some((_, lists)) => {
                if !lists.contains(&pair.list) {
                    lists.push(pair.list.clone());
                }
            }
            None => groups.push((AddressMatcher::new(&address)?, vec![pair.list.clone()])),
        }
    }
    Ok(groups)
}

fn memberships(spec: &ResourceSpec, capability: &'static str) -> Result<Vec<Membership>, AdapterError> {
    spec.memberships()
        .ok_or_else(|| AdapterError::mismatched_spec(BACKEND, capability, spec))
}

#[async_trait]
impl ServiceAdapter for MailingListAdapter {
    fn backend(&self) -> Backend {
        BACKEND
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
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let pairs = memberships(spec, "delete")?;
        let removed = self.apply(Direction::Unsubscribe, &pairs).await?;
        if removed.is_empty() {
            return Ok(AdapterOutcome::AlreadyAbsent);
        }

        info!(username = %username, subscriptions = removed.len(), "Removed mailing list subscriptions");
        Ok(AdapterOutcome::reversible(
            format!("removed {} subscriptions", removed.len()),
            Undo::Register(ResourceSpec::Memberships(removed)),
        ))
    }

    async fn register(
        &self,
        username: &str,
        spec: &ResourceSpec,
    ) -> Result<AdapterOutcome, AdapterError> {
        let pairs = memberships(spec, "register")?;
        let added = self.apply(Direction::Subscribe, &pairs).await?;
        if added.is_empty() {
            return Ok(AdapterOutcome::AlreadyExists);
        }

        info!(username = %username, subscriptions = added.len(), "Added mailing list subscriptions");
        Ok(AdapterOutcome::reversible(
            format!("added {} subscriptions", added.len()),
            Undo::Delete(ResourceSpec::Memberships(added)),
        ))
    }

    async fn query(&self, _subject: &str, query: &Query) -> Result<Detail, AdapterError> {
        match query {
            Query::Membership { list, address } => {
                let matcher = AddressMatcher::new(address)?;
                Ok(Detail::Member(self.is_member(list, &matcher).await?))
            }
            other => Err(AdapterError::Unsupported {
                backend: BACKEND,
                capability: other.label(),
            }),
        }
    }
}
