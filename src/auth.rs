//! Capability checks for admin API callers.
//!
//! The registry never decides who may do what; it asks a [`CapabilityCheck`].

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Group that grants every capability
pub const ADMIN_GROUP: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// List nodes and entry points, check node activity
    Read,
    /// Add or update nodes and entry points
    Write,
}

impl Capability {
    /// Group name the external authorization service uses for this capability
    pub fn group(&self) -> &'static str {
        match self {
            Capability::Read => "routekeeper_read",
            Capability::Write => "routekeeper_write",
        }
    }
}

pub trait CapabilityCheck: Send + Sync {
    fn has_capability<'a>(&'a self, token: &'a str, capability: Capability) -> BoxFuture<'a, bool>;
}

/// A single shared bearer token that grants every capability
pub struct StaticTokenCheck {
    token: String,
}

impl StaticTokenCheck {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl CapabilityCheck for StaticTokenCheck {
    fn has_capability<'a>(&'a self, token: &'a str, _capability: Capability) -> BoxFuture<'a, bool> {
        let allowed = !token.is_empty() && token == self.token;
        futures::future::ready(allowed).boxed()
    }
}

#[derive(Debug, Deserialize)]
struct GroupInfo {
    #[serde(default, alias = "Groups")]
    groups: Vec<String>,
}

/// Asks an external authorization service which groups a token belongs to
pub struct RemoteGroupCheck {
    auth_url: String,
    client: reqwest::Client,
}

impl RemoteGroupCheck {
    pub fn new(auth_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            auth_url: auth_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn groups(&self, token: &str) -> anyhow::Result<Vec<String>> {
        let url = format!(
            "{}/getgroupsfromtoken?token={}",
            self.auth_url,
            urlencoding::encode(token)
        );
        let body = self
            .client
            .post(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let info: GroupInfo = toml::from_str(&body)?;
        Ok(info.groups)
    }

    async fn check(&self, token: &str, capability: Capability) -> bool {
        if token.is_empty() {
            return false;
        }
        match self.groups(token).await {
            Ok(groups) => {
                let allowed = holds_capability(&groups, capability);
                debug!(?groups, capability = capability.group(), allowed, "Token groups resolved");
                allowed
            }
            Err(e) => {
                warn!(error = %e, "Authorization lookup failed");
                false
            }
        }
    }
}

impl CapabilityCheck for RemoteGroupCheck {
    fn has_capability<'a>(&'a self, token: &'a str, capability: Capability) -> BoxFuture<'a, bool> {
        self.check(token, capability).boxed()
    }
}

fn holds_capability(groups: &[String], capability: Capability) -> bool {
    groups
        .iter()
        .any(|g| g == ADMIN_GROUP || g == capability.group())
}
