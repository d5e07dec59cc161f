//! Read-only registry access: tag listing for publish deconfliction and
//! repository listing for search.
//!
//! Every call goes to the registry; nothing is cached, because a stale tag
//! list would make a publish decision unsound.

mod http;

pub use http::{parse_challenge, registry_endpoint, Challenge, HttpRegistry, RegistryEndpoint};

use seed_core::Result;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Credentials only exist when a username was given; a missing password
    /// is treated as empty.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        let username = username.filter(|u| !u.is_empty())?;
        Some(Self {
            username,
            password: password.unwrap_or_default(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub registry: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Tags a registry reports for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        TagSet(iter.into_iter().map(Into::into).collect())
    }
}

pub trait TagLister {
    /// Host shown in diagnostics and used to qualify pushed images.
    fn registry(&self) -> &str;

    /// Existing tags of `repository`. An unknown repository is an empty set,
    /// not an error.
    fn list_tags(&self, repository: &str) -> Result<TagSet>;
}

pub trait RepositoryCatalog {
    fn list_repositories(&self) -> Result<Vec<String>>;
}
