//! Image naming convention for seed images.
//!
//! A job `foo` with algorithm version `2.1.0` and package version `1.0.0`
//! is packaged as `foo-2.1.0-seed:1.0.0`: the repository carries the
//! algorithm version, the tag carries the package version.

use crate::manifest::Job;
use serde::{Serialize, Serializer};
use std::fmt;

pub const SEED_REPOSITORY_SUFFIX: &str = "-seed";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    pub fn for_job(job: &Job) -> Self {
        Self::new(
            format!(
                "{}-{}{}",
                job.name, job.algorithm_version, SEED_REPOSITORY_SUFFIX
            ),
            job.package_version.clone(),
        )
    }

    /// Split `repo[:tag]`; a colon inside a registry host (`host:5000/x`)
    /// is not a tag separator. A missing tag means `latest`.
    pub fn parse(reference: &str) -> Self {
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                Self::new(&reference[..split], &reference[split + 1..])
            }
            None => Self::new(reference, "latest"),
        }
    }

    /// The same image under `<registry>/<org>/`.
    pub fn qualified(&self, registry_host: Option<&str>, org: Option<&str>) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(host) = registry_host.filter(|h| !h.is_empty()) {
            parts.push(host);
        }
        if let Some(org) = org.filter(|o| !o.is_empty()) {
            parts.push(org);
        }
        let name = self.short_repository();
        parts.push(name);
        Self::new(parts.join("/"), self.tag.clone())
    }

    /// Repository without any registry host or organisation prefix.
    pub fn short_repository(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    pub fn is_seed(&self) -> bool {
        self.short_repository().ends_with(SEED_REPOSITORY_SUFFIX)
    }
}

impl Serialize for ImageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
