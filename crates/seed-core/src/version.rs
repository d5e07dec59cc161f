//! Semantic-version bumps for `packageVersion` and `algorithmVersion`.

use crate::error::{Result, SeedError};
use crate::fs::atomic_write_json_pretty;
use crate::manifest::{LoadedManifest, Manifest};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

pub const PACKAGE_VERSION_FIELD: &str = "packageVersion";
pub const ALGORITHM_VERSION_FIELD: &str = "algorithmVersion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionBump {
    #[default]
    None,
    Minor,
    Major,
}

impl VersionBump {
    /// Major takes precedence when both flags are set for the same field.
    pub fn from_flags(field: &str, minor: bool, major: bool) -> Self {
        match (minor, major) {
            (_, true) => {
                if minor {
                    warn!(field, "both minor and major bumps requested; applying major");
                }
                VersionBump::Major
            }
            (true, false) => VersionBump::Minor,
            (false, false) => VersionBump::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionBumps {
    pub package: VersionBump,
    pub algorithm: VersionBump,
}

impl VersionBumps {
    pub fn any(&self) -> bool {
        self.package != VersionBump::None || self.algorithm != VersionBump::None
    }
}

/// `MAJOR.MINOR.PATCH`, nothing more: pre-release and build suffixes are
/// not bumpable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// `None` when the bumped component would not fit in a `u64`.
    pub fn bump(self, bump: VersionBump) -> Option<Self> {
        match bump {
            VersionBump::None => Some(self),
            VersionBump::Minor => Some(Version {
                major: self.major,
                minor: self.minor.checked_add(1)?,
                patch: 0,
            }),
            VersionBump::Major => Some(Version {
                major: self.major.checked_add(1)?,
                minor: 0,
                patch: 0,
            }),
        }
    }
}

impl FromStr for Version {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(());
        }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(());
            }
            *slot = part.parse().map_err(|_| ())?;
        }
        Ok(Version {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Apply `bump` to a version string. `None` returns the input untouched,
/// whatever its format.
pub fn bump_version(field: &str, current: &str, bump: VersionBump) -> Result<String> {
    if bump == VersionBump::None {
        return Ok(current.to_string());
    }
    let invalid = || SeedError::InvalidVersionFormat {
        field: field.to_string(),
        value: current.to_string(),
    };
    let version: Version = current.parse().map_err(|_| invalid())?;
    let bumped = version.bump(bump).ok_or_else(invalid)?;
    Ok(bumped.to_string())
}

/// Compute the bumped manifest without touching disk.
pub fn apply_bumps(manifest: &Manifest, bumps: VersionBumps) -> Result<Manifest> {
    let package = bump_version(
        PACKAGE_VERSION_FIELD,
        &manifest.job.package_version,
        bumps.package,
    )?;
    let algorithm = bump_version(
        ALGORITHM_VERSION_FIELD,
        &manifest.job.algorithm_version,
        bumps.algorithm,
    )?;
    let mut document = manifest.document().clone();
    if let Some(job) = document.get_mut("job").and_then(Value::as_object_mut) {
        job.insert(PACKAGE_VERSION_FIELD.to_string(), Value::String(package));
        job.insert(ALGORITHM_VERSION_FIELD.to_string(), Value::String(algorithm));
    }
    Ok(Manifest::from_value(document)?)
}

/// Bump the requested fields and write the manifest back to its source
/// file. Nothing is written when no field changes or when either field
/// fails to parse.
pub fn resolve_versions(loaded: &LoadedManifest, bumps: VersionBumps) -> Result<LoadedManifest> {
    if !bumps.any() {
        return Ok(loaded.clone());
    }
    let updated = apply_bumps(&loaded.manifest, bumps)?;
    atomic_write_json_pretty(&loaded.path, updated.document())?;
    info!(
        path = %loaded.path.display(),
        package_version = %updated.job.package_version,
        algorithm_version = %updated.job.algorithm_version,
        "rewrote manifest versions"
    );
    Ok(LoadedManifest {
        manifest: updated,
        path: loaded.path.clone(),
    })
}
