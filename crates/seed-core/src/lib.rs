//! Seed manifest model, loading, version resolution and image naming.

pub mod error;
pub mod fs;
pub mod image;
pub mod manifest;
pub mod version;

pub use error::{Result, SeedError};
pub use image::ImageReference;
pub use manifest::{load_manifest, LoadedManifest, Manifest};
pub use seed_schemas::Violation;
pub use version::{resolve_versions, VersionBump, VersionBumps};

/// Version of the seed manifest specification this tool understands.
pub const SEED_SPEC_VERSION: &str = "1.0.0";
