//! Publish flow: resolve versions, probe the registry, decide, push.

use crate::engine::{ImageBuilder, ImagePublisher, MANIFEST_LABEL};
use seed_core::{
    load_manifest, resolve_versions, ImageReference, LoadedManifest, Result, SeedError,
    VersionBumps,
};
use seed_registry::{Credentials, TagLister, TagSet};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishState {
    Unresolved,
    Bumped,
    Probed,
    Published,
    Conflicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Publish,
    Conflict { hint: String },
}

/// Decide whether `candidate` may be pushed given the tags already in the
/// registry. `force` always publishes.
pub fn decide(candidate: &ImageReference, tags: &TagSet, force: bool, bumped: bool) -> Decision {
    if force || !tags.contains(&candidate.tag) {
        return Decision::Publish;
    }
    let hint = if bumped {
        format!(
            "the bumped tag {} is also taken; bump further or pass --force to overwrite",
            candidate.tag
        )
    } else {
        "bump the version with --pkg-minor/--pkg-major (or --alg-minor/--alg-major) \
         or pass --force to overwrite"
            .to_string()
    };
    Decision::Conflict { hint }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub directory: PathBuf,
    /// Local image to push; defaults to the name derived from the manifest.
    pub image: Option<ImageReference>,
    pub org: Option<String>,
    /// Manifest schema replacing the built-in one.
    pub schema: Option<PathBuf>,
    pub force: bool,
    pub bumps: VersionBumps,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub state: PublishState,
    pub local: ImageReference,
    pub remote: ImageReference,
    pub registry: String,
    pub manifest: PathBuf,
    pub rebuilt: bool,
    /// `None` when the probe was skipped.
    pub existing_tags: Option<usize>,
}

/// Labels attached to every seed image build.
pub fn build_labels(loaded: &LoadedManifest) -> Result<Vec<(String, String)>> {
    let compact = serde_json::to_string(loaded.manifest.document())?;
    Ok(vec![(MANIFEST_LABEL.to_string(), compact)])
}

fn build_context(loaded: &LoadedManifest) -> &Path {
    loaded.path.parent().unwrap_or_else(|| Path::new("."))
}

/// Runs the whole publish decision. Errors end the flow where they occur;
/// nothing is retried and a failed probe never counts as "no conflict".
pub fn publish(
    options: &PublishOptions,
    registry: &dyn TagLister,
    builder: &dyn ImageBuilder,
    publisher: &dyn ImagePublisher,
) -> Result<PublishOutcome> {
    let mut state = PublishState::Unresolved;
    let loaded = load_manifest(&options.directory, options.schema.as_deref())?;
    let bumped = options.bumps.any();
    debug!(?state, manifest = %loaded.path.display(), bumped, "starting publish");

    let (loaded, local, rebuilt) = if bumped {
        let updated = resolve_versions(&loaded, options.bumps)?;
        let image = updated.manifest.image();
        builder.build_image(build_context(&updated), &image, &build_labels(&updated)?)?;
        state = PublishState::Bumped;
        debug!(?state, image = %image, "rebuilt bumped image");
        (updated, image, true)
    } else {
        let image = options
            .image
            .clone()
            .unwrap_or_else(|| loaded.manifest.image());
        (loaded, image, false)
    };

    let registry_host = registry.registry().to_string();
    let remote = local.qualified(Some(&registry_host), options.org.as_deref());
    let repository = local
        .qualified(None, options.org.as_deref())
        .repository;

    let existing_tags = if options.force {
        info!(image = %remote, "force set; skipping registry probe");
        None
    } else {
        let tags = registry.list_tags(&repository)?;
        state = PublishState::Probed;
        debug!(?state, repository = %repository, tags = tags.len(), "probed registry");
        match decide(&remote, &tags, false, bumped) {
            Decision::Publish => {}
            Decision::Conflict { hint } => {
                debug!(state = ?PublishState::Conflicted, image = %remote, "publish conflict");
                return Err(SeedError::PublishConflict {
                    reference: remote.to_string(),
                    registry: registry_host,
                    hint,
                });
            }
        }
        Some(tags.len())
    };

    publisher.publish_image(&local, &remote, &registry_host, options.credentials.as_ref())?;
    state = PublishState::Published;
    info!(image = %remote, "published image");
    Ok(PublishOutcome {
        state,
        local,
        remote,
        registry: registry_host,
        manifest: loaded.path,
        rebuilt,
        existing_tags,
    })
}
