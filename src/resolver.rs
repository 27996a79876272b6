use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oci_client::manifest::ImageIndexEntry;
use tracing::debug;

use crate::cache::{CacheError, ImageCache, ResolvedImage};
use crate::context::{Cancelled, Context};
use crate::platform::Platform;
use crate::reference::{self, ImageReference};
use crate::registry::auth::Keychain;
use crate::registry::{RegistryClient, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Could not parse image reference `{image}`: {source}")]
    Reference {
        image:  String,
        #[source]
        source: reference::ParseError,
    },
    #[error("Could not fetch `{reference}`: {source}")]
    Registry {
        reference: String,
        #[source]
        source:    RegistryError,
    },
    #[error("The index of `{0}` lists no manifests.")]
    EmptyIndex(String),
    #[error("Could not read the image cache: {0}")]
    CacheRead(#[source] CacheError),
    #[error("Could not cache the details of `{reference}`: {source}")]
    CacheWrite {
        reference: String,
        #[source]
        source:    CacheError,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ResolveError {
    fn registry(reference: &ImageReference) -> impl FnOnce(RegistryError) -> Self + '_ {
        move |source| Self::Registry {
            reference: reference.to_string(),
            source,
        }
    }
}

/// Resolves image references to digests and metadata, going to the registry
/// only when the cache has nothing fresh.
pub struct ImageResolver {
    registry: Arc<dyn RegistryClient>,
    cache:    Option<Arc<ImageCache>>,
}

impl ImageResolver {
    pub(crate) fn new(registry: Arc<dyn RegistryClient>, cache: Option<Arc<ImageCache>>) -> Self {
        Self { registry, cache }
    }

    /// A cached entry younger than `ttl` is returned without any I/O.
    /// Otherwise the reference is fetched, narrowed to `platform` if it is a
    /// multi-architecture index, and written back to the cache. Every
    /// registry round trip is bounded by `ctx`.
    pub(crate) async fn resolve(
        &self, image: &str, ttl: Duration, platform: Option<&Platform>, auth: &Keychain, ctx: &Context,
    ) -> Result<Arc<ResolvedImage>, ResolveError> {
        let reference: ImageReference = image.parse().map_err(|source| ResolveError::Reference {
            image: image.to_owned(),
            source,
        })?;

        let cached = match &self.cache {
            Some(cache) => cache.get(&reference).map_err(ResolveError::CacheRead)?,
            None => None,
        };
        if let Some(entry) = cached.filter(|entry| entry.is_fresh(ttl, Utc::now())) {
            debug!(image = %reference, digest = %entry.image.digest, "Serving image details from cache");
            return Ok(entry.image);
        }

        let descriptor = ctx
            .run(self.registry.fetch_descriptor(&reference, auth))
            .await?
            .map_err(ResolveError::registry(&reference))?;

        let image_descriptor = if descriptor.is_index() {
            let child = select_manifest(self.registry.fetch_index_manifest(&descriptor), platform)
                .ok_or_else(|| ResolveError::EmptyIndex(reference.to_string()))?;
            debug!(image = %reference, child = %child.digest, "Selected manifest from index");

            let child_reference = reference.with_digest(&child.digest);
            ctx.run(self.registry.fetch_descriptor(&child_reference, auth))
                .await?
                .map_err(ResolveError::registry(&child_reference))?
        } else {
            descriptor.clone()
        };

        let data = ctx
            .run(self.registry.fetch_image(&image_descriptor, auth))
            .await?
            .map_err(ResolveError::registry(&image_descriptor.reference))?;

        let resolved = Arc::new(ResolvedImage {
            digest:      descriptor.digest.clone(),
            annotations: descriptor.annotations(),
            labels:      data.labels(),
            size:        data.total_size(),
            created:     data.config.created.unwrap_or(DateTime::UNIX_EPOCH),
        });

        if let Some(cache) = &self.cache {
            ctx.check()?;
            cache
                .put(&reference, Some(Arc::clone(&resolved)))
                .map_err(|source| ResolveError::CacheWrite {
                    reference: reference.to_string(),
                    source,
                })?;
        }
        Ok(resolved)
    }
}

/// The first entry matching `platform` exactly, falling back to the first
/// entry when nothing matches or no platform is wanted. Entries whose
/// platform cannot be read never match.
fn select_manifest<'a>(manifests: &'a [ImageIndexEntry], platform: Option<&Platform>) -> Option<&'a ImageIndexEntry> {
    platform
        .and_then(|wanted| {
            manifests.iter().find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .and_then(|candidate| Platform::try_from(candidate).ok())
                    .is_some_and(|candidate| candidate.matches(wanted))
            })
        })
        .or_else(|| manifests.first())
}
