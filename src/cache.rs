use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::reference::ImageReference;

/// The registry facts about a single image digest. Everything but the digest
/// is derived from content-addressed data, so it never changes for a given
/// digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImage {
    pub digest:      String,
    /// Annotations on the image manifest.
    pub annotations: BTreeMap<String, String>,
    /// Labels in the image config.
    pub labels:      BTreeMap<String, String>,
    /// Config blob size plus all layer sizes.
    pub size:        i64,
    /// `created` from the image config, the epoch if the config has none.
    pub created:     DateTime<Utc>,
}

/// A cached image together with the time it was fetched from the registry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub image:      Arc<ResolvedImage>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is fresh while `now < fetched_at + ttl`.
    pub(crate) fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| self.fetched_at.checked_add_signed(ttl))
            .is_none_or(|expires_at| now < expires_at)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("The image cache lock was poisoned.")]
    Poisoned,
}

#[derive(Debug, Default)]
struct Tables {
    /// Canonical reference string -> digest it currently resolves to.
    aliases: HashMap<String, String>,
    /// Digest -> metadata.
    images:  HashMap<String, CacheEntry>,
}

/// Deduplicates registry lookups across every object that references the
/// same image. Both tables sit behind one lock so that a `put` is never
/// observed half-applied. The lock is only held for map operations.
#[derive(Debug, Default)]
pub struct ImageCache {
    tables: Mutex<Tables>,
}

impl ImageCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Digest-form references go straight to the metadata table; the alias
    /// table is only consulted for tags.
    pub(crate) fn get(&self, reference: &ImageReference) -> Result<Option<CacheEntry>, CacheError> {
        let alias_key = reference.digest().is_none().then(|| reference.to_string());

        let tables = self.tables.lock().map_err(|_| CacheError::Poisoned)?;
        let digest = match (reference.digest(), alias_key.as_ref()) {
            (Some(digest), _) => Some(digest),
            (None, Some(key)) => tables.aliases.get(key).map(String::as_str),
            (None, None) => None,
        };
        Ok(digest.and_then(|digest| tables.images.get(digest)).cloned())
    }

    /// Records `reference -> image.digest` and replaces the metadata for that
    /// digest, stamped with the current time. Passing `None` is a no-op.
    pub(crate) fn put(&self, reference: &ImageReference, image: Option<Arc<ResolvedImage>>) -> Result<(), CacheError> {
        let Some(image) = image else {
            return Ok(());
        };
        let alias_key = reference.to_string();
        let entry = CacheEntry {
            image:      Arc::clone(&image),
            fetched_at: Utc::now(),
        };

        let mut tables = self.tables.lock().map_err(|_| CacheError::Poisoned)?;
        tables.aliases.insert(alias_key, image.digest.clone());
        if tables.images.insert(image.digest.clone(), entry).is_none() {
            debug!(digest = %image.digest, cached_digests = tables.images.len(), "Cached new image digest");
        }
        drop(tables);
        Ok(())
    }

    /// Number of distinct digests held.
    pub(crate) fn len(&self) -> Result<usize, CacheError> {
        Ok(self.tables.lock().map_err(|_| CacheError::Poisoned)?.images.len())
    }
}
