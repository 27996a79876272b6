use std::collections::BTreeMap;

use async_trait::async_trait;
use auth::Keychain;
use oci_client::config::ConfigFile;
use oci_client::errors::OciDistributionError;
use oci_client::manifest::{ImageIndexEntry, OciImageManifest, OciManifest};

use crate::reference::ImageReference;

pub mod auth;
pub mod oci;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry request for `{reference}` failed: {source}")]
    Distribution {
        reference: String,
        #[source]
        source:    OciDistributionError,
    },
    #[error("`{0}` was not found in the registry.")]
    NotFound(String),
    #[error("Registry request for `{0}` timed out.")]
    Timeout(String),
    #[error("Could not decode the image config of `{reference}`: {source}")]
    Decode {
        reference: String,
        #[source]
        source:    serde_json::Error,
    },
    #[error("Expected an image manifest for `{0}` but got an index.")]
    UnexpectedIndex(String),
}

/// What a reference points at in the registry: the top-level manifest,
/// which is either a single image or a multi-architecture index.
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub reference: ImageReference,
    pub digest:    String,
    pub manifest:  OciManifest,
}

impl Descriptor {
    pub(crate) const fn is_index(&self) -> bool {
        matches!(self.manifest, OciManifest::ImageIndex(_))
    }

    /// Annotations on the top-level manifest.
    pub(crate) fn annotations(&self) -> BTreeMap<String, String> {
        let annotations = match &self.manifest {
            OciManifest::Image(image) => image.annotations.as_ref(),
            OciManifest::ImageIndex(index) => index.annotations.as_ref(),
        };
        annotations
            .into_iter()
            .flatten()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// The manifest and config of one concrete, single-platform image.
#[derive(Clone, Debug)]
pub struct ImageData {
    pub manifest: OciImageManifest,
    pub config:   ConfigFile,
}

impl ImageData {
    /// The size of the image in the registry: the config blob plus every
    /// layer.
    pub(crate) fn total_size(&self) -> i64 {
        self.manifest
            .layers
            .iter()
            .fold(self.manifest.config.size, |total, layer| total.saturating_add(layer.size))
    }

    pub(crate) fn labels(&self) -> BTreeMap<String, String> {
        self.config
            .config
            .as_ref()
            .and_then(|config| config.labels.as_ref())
            .into_iter()
            .flatten()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// The registry transport.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetches the manifest a reference currently points at.
    async fn fetch_descriptor(&self, reference: &ImageReference, auth: &Keychain) -> Result<Descriptor, RegistryError>;

    /// The children of an index descriptor, in listed order. Empty for
    /// single-platform images.
    fn fetch_index_manifest<'a>(&self, descriptor: &'a Descriptor) -> &'a [ImageIndexEntry] {
        match &descriptor.manifest {
            OciManifest::ImageIndex(index) => &index.manifests,
            OciManifest::Image(_) => &[],
        }
    }

    /// Fetches the config blob of a single-platform descriptor.
    async fn fetch_image(&self, descriptor: &Descriptor, auth: &Keychain) -> Result<ImageData, RegistryError>;
}
