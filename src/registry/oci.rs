use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::config::ConfigFile;
use oci_client::errors::OciDistributionError;
use oci_client::manifest::OciManifest;
use oci_client::Client;
use tracing::debug;

use crate::reference::ImageReference;
use crate::registry::auth::{Keychain, RegistryAuth};
use crate::registry::{Descriptor, ImageData, RegistryClient, RegistryError};

/// OCI distribution client. Bearer tokens are cached by the underlying
/// client, so each set of credentials gets a client of its own and a token
/// is only ever replayed for the credentials that obtained it.
pub struct OciClient {
    timeout:  Duration,
    protocol: ClientProtocol,
    clients:  Mutex<HashMap<RegistryAuth, Client>>,
}

impl OciClient {
    /// `insecure_registries` are spoken to over plain HTTP.
    pub(crate) fn new(timeout: Duration, insecure_registries: &[String]) -> Self {
        let protocol = if insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure_registries.to_vec())
        };
        Self {
            timeout,
            protocol,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, auth: &RegistryAuth) -> Client {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients
            .entry(auth.clone())
            .or_insert_with(|| {
                debug!(authenticated = *auth != RegistryAuth::Anonymous, "Creating registry client");
                Client::new(ClientConfig {
                    protocol: self.protocol.clone(),
                    ..ClientConfig::default()
                })
            })
            .clone()
    }

    /// Bounds a registry round trip by the configured timeout.
    async fn timed<T>(
        &self, reference: &ImageReference, request: impl Future<Output = Result<T, OciDistributionError>>,
    ) -> Result<T, RegistryError> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(OciDistributionError::ImageManifestNotFoundError(_))) => Err(RegistryError::NotFound(reference.to_string())),
            Ok(Err(source)) => Err(RegistryError::Distribution {
                reference: reference.to_string(),
                source,
            }),
            Err(_) => Err(RegistryError::Timeout(reference.to_string())),
        }
    }
}

#[async_trait]
impl RegistryClient for OciClient {
    async fn fetch_descriptor(&self, reference: &ImageReference, auth: &Keychain) -> Result<Descriptor, RegistryError> {
        let credentials = auth.resolve(reference.registry());
        let client = self.client(&credentials);
        let (manifest, digest) = self
            .timed(reference, client.pull_manifest(reference.oci(), &credentials.to_oci_auth()))
            .await?;
        debug!(image = %reference, %digest, index = matches!(manifest, OciManifest::ImageIndex(_)), "Fetched manifest");
        Ok(Descriptor {
            reference: reference.clone(),
            digest,
            manifest,
        })
    }

    async fn fetch_image(&self, descriptor: &Descriptor, auth: &Keychain) -> Result<ImageData, RegistryError> {
        let reference = &descriptor.reference;
        let OciManifest::Image(manifest) = &descriptor.manifest else {
            return Err(RegistryError::UnexpectedIndex(reference.to_string()));
        };

        // The token for this repository was stored by the manifest request.
        let client = self.client(&auth.resolve(reference.registry()));
        let mut blob = Vec::new();
        self.timed(reference, client.pull_blob(reference.oci(), &manifest.config, &mut blob))
            .await?;
        let config: ConfigFile = serde_json::from_slice(&blob).map_err(|source| RegistryError::Decode {
            reference: reference.to_string(),
            source,
        })?;

        Ok(ImageData {
            manifest: manifest.clone(),
            config,
        })
    }
}
