use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::{ClusterError, ObjectKey, ObjectStore, SECRET, SERVICE_ACCOUNT};
use crate::registry::auth::{Keychain, KeychainError};

const DEFAULT_SERVICE_ACCOUNT: &str = "default";
const DOCKER_CONFIG_JSON: (&str, &str) = ("kubernetes.io/dockerconfigjson", ".dockerconfigjson");
const DOCKER_CFG: (&str, &str) = ("kubernetes.io/dockercfg", ".dockercfg");

#[derive(Debug, thiserror::Error)]
pub enum ResolveKeychainError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("Pull secret `{secret}` is invalid: {source}")]
    Secret {
        secret: String,
        #[source]
        source: KeychainError,
    },
}

/// Everything that determines which registry credentials an object may use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthScope {
    pub namespace:          String,
    pub service_account:    Option<String>,
    pub image_pull_secrets: Vec<String>,
}

/// Turns an [`AuthScope`] into registry credentials.
#[async_trait]
pub trait KeychainResolver: Send + Sync {
    async fn resolve(&self, scope: &AuthScope) -> Result<Keychain, ResolveKeychainError>;
}

/// Location of the exporter's own docker config: `$DOCKER_CONFIG/config.json`,
/// else `$HOME/.docker/config.json`.
pub(crate) fn docker_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// Resolves credentials from pull secrets stored in the cluster: the ones
/// named by the object plus those attached to its service account. Entries
/// of `fallback` come last, so they only apply to registries no pull secret
/// covers.
pub struct ClusterKeychain {
    store:    Arc<dyn ObjectStore>,
    fallback: Keychain,
}

impl ClusterKeychain {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, fallback: Keychain) -> Self {
        Self { store, fallback }
    }

    async fn service_account_secrets(&self, namespace: &str, service_account: &str) -> Result<Vec<String>, ClusterError> {
        let key = ObjectKey::new(namespace, service_account);
        let Some(account) = self.store.get(&SERVICE_ACCOUNT, &key).await? else {
            warn!("Service account {key} not found, using only the object's pull secrets");
            return Ok(Vec::new());
        };
        Ok(account
            .get("imagePullSecrets")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|secret| secret.get("name").and_then(Value::as_str))
            .map(str::to_owned)
            .collect())
    }

    async fn secret_keychain(&self, namespace: &str, name: &str) -> Result<Option<Keychain>, ResolveKeychainError> {
        let key = ObjectKey::new(namespace, name);
        let Some(secret) = self.store.get(&SECRET, &key).await? else {
            warn!("Pull secret {key} not found, skipping it");
            return Ok(None);
        };

        let invalid = |source: KeychainError| ResolveKeychainError::Secret {
            secret: key.to_string(),
            source,
        };
        // Data values are base64 in the API and decoded by the typed secret.
        let secret: Secret = serde_json::from_value(secret).map_err(|e| invalid(e.into()))?;
        let secret_type = secret.type_.as_deref().unwrap_or_default();
        let (data_key, legacy) = match secret_type {
            t if t == DOCKER_CONFIG_JSON.0 => (DOCKER_CONFIG_JSON.1, false),
            t if t == DOCKER_CFG.0 => (DOCKER_CFG.1, true),
            other => {
                debug!("Secret {key} has type `{other}`, not a pull secret");
                return Ok(None);
            }
        };
        let Some(content) = secret.data.as_ref().and_then(|data| data.get(data_key)) else {
            warn!("Pull secret {key} has no `{data_key}` entry");
            return Ok(None);
        };

        Keychain::from_docker_config(&content.0, legacy).map(Some).map_err(invalid)
    }
}

#[async_trait]
impl KeychainResolver for ClusterKeychain {
    async fn resolve(&self, scope: &AuthScope) -> Result<Keychain, ResolveKeychainError> {
        let service_account = scope.service_account.as_deref().unwrap_or(DEFAULT_SERVICE_ACCOUNT);
        let mut secrets = scope.image_pull_secrets.clone();
        secrets.extend(self.service_account_secrets(&scope.namespace, service_account).await?);

        let mut keychain = Keychain::anonymous();
        for secret in &secrets {
            if let Some(entries) = self.secret_keychain(&scope.namespace, secret).await? {
                keychain.extend(entries);
            }
        }
        if !keychain.is_empty() {
            debug!("Using {} pull secret(s) in {}", secrets.len(), scope.namespace);
        }
        keychain.extend(self.fallback.clone());
        Ok(keychain)
    }
}
