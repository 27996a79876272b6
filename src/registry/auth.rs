use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::reference::{DOCKER_HUB, DOCKER_HUB_ALIASES};

#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Could not decode docker config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not decode base64 credentials: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Credentials for `{0}` are not of the form user:password.")]
    MalformedAuth(String),
    #[error("Could not read `{path}`: {source}")]
    Io {
        path:   String,
        #[source]
        source: std::io::Error,
    },
}

/// Credentials for one registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
}

impl RegistryAuth {
    pub(crate) fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub(crate) fn to_oci_auth(&self) -> oci_client::secrets::RegistryAuth {
        match self {
            Self::Anonymous => oci_client::secrets::RegistryAuth::Anonymous,
            Self::Basic { username, password } => oci_client::secrets::RegistryAuth::Basic(username.clone(), password.clone()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerConfigEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigEntry {
    username: Option<String>,
    password: Option<String>,
    auth:     Option<String>,
}

/// Ordered registry credentials. The first entry matching a registry wins,
/// registries without an entry are accessed anonymously.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keychain {
    entries: Vec<(String, RegistryAuth)>,
}

impl Keychain {
    pub(crate) fn anonymous() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, server: &str, auth: RegistryAuth) {
        self.entries.push((normalize_registry(server), auth));
    }

    pub(crate) fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn resolve(&self, registry: &str) -> RegistryAuth {
        let registry = normalize_registry(registry);
        self.entries
            .iter()
            .find(|(server, _)| *server == registry)
            .map(|(_, auth)| auth.clone())
            .unwrap_or_default()
    }

    /// Parses a `.dockerconfigjson` (`{"auths": {...}}`) or a legacy
    /// `.dockercfg` (the `auths` map at the top level) document.
    pub(crate) fn from_docker_config(content: &[u8], legacy: bool) -> Result<Self, KeychainError> {
        let auths = if legacy {
            serde_json::from_slice::<BTreeMap<String, DockerConfigEntry>>(content)?
        } else {
            serde_json::from_slice::<DockerConfig>(content)?.auths
        };

        let mut keychain = Self::default();
        for (server, entry) in auths {
            let auth = match (entry.username, entry.password, entry.auth) {
                (Some(username), Some(password), _) if !username.is_empty() => RegistryAuth::basic(username, password),
                (_, _, Some(encoded)) if !encoded.is_empty() => {
                    let decoded = String::from_utf8_lossy(&STANDARD.decode(encoded.trim())?).into_owned();
                    let (username, password) = decoded.split_once(':').ok_or_else(|| KeychainError::MalformedAuth(server.clone()))?;
                    RegistryAuth::basic(username, password)
                }
                _ => continue,
            };
            keychain.insert(&server, auth);
        }
        Ok(keychain)
    }

    /// Reads a docker `config.json`. A missing file is an empty keychain.
    pub(crate) fn from_docker_config_file(path: &Path) -> Result<Self, KeychainError> {
        match std::fs::read(path) {
            Ok(content) => Self::from_docker_config(&content, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(KeychainError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

/// Reduces `https://index.docker.io/v1/`, `docker.io` and friends to the
/// bare registry host used by image references.
fn normalize_registry(server: &str) -> String {
    let without_scheme = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme).to_ascii_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) { DOCKER_HUB.to_owned() } else { host }
}
