use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub use oci_client::ParseError;
use oci_client::Reference;

/// Registry name image references use for Docker Hub.
pub const DOCKER_HUB: &str = "docker.io";
/// Other spellings of Docker Hub that may appear in references and docker
/// config files.
pub const DOCKER_HUB_ALIASES: [&str; 2] = ["index.docker.io", "registry-1.docker.io"];
const DEFAULT_TAG: &str = "latest";

/// An image reference with a canonical string form, so that equivalent
/// spellings (e.g. `nginx` and `docker.io/library/nginx:latest`) share a
/// cache key.
#[derive(Clone, Debug)]
pub struct ImageReference {
    reference: Reference,
}

impl ImageReference {
    pub(crate) const fn oci(&self) -> &Reference {
        &self.reference
    }

    pub(crate) fn registry(&self) -> &str {
        let registry = self.reference.registry();
        if DOCKER_HUB_ALIASES.contains(&registry) { DOCKER_HUB } else { registry }
    }

    pub(crate) fn repository(&self) -> &str {
        self.reference.repository()
    }

    /// Returns the digest for digest-form references.
    pub(crate) fn digest(&self) -> Option<&str> {
        self.reference.digest()
    }

    /// Returns a reference to the same repository, pinned to `digest`.
    pub(crate) fn with_digest(&self, digest: &str) -> Self {
        Self {
            reference: Reference::with_digest(
                self.reference.registry().to_owned(),
                self.reference.repository().to_owned(),
                digest.to_owned(),
            ),
        }
    }
}

/// `registry/repository@digest` for digest-form references, where any tag is
/// dropped, `registry/repository:tag` otherwise.
impl Display for ImageReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry(), self.repository())?;
        match self.digest() {
            Some(digest) => write!(f, "@{digest}"),
            None => write!(f, ":{}", self.reference.tag().unwrap_or(DEFAULT_TAG)),
        }
    }
}

impl FromStr for ImageReference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            reference: s.trim().parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use crate::reference::ImageReference;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn canonical(s: &str) -> String {
        s.parse::<ImageReference>().unwrap().to_string()
    }

    #[test]
    fn dockerhub_defaults() {
        let reference: ImageReference = "nginx".parse().unwrap();
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/nginx");
        assert_eq!(reference.to_string(), "docker.io/library/nginx:latest");

        assert_eq!(canonical("docker.io/guacamole/guacamole:1.3.0"), "docker.io/guacamole/guacamole:1.3.0");
        assert_eq!(canonical("nginx:1.26.1-alpine3.19"), canonical("docker.io/library/nginx:1.26.1-alpine3.19"));
    }

    #[test]
    fn explicit_registry() {
        let reference: ImageReference = "mcr.microsoft.com/dotnet/aspnet:9.0.0".parse().unwrap();
        assert_eq!(reference.registry(), "mcr.microsoft.com");
        assert_eq!(reference.repository(), "dotnet/aspnet");

        let reference: ImageReference = "localhost:5000/team/app".parse().unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.to_string(), "localhost:5000/team/app:latest");
    }

    #[test]
    fn digest_form() {
        let reference: ImageReference = format!("ghcr.io/org/app:v1@{DIGEST}").parse().unwrap();
        assert_eq!(reference.digest(), Some(DIGEST));
        assert_eq!(reference.to_string(), format!("ghcr.io/org/app@{DIGEST}"));

        let tagged: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        assert_eq!(tagged.digest(), None);
        assert_eq!(tagged.with_digest(DIGEST).to_string(), reference.to_string());
    }

    #[test]
    fn invalid() {
        assert!("".parse::<ImageReference>().is_err());
        assert!("Not A Reference".parse::<ImageReference>().is_err());
        assert!("Nginx:latest".parse::<ImageReference>().is_err());
        assert!("nginx@sha256:abc".parse::<ImageReference>().is_err());
    }
}
