use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Platform is empty.")]
    Empty,
    #[error("Too many components in platform `{0}`, expected os[/arch[/variant]][:osversion].")]
    TooManyComponents(String),
}

/// `Platform` is build with the following components:
/// `(os)/(architecture)/(variant):(os.version)`
///
/// Field names follow the image index JSON, so the platform of an index
/// entry converts into it through its serialized form.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Platform {
    #[serde(default)]
    pub os:           String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant:      Option<String>,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version:   Option<String>,
    #[serde(rename = "os.features", default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    pub os_features:  Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty", skip_serializing_if = "Vec::is_empty")]
    pub features:     Vec<String>,
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.os)?;
        if !self.architecture.is_empty() {
            write!(f, "/{}", self.architecture)?;
        }
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        match &self.os_version {
            Some(os_version) => write!(f, ":{os_version}"),
            None => Ok(()),
        }
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let (components, os_version) = match trimmed.split_once(':') {
            Some((components, os_version)) => (components, Some(os_version.to_owned())),
            None => (trimmed, None),
        };

        let parts: Vec<&str> = components.split('/').collect();
        if parts.len() > 3 {
            return Err(ParseError::TooManyComponents(trimmed.to_owned()));
        }

        Ok(Self {
            os: parts.first().map(|os| (*os).to_owned()).unwrap_or_default(),
            architecture: parts.get(1).map(|arch| (*arch).to_owned()).unwrap_or_default(),
            variant: parts.get(2).map(|variant| (*variant).to_owned()),
            os_version,
            os_features: Vec::new(),
            features: Vec::new(),
        })
    }
}

impl TryFrom<&oci_client::manifest::Platform> for Platform {
    type Error = serde_json::Error;

    fn try_from(platform: &oci_client::manifest::Platform) -> Result<Self, Self::Error> {
        serde_json::to_value(platform).and_then(serde_json::from_value)
    }
}

impl Platform {
    /// Exact comparison of the whole platform tuple. Feature lists are
    /// compared as sets, everything else must be equal.
    pub(crate) fn matches(&self, rhs: &Self) -> bool {
        self.os == rhs.os
            && self.architecture == rhs.architecture
            && self.variant == rhs.variant
            && self.os_version == rhs.os_version
            && same_elements(&self.os_features, &rhs.os_features)
            && same_elements(&self.features, &rhs.features)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn same_elements(lhs: &[String], rhs: &[String]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut lhs = lhs.to_vec();
    let mut rhs = rhs.to_vec();
    lhs.sort();
    rhs.sort();
    lhs == rhs
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use crate::platform::{ParseError, Platform};

    #[test]
    fn parsing() {
        let expected = "linux/arm64/v8";
        let platform: Platform = expected.parse().unwrap();
        assert_eq!(platform.os, "linux");
        assert_eq!(platform.architecture, "arm64");
        assert_eq!(platform.variant, Some("v8".to_owned()));
        assert_eq!(platform.os_version, None);
        assert_eq!(platform.to_string(), expected);

        let expected = "windows/amd64:10.0.17763.1234";
        let platform: Platform = expected.parse().unwrap();
        assert_eq!(platform.os, "windows");
        assert_eq!(platform.architecture, "amd64");
        assert_eq!(platform.variant, None);
        assert_eq!(platform.os_version, Some("10.0.17763.1234".to_owned()));
        assert_eq!(platform.to_string(), expected);

        let platform: Platform = "linux".parse().unwrap();
        assert_eq!(platform.architecture, "");

        assert_eq!("".parse::<Platform>(), Err(ParseError::Empty));
        assert_eq!(
            "linux/arm/v7/extra".parse::<Platform>(),
            Err(ParseError::TooManyComponents("linux/arm/v7/extra".to_owned()))
        );
    }

    #[test]
    fn matching() {
        let amd64: Platform = "linux/amd64".parse().unwrap();
        let arm64: Platform = "linux/arm64".parse().unwrap();
        let arm64_v8: Platform = "linux/arm64/v8".parse().unwrap();
        assert!(amd64.matches(&"linux/amd64".parse().unwrap()));
        assert!(!amd64.matches(&arm64));
        // No prefix or substring matching, the variant has to be equal too.
        assert!(!arm64.matches(&arm64_v8));

        let mut with_features = amd64.clone();
        with_features.features = vec!["sse4".to_owned(), "avx".to_owned()];
        let mut reordered = amd64.clone();
        reordered.features = vec!["avx".to_owned(), "sse4".to_owned()];
        assert!(with_features.matches(&reordered));
        assert!(!with_features.matches(&amd64));
    }

    #[test]
    fn from_index_entry() {
        let entry: oci_client::manifest::Platform = serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "windows",
            "os.version": "10.0.20348.2227",
            "os.features": ["win32k"]
        }))
        .unwrap();
        let platform = Platform::try_from(&entry).unwrap();
        assert_eq!(platform.os_features, vec!["win32k".to_owned()]);
        let mut wanted: Platform = "windows/amd64:10.0.20348.2227".parse().unwrap();
        wanted.os_features = vec!["win32k".to_owned()];
        assert!(platform.matches(&wanted));
    }
}
