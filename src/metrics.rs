use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{ImageCache, ResolvedImage};
use crate::cluster::{ClusterError, ObjectKey, ObjectStore, WatchedResourceKind};
use crate::extract::container_specs;
use crate::reference::ImageReference;

/// Prefix of every metric family name, so `container_info` is exposed as
/// `container_image_container_info`.
const NAMESPACE: &str = "container_image";

/// Static description of one metric family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Desc {
    pub name:   &'static str,
    pub help:   &'static str,
    pub labels: &'static [&'static str],
}

pub const CONTAINER_INFO: Desc = Desc {
    name:   "container_info",
    help:   "Information about containers running in the cluster, including the image digest resolved by the exporter.",
    labels: &["group", "version", "kind", "namespace", "name", "jsonpath", "image", "digest"],
};
pub const ANNOTATION: Desc = Desc {
    name:   "annotation",
    help:   "Annotations from the image manifest.",
    labels: &["digest", "key", "value"],
};
pub const LABEL: Desc = Desc {
    name:   "label",
    help:   "Labels from the image config.",
    labels: &["digest", "key", "value"],
};
pub const SIZE: Desc = Desc {
    name:   "size_bytes",
    help:   "The size of the image in the registry.",
    labels: &["digest"],
};
pub const CREATED: Desc = Desc {
    name:   "created",
    help:   "The created date from the image config. Expressed as a Unix Epoch Time.",
    labels: &["digest"],
};

/// One gauge sample; label values line up with the family's label names.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub values: Vec<String>,
    pub value:  f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    pub desc:    Desc,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    const fn new(desc: Desc) -> Self {
        Self {
            desc,
            samples: Vec::new(),
        }
    }

    fn push(&mut self, values: Vec<String>, value: f64) {
        debug_assert_eq!(values.len(), self.desc.labels.len());
        self.samples.push(Sample { values, value });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("Could not list {kind}: {source}")]
    List {
        kind:   &'static str,
        #[source]
        source: ClusterError,
    },
}

/// Builds the metrics from live objects and whatever the cache already
/// knows. Never talks to a registry.
pub struct Collector {
    store: Arc<dyn ObjectStore>,
    cache: Arc<ImageCache>,
    kinds: &'static [WatchedResourceKind],
}

struct Families {
    info:        MetricFamily,
    annotations: MetricFamily,
    labels:      MetricFamily,
    sizes:       MetricFamily,
    created:     MetricFamily,
}

impl Families {
    fn add_image(&mut self, image: &ResolvedImage) {
        let digest = &image.digest;
        #[allow(clippy::cast_precision_loss)]
        self.sizes.push(vec![digest.clone()], image.size as f64);
        #[allow(clippy::cast_precision_loss)]
        self.created.push(vec![digest.clone()], image.created.timestamp() as f64);
        for (key, value) in &image.annotations {
            self.annotations.push(vec![digest.clone(), key.clone(), value.clone()], 1.0);
        }
        for (key, value) in &image.labels {
            self.labels.push(vec![digest.clone(), key.clone(), value.clone()], 1.0);
        }
    }
}

impl Collector {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, cache: Arc<ImageCache>, kinds: &'static [WatchedResourceKind]) -> Self {
        Self { store, cache, kinds }
    }

    /// A miss, a cache failure or an unparsable reference all mean no
    /// details for this container.
    fn cached(&self, image: &str) -> Option<Arc<ResolvedImage>> {
        let reference: ImageReference = image.parse().ok()?;
        match self.cache.get(&reference) {
            Ok(entry) => entry.map(|entry| entry.image),
            Err(e) => {
                warn!("Could not read {reference} from the cache: {e}");
                None
            }
        }
    }

    /// One pass over every watched kind. Per-digest families are emitted
    /// once per digest, no matter how many containers use it. A failed list
    /// fails the whole pass.
    pub(crate) async fn collect(&self) -> Result<Vec<MetricFamily>, CollectError> {
        let mut families = Families {
            info:        MetricFamily::new(CONTAINER_INFO),
            annotations: MetricFamily::new(ANNOTATION),
            labels:      MetricFamily::new(LABEL),
            sizes:       MetricFamily::new(SIZE),
            created:     MetricFamily::new(CREATED),
        };
        let mut seen_digests = HashSet::new();

        for kind in self.kinds {
            let gvk = kind.gvk();
            let objects = self
                .store
                .list(&kind.resource)
                .await
                .map_err(|source| CollectError::List {
                    kind: kind.resource.plural,
                    source,
                })?;

            for object in &objects {
                let key = ObjectKey::of(object).unwrap_or_default();
                for container in container_specs(object, kind.extraction_paths) {
                    let image = self.cached(&container.image);
                    let digest = image.as_ref().map(|image| image.digest.clone()).unwrap_or_default();
                    families.info.push(
                        vec![
                            gvk.group.to_owned(),
                            gvk.version.to_owned(),
                            gvk.kind.to_owned(),
                            key.namespace.clone(),
                            key.name.clone(),
                            container.locator,
                            container.image,
                            digest,
                        ],
                        1.0,
                    );

                    let Some(image) = image else {
                        continue;
                    };
                    if seen_digests.insert(image.digest.clone()) {
                        families.add_image(&image);
                    }
                }
            }
        }

        debug!(
            containers = families.info.samples.len(),
            digests = seen_digests.len(),
            "Collected container image metrics"
        );
        Ok(vec![families.info, families.annotations, families.labels, families.sizes, families.created])
    }
}

/// Renders families in the Prometheus text exposition format (0.0.4).
pub(crate) fn render(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        let name = format!("{NAMESPACE}_{}", family.desc.name);
        let _ = writeln!(out, "# HELP {name} {}", escape_help(family.desc.help));
        let _ = writeln!(out, "# TYPE {name} gauge");
        for sample in &family.samples {
            out.push_str(&name);
            if !sample.values.is_empty() {
                out.push('{');
                for (i, (label, value)) in family.desc.labels.iter().zip(&sample.values).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{label}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", sample.value);
        }
    }
    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', r"\\").replace('\n', r"\n")
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', "\\\"").replace('\n', r"\n")
}
