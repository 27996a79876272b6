use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{Instrument, debug, info, info_span};

use crate::cluster::{ClusterError, ObjectKey, ObjectStore, WatchedResourceKind};
use crate::config::ExporterConfig;
use crate::context::{Cancelled, Context};
use crate::extract::{container_specs, image_pull_secrets, service_account_name};
use crate::keychain::{AuthScope, KeychainResolver, ResolveKeychainError};
use crate::resolver::{ImageResolver, ResolveError};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Could not get the object: {0}")]
    Cluster(#[from] ClusterError),
    #[error("Could not build the registry keychain: {0}")]
    Keychain(#[from] ResolveKeychainError),
    #[error("Could not resolve image `{image}` of container `{container}`: {source}")]
    Image {
        container: String,
        image:     String,
        #[source]
        source:    ResolveError,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ReconcileError {
    /// True when the attempt stopped because the exporter is shutting down.
    /// An exceeded attempt deadline is an ordinary failure.
    pub(crate) const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(Cancelled::Cancelled)
                | Self::Image {
                    source: ResolveError::Cancelled(Cancelled::Cancelled),
                    ..
                }
        )
    }
}

/// How an attempt ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every image resolved. `None` means no periodic re-check.
    Scheduled(Option<Duration>),
    /// The object no longer exists.
    Ignored,
}

/// Resolves the images of one watched kind's objects, filling the cache the
/// metrics are read from.
pub struct Reconciler {
    kind:      &'static WatchedResourceKind,
    store:     Arc<dyn ObjectStore>,
    keychains: Arc<dyn KeychainResolver>,
    resolver:  Arc<ImageResolver>,
    config:    Arc<ExporterConfig>,
}

impl Reconciler {
    pub(crate) fn new(
        kind: &'static WatchedResourceKind, store: Arc<dyn ObjectStore>, keychains: Arc<dyn KeychainResolver>, resolver: Arc<ImageResolver>,
        config: Arc<ExporterConfig>,
    ) -> Self {
        Self {
            kind,
            store,
            keychains,
            resolver,
            config,
        }
    }

    pub(crate) const fn kind(&self) -> &'static WatchedResourceKind {
        self.kind
    }

    /// One attempt for one object. All containers must resolve for the
    /// attempt to succeed; the first failure aborts it.
    pub(crate) async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<ReconcileOutcome, ReconcileError> {
        let gvk = self.kind.gvk();
        let span = info_span!(
            "reconcile",
            group = gvk.group,
            version = gvk.version,
            kind = gvk.kind,
            namespace = %key.namespace,
            name = %key.name
        );
        self.reconcile_object(key, ctx).instrument(span).await
    }

    async fn reconcile_object(&self, key: &ObjectKey, ctx: &Context) -> Result<ReconcileOutcome, ReconcileError> {
        info!("Reconciling");
        let Some(object) = ctx.run(self.store.get(&self.kind.resource, key)).await?? else {
            debug!("Object is gone, nothing to do");
            return Ok(ReconcileOutcome::Ignored);
        };

        let scope = AuthScope {
            namespace:          key.namespace.clone(),
            service_account:    service_account_name(&object),
            image_pull_secrets: image_pull_secrets(&object),
        };
        let keychain = ctx.run(self.keychains.resolve(&scope)).await??;

        for container in container_specs(&object, self.kind.extraction_paths) {
            info!(image = %container.image, "Fetching image metadata");
            let image = self
                .resolver
                .resolve(
                    &container.image,
                    self.config.cache_duration,
                    self.config.platform.as_ref(),
                    &keychain,
                    ctx,
                )
                .await
                .map_err(|source| ReconcileError::Image {
                    container: container.name.clone(),
                    image: container.image.clone(),
                    source,
                })?;
            info!(image = %container.image, digest = %image.digest, "Fetched image metadata");
        }

        // Tags are mutable, so the object is checked again once the cache
        // entries it produced have expired.
        let requeue_after = add_jitter(self.config.cache_duration);
        info!(requeue_after = ?requeue_after, "Reconciled");
        Ok(ReconcileOutcome::Scheduled((!requeue_after.is_zero()).then_some(requeue_after)))
    }
}

/// Extends `duration` by a uniform random amount in `[0, duration / 6)` so
/// that objects reconciled together do not all hit the registry together
/// again.
pub(crate) fn add_jitter(duration: Duration) -> Duration {
    let max_jitter = duration / 6;
    if max_jitter.is_zero() {
        return duration;
    }
    duration + rand::rng().random_range(Duration::ZERO..max_jitter)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::cache::ImageCache;
    use crate::cache::tests::{DIGEST_A, DIGEST_B};
    use crate::cluster::tests::FakeStore;
    use crate::cluster::{ObjectKey, ObjectStore, WATCHED_KINDS};
    use crate::config::ExporterConfig;
    use crate::context::{Cancelled, Context};
    use crate::keychain::ClusterKeychain;
    use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler, add_jitter};
    use crate::reference::ImageReference;
    use crate::registry::RegistryClient;
    use crate::registry::auth::Keychain;
    use crate::resolver::ImageResolver;
    use crate::resolver::tests::FakeRegistry;

    struct Fixture {
        store:    Arc<FakeStore>,
        registry: Arc<FakeRegistry>,
        cache:    Arc<ImageCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store:    Arc::new(FakeStore::default()),
                registry: Arc::new(FakeRegistry::default()),
                cache:    Arc::new(ImageCache::new()),
            }
        }

        /// A reconciler for Deployments.
        fn reconciler(&self, cache_duration: Duration) -> Reconciler {
            let store = Arc::clone(&self.store) as Arc<dyn ObjectStore>;
            let resolver = ImageResolver::new(Arc::clone(&self.registry) as Arc<dyn RegistryClient>, Some(Arc::clone(&self.cache)));
            Reconciler::new(
                &WATCHED_KINDS[1],
                Arc::clone(&store),
                Arc::new(ClusterKeychain::new(store, Keychain::anonymous())),
                Arc::new(resolver),
                Arc::new(ExporterConfig::new(cache_duration, "linux/amd64").unwrap()),
            )
        }

        fn deployment(&self, images: &[&str]) {
            let containers: Vec<_> = images
                .iter()
                .enumerate()
                .map(|(i, image)| json!({"name": format!("c{i}"), "image": image}))
                .collect();
            self.store.insert(
                &WATCHED_KINDS[1].resource,
                json!({
                    "metadata": {"namespace": "prod", "name": "web"},
                    "spec": {"template": {"spec": {"containers": containers}}}
                }),
            );
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("prod", "web")
    }

    #[test]
    fn jitter_bounds() {
        let ttl = Duration::from_secs(600);
        for _ in 0..1000 {
            let delay = add_jitter(ttl);
            assert!(delay >= Duration::from_secs(600), "{delay:?}");
            assert!(delay < Duration::from_secs(700), "{delay:?}");
        }
        assert_eq!(add_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn resolves_every_container() {
        let fixture = Fixture::new();
        fixture.registry.push_image("ghcr.io/org/app:v1", DIGEST_A, 1000);
        fixture.registry.push_image("ghcr.io/org/sidecar:v1", DIGEST_B, 1000);
        fixture.deployment(&["ghcr.io/org/app:v1", "ghcr.io/org/sidecar:v1"]);

        let outcome = fixture.reconciler(Duration::from_secs(600)).reconcile(&key(), &Context::new()).await.unwrap();
        let ReconcileOutcome::Scheduled(Some(delay)) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(delay >= Duration::from_secs(600) && delay < Duration::from_secs(700));
        assert_eq!(fixture.cache.len().unwrap(), 2);

        let reference: ImageReference = "ghcr.io/org/sidecar:v1".parse().unwrap();
        assert_eq!(fixture.cache.get(&reference).unwrap().unwrap().image.digest, DIGEST_B);
    }

    #[tokio::test]
    async fn zero_cache_duration_disables_requeue() {
        let fixture = Fixture::new();
        fixture.registry.push_image("nginx:1.27", DIGEST_A, 1000);
        fixture.deployment(&["nginx:1.27"]);

        let outcome = fixture.reconciler(Duration::ZERO).reconcile(&key(), &Context::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Scheduled(None));
    }

    #[tokio::test]
    async fn missing_object_is_ignored() {
        let fixture = Fixture::new();
        fixture.deployment(&["nginx:1.27"]);
        fixture.store.remove(&WATCHED_KINDS[1].resource, &key());

        let outcome = fixture.reconciler(Duration::from_secs(600)).reconcile(&key(), &Context::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored);
        assert_eq!(fixture.registry.calls(), 0);
    }

    #[tokio::test]
    async fn first_failure_aborts() {
        let fixture = Fixture::new();
        fixture.registry.push_image("ghcr.io/org/app:v1", DIGEST_A, 1000);
        fixture.deployment(&["ghcr.io/org/missing:v1", "ghcr.io/org/app:v1"]);

        let result = fixture.reconciler(Duration::from_secs(600)).reconcile(&key(), &Context::new()).await;
        let Err(ReconcileError::Image { container, image, .. }) = result else {
            panic!("unexpected result {result:?}");
        };
        assert_eq!((container.as_str(), image.as_str()), ("c0", "ghcr.io/org/missing:v1"));
        // The second container was never attempted.
        assert_eq!(fixture.registry.calls(), 1);
        assert_eq!(fixture.cache.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn cluster_errors_fail_the_attempt() {
        let fixture = Fixture::new();
        fixture.store.fail_on("deployments");
        let result = fixture.reconciler(Duration::from_secs(600)).reconcile(&key(), &Context::new()).await;
        assert!(matches!(result, Err(ReconcileError::Cluster(_))));
    }

    #[tokio::test]
    async fn cancelled_attempt() {
        let fixture = Fixture::new();
        fixture.registry.push_image("nginx:1.27", DIGEST_A, 1000);
        fixture.deployment(&["nginx:1.27"]);
        let ctx = Context::new();
        ctx.cancel();

        let error = fixture.reconciler(Duration::from_secs(600)).reconcile(&key(), &ctx).await.unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(fixture.cache.len().unwrap(), 0);
    }

    #[tokio::test]
    async fn exceeded_deadline_is_a_failure() {
        let fixture = Fixture::new();
        fixture.registry.push_image("nginx:1.27", DIGEST_A, 1000);
        fixture.deployment(&["nginx:1.27"]);
        let ctx = Context::new().with_timeout(Duration::ZERO);

        let error = fixture.reconciler(Duration::from_secs(600)).reconcile(&key(), &ctx).await.unwrap_err();
        assert!(matches!(error, ReconcileError::Cancelled(Cancelled::DeadlineExceeded)));
        assert!(!error.is_cancelled());
    }
}
