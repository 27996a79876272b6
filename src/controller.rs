use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{Action, Config as RuntimeConfig, Controller as RuntimeController, Error as RuntimeError};
use kube::runtime::watcher;
use tracing::{debug, error, info, warn};

use crate::cluster::ObjectKey;
use crate::config::ControllerConfig;
use crate::context::Context;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};

/// First retry delay after a failure, doubled on every further failure.
const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1000);

fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1);
    BACKOFF_BASE
        .saturating_mul(2_u32.saturating_pow(exponent))
        .min(BACKOFF_MAX)
}

/// Shared by every reconcile of one controller.
struct State {
    reconciler:      Arc<Reconciler>,
    ctx:             Context,
    attempt_timeout: Duration,
    /// Consecutive failures per object, cleared on success.
    failures:        Mutex<HashMap<ObjectKey, u32>>,
}

impl State {
    fn new(reconciler: Arc<Reconciler>, ctx: Context, attempt_timeout: Duration) -> Self {
        Self {
            reconciler,
            ctx,
            attempt_timeout,
            failures: Mutex::default(),
        }
    }

    // Only map operations happen under the lock, so a poisoned one is still
    // consistent.
    fn failures(&self) -> MutexGuard<'_, HashMap<ObjectKey, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One deadline-bound attempt. Returns when the object should be looked
    /// at again without a change to it, if at all.
    async fn attempt(&self, key: &ObjectKey) -> Result<Option<Duration>, ReconcileError> {
        let ctx = self.ctx.with_timeout(self.attempt_timeout);
        let outcome = self.reconciler.reconcile(key, &ctx).await?;
        self.failures().remove(key);
        Ok(match outcome {
            ReconcileOutcome::Scheduled(delay) => delay,
            ReconcileOutcome::Ignored => None,
        })
    }

    /// Retry delay after a failed attempt. Attempts cancelled by shutdown
    /// are not retried.
    fn on_error(&self, key: &ObjectKey, error: &ReconcileError) -> Option<Duration> {
        if error.is_cancelled() {
            return None;
        }
        let mut failures = self.failures();
        let count = failures.entry(key.clone()).or_default();
        *count = count.saturating_add(1);
        Some(backoff(*count))
    }
}

fn object_key(object: &DynamicObject) -> ObjectKey {
    ObjectKey::new(object.namespace().unwrap_or_default(), object.name_any())
}

async fn reconcile(object: Arc<DynamicObject>, state: Arc<State>) -> Result<Action, ReconcileError> {
    let delay = state.attempt(&object_key(&object)).await?;
    Ok(delay.map_or_else(Action::await_change, Action::requeue))
}

fn error_policy(object: Arc<DynamicObject>, error: &ReconcileError, state: Arc<State>) -> Action {
    let kind = state.reconciler.kind().gvk().kind;
    let key = object_key(&object);
    match state.on_error(&key, error) {
        Some(delay) => {
            error!("Reconcile of {kind} {key} failed, retrying in {delay:?}: {error}");
            Action::requeue(delay)
        }
        None => {
            debug!("Reconcile of {kind} {key} cancelled");
            Action::await_change()
        }
    }
}

/// Drives one reconciler from a watch on its kind. Every object is
/// reconciled when it is first listed and whenever it changes, and after
/// the delay its last successful attempt asked for.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    client:     kube::Client,
    config:     ControllerConfig,
}

impl Controller {
    pub(crate) const fn new(reconciler: Arc<Reconciler>, client: kube::Client, config: ControllerConfig) -> Self {
        Self { reconciler, client, config }
    }

    /// Runs until `ctx` is cancelled, then waits for in-flight attempts,
    /// which are cancelled along with it.
    pub(crate) async fn run(self, ctx: Context) {
        let kind = self.reconciler.kind().gvk().kind;
        let resource = self.reconciler.kind().resource.api_resource();
        info!("Starting {kind} controller with {} worker(s)", self.config.workers);

        let api: Api<DynamicObject> = Api::all_with(self.client, &resource);
        let shutdown = ctx.token().clone().cancelled_owned();
        let state = Arc::new(State::new(self.reconciler, ctx, self.config.reconcile_timeout));

        RuntimeController::new_with(api, watcher::Config::default(), resource)
            .with_config(RuntimeConfig::default().concurrency(self.config.workers))
            .graceful_shutdown_on(shutdown)
            .run(reconcile, error_policy, state)
            .for_each(|result| async move {
                match result {
                    Ok((object, _)) => debug!("Reconciled {kind} {object}"),
                    // Already reported by the error policy.
                    Err(RuntimeError::ReconcilerFailed(..)) => {}
                    Err(e) => warn!("{kind} controller: {e}"),
                }
            })
            .await;
        info!("Stopped {kind} controller");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use kube::api::DynamicObject;
    use kube::runtime::controller::Action;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::cache::ImageCache;
    use crate::cache::tests::DIGEST_A;
    use crate::cluster::tests::FakeStore;
    use crate::cluster::{ObjectKey, ObjectStore, WATCHED_KINDS};
    use crate::config::ExporterConfig;
    use crate::context::{Cancelled, Context};
    use crate::controller::{BACKOFF_MAX, State, backoff, reconcile};
    use crate::keychain::ClusterKeychain;
    use crate::reconciler::{ReconcileError, Reconciler};
    use crate::registry::RegistryClient;
    use crate::registry::auth::Keychain;
    use crate::resolver::ImageResolver;
    use crate::resolver::tests::FakeRegistry;

    const PODS: usize = 40;

    /// Pods `prod/pod-<i>`, each running an image of its own.
    fn state(cache_duration: Duration) -> State {
        let store = Arc::new(FakeStore::default());
        let registry = Arc::new(FakeRegistry::default());
        for i in 0..PODS {
            let image = format!("ghcr.io/org/app-{i}:v1");
            registry.push_image(&image, DIGEST_A, 1000);
            store.insert(
                &WATCHED_KINDS[0].resource,
                json!({"metadata": {"namespace": "prod", "name": format!("pod-{i}")}, "spec": {"containers": [{"name": "app", "image": image}]}}),
            );
        }

        let objects = Arc::clone(&store) as Arc<dyn ObjectStore>;
        let reconciler = Reconciler::new(
            &WATCHED_KINDS[0],
            Arc::clone(&objects),
            Arc::new(ClusterKeychain::new(objects, Keychain::anonymous())),
            Arc::new(ImageResolver::new(registry as Arc<dyn RegistryClient>, Some(Arc::new(ImageCache::new())))),
            Arc::new(ExporterConfig::new(cache_duration, "").unwrap()),
        );
        State::new(Arc::new(reconciler), Context::new(), Duration::from_secs(5))
    }

    fn pod(name: &str) -> Arc<DynamicObject> {
        Arc::new(DynamicObject::new(name, &WATCHED_KINDS[0].resource.api_resource()).within("prod"))
    }

    #[tokio::test]
    async fn requeues_spread_over_the_jitter_window() {
        let ttl = Duration::from_millis(600);
        let state = state(ttl);

        let mut delays = Vec::new();
        for i in 0..PODS {
            let delay = state.attempt(&ObjectKey::new("prod", format!("pod-{i}"))).await.unwrap().unwrap();
            assert!(delay >= ttl && delay < Duration::from_millis(700), "{delay:?}");
            delays.push(delay);
        }

        // Objects reconciled together come due at different times.
        let spread = delays.iter().max().unwrap().saturating_sub(*delays.iter().min().unwrap());
        assert!(spread > Duration::from_millis(20), "{delays:?}");
        let distinct: BTreeSet<_> = delays.iter().map(Duration::as_millis).collect();
        assert!(distinct.len() > PODS / 4, "{delays:?}");
    }

    #[tokio::test]
    async fn reconcile_actions() {
        let state = Arc::new(state(Duration::from_secs(600)));
        let action = reconcile(pod("pod-0"), Arc::clone(&state)).await.unwrap();
        assert_ne!(action, Action::await_change());

        // Deleted objects wait for the next change.
        let action = reconcile(pod("gone"), Arc::clone(&state)).await.unwrap();
        assert_eq!(action, Action::await_change());

        // So does everything when periodic re-checks are off.
        let state = Arc::new(self::state(Duration::ZERO));
        assert_eq!(reconcile(pod("pod-0"), state).await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn failures_back_off_until_success() {
        let state = state(Duration::from_secs(600));
        let key = ObjectKey::new("prod", "pod-0");
        let failed = ReconcileError::Cancelled(Cancelled::DeadlineExceeded);
        assert_eq!(state.on_error(&key, &failed), Some(Duration::from_millis(5)));
        assert_eq!(state.on_error(&key, &failed), Some(Duration::from_millis(10)));
        assert_eq!(state.on_error(&key, &failed), Some(Duration::from_millis(20)));
        // Other objects keep their own count.
        assert_eq!(state.on_error(&ObjectKey::new("prod", "pod-1"), &failed), Some(Duration::from_millis(5)));

        state.attempt(&key).await.unwrap();
        assert_eq!(state.on_error(&key, &failed), Some(Duration::from_millis(5)));

        let cancelled = ReconcileError::Cancelled(Cancelled::Cancelled);
        assert_eq!(state.on_error(&key, &cancelled), None);
    }

    #[tokio::test]
    async fn attempts_are_cancelled_with_the_root() {
        let state = state(Duration::from_secs(600));
        state.ctx.cancel();
        let error = state.attempt(&ObjectKey::new("prod", "pod-0")).await.unwrap_err();
        assert!(error.is_cancelled());
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(18), Duration::from_millis(5 * (1 << 17)));
        assert_eq!(backoff(19), BACKOFF_MAX);
        assert_eq!(backoff(u32::MAX), BACKOFF_MAX);
    }
}
