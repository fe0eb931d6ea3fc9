//! Watch sources: per-kind local mirrors of cluster objects and the typed notifications they
//! produce.
//!
//! A [`Mirror`] is the owned, shareable store for one resource kind. It turns the raw
//! list/watch events of `kube::runtime::watcher` into [`Notification`]s, including tombstones for
//! objects that disappeared while the watch was broken. Translators consume notifications through
//! the [`WatchSource`] trait; relationship queries read mirrors through [`ObjectStore`].

// System
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

// Third Party
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{watcher, watcher::Event},
    Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// Local
use crate::backoff::{Backoff, BackoffPolicy};
use crate::utils::Shutdown;

/// Outcome of a deletion notification.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteState<K> {
    /// The deleted object itself.
    Live(Arc<K>),
    /// The final state is unknown; the last known object if one was retained.
    Tombstone(Option<Arc<K>>),
}

impl<K> DeleteState<K> {
    pub fn into_last_known(self) -> Option<Arc<K>> {
        match self {
            DeleteState::Live(obj) => Some(obj),
            DeleteState::Tombstone(last_known) => last_known,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(DeleteState<K>),
}

/// Ordered producer of notifications for one resource kind. `None` means the source has ended.
#[async_trait]
pub trait WatchSource<K>: Send {
    async fn next(&mut self) -> Option<Notification<K>>;
}

/// Read access to a kind's current snapshot.
pub trait ObjectStore<K>: Send + Sync {
    fn list(&self) -> Vec<Arc<K>>;
    /// True once the initial list has completed.
    fn is_ready(&self) -> bool;
}

/// Readiness of every mirrored resource, queryable by resource name.
#[derive(Debug, Clone, Default)]
pub struct ReadinessRegistry {
    resources: Arc<RwLock<BTreeMap<String, bool>>>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, resource: &str) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource.to_string())
            .or_insert(false);
    }

    pub fn set_ready(&self, resource: &str) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.to_string(), true);
    }

    pub fn resource_ready(&self, resource: &str) -> bool {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .copied()
            .unwrap_or(false)
    }

    pub fn all_ready(&self, resources: &[&str]) -> bool {
        resources.iter().all(|resource| self.resource_ready(resource))
    }
}

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Waits up to `max_wait` for every resource in `resources` to finish its initial sync.
/// Returns whether they all did.
pub async fn wait_for_sync(
    registry: &ReadinessRegistry,
    resources: &[&str],
    max_wait: Duration,
    shutdown: &mut Shutdown,
) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if registry.all_ready(resources) {
            info!(?resources, "Mirrors synced");
            return true;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            let pending: Vec<_> = resources
                .iter()
                .filter(|resource| !registry.resource_ready(resource))
                .collect();
            warn!(?pending, "Mirrors not synced after {:?}, continuing", max_wait);
            return false;
        }
        if !shutdown.sleep(remaining.min(SYNC_POLL_INTERVAL)).await {
            return false;
        }
    }
}

/// Mirrors a consumer depends on, awaited once before the consumer starts.
#[derive(Debug, Clone)]
pub struct SyncGate {
    registry: ReadinessRegistry,
    resources: Vec<&'static str>,
    max_wait: Duration,
    shutdown: Shutdown,
}

impl SyncGate {
    pub fn new(
        registry: ReadinessRegistry,
        resources: &[&'static str],
        max_wait: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            registry,
            resources: resources.to_vec(),
            max_wait,
            shutdown,
        }
    }

    /// Waits like [`wait_for_sync`]. Returns `false` only if shutdown was requested; a timeout
    /// lets the consumer start with whatever has synced.
    pub async fn open(mut self) -> bool {
        wait_for_sync(&self.registry, &self.resources, self.max_wait, &mut self.shutdown).await;
        !self.shutdown.is_requested()
    }
}

/// In-memory mirror of one resource kind, keyed by object uid.
#[derive(Debug)]
pub struct Mirror<K> {
    resource: &'static str,
    objects: RwLock<HashMap<String, Arc<K>>>,
    ready: AtomicBool,
    registry: Option<ReadinessRegistry>,
}

impl<K> Mirror<K>
where
    K: Resource + Send + Sync,
{
    pub fn new(resource: &'static str) -> Self {
        Self {
            resource,
            objects: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            registry: None,
        }
    }

    pub fn with_registry(resource: &'static str, registry: ReadinessRegistry) -> Self {
        registry.register(resource);
        Self {
            registry: Some(registry),
            ..Self::new(resource)
        }
    }

    pub fn resource(&self) -> &'static str {
        self.resource
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, uid: &str) -> Option<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(resource = self.resource, "Initial sync complete");
        }
        if let Some(registry) = &self.registry {
            registry.set_ready(self.resource);
        }
    }

    /// Applies one watcher event and returns the notifications it implies. A full relist marks
    /// the mirror ready.
    pub fn apply(&self, event: Event<K>) -> Vec<Notification<K>> {
        let relist = matches!(event, Event::Restarted(_));
        let notifications = self.diff(event);
        if relist {
            self.mark_ready();
        }
        notifications
    }

    fn diff(&self, event: Event<K>) -> Vec<Notification<K>> {
        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match event {
            Event::Applied(obj) => {
                let obj = Arc::new(obj);
                match objects.insert(object_key(obj.as_ref()), Arc::clone(&obj)) {
                    Some(old) => vec![Notification::Updated { old, new: obj }],
                    None => vec![Notification::Added(obj)],
                }
            }
            Event::Deleted(obj) => {
                objects.remove(&object_key(&obj));
                vec![Notification::Deleted(DeleteState::Live(Arc::new(obj)))]
            }
            Event::Restarted(list) => {
                let mut previous = std::mem::take(&mut *objects);
                let mut notifications = Vec::with_capacity(list.len());
                for obj in list {
                    let obj = Arc::new(obj);
                    let key = object_key(obj.as_ref());
                    match previous.remove(&key) {
                        Some(old) => notifications.push(Notification::Updated {
                            old,
                            new: Arc::clone(&obj),
                        }),
                        None => notifications.push(Notification::Added(Arc::clone(&obj))),
                    }
                    objects.insert(key, obj);
                }
                // Whatever the relist no longer contains was deleted while we were not watching.
                for (key, last_known) in previous {
                    debug!(resource = self.resource, uid = %key, "Object vanished during relist");
                    notifications.push(Notification::Deleted(DeleteState::Tombstone(Some(
                        last_known,
                    ))));
                }
                notifications
            }
        }
    }
}

impl<K> ObjectStore<K> for Mirror<K>
where
    K: Resource + Send + Sync,
{
    fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    match obj.meta().uid.as_deref() {
        Some(uid) => uid.to_string(),
        None => format!(
            "{}/{}",
            obj.meta().namespace.as_deref().unwrap_or_default(),
            obj.meta().name.as_deref().unwrap_or_default()
        ),
    }
}

/// Watch source backed by `kube::runtime::watcher`, keeping a [`Mirror`] current.
pub struct KubeWatchSource<K: 'static> {
    mirror: Arc<Mirror<K>>,
    stream: BoxStream<'static, Result<Event<K>, watcher::Error>>,
    pending: VecDeque<Notification<K>>,
    backoff: Backoff,
    shutdown: Shutdown,
}

impl<K> KubeWatchSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(
        api: Api<K>,
        mirror: Arc<Mirror<K>>,
        backoff: BackoffPolicy,
        shutdown: Shutdown,
    ) -> Self {
        let stream = watcher(api, watcher::Config::default()).boxed();
        Self {
            mirror,
            stream,
            pending: VecDeque::new(),
            backoff: Backoff::new(backoff),
            shutdown,
        }
    }

    pub fn mirror(&self) -> Arc<Mirror<K>> {
        Arc::clone(&self.mirror)
    }

    /// Keeps the mirror current without consuming notifications. Used for kinds that are only
    /// needed for relationship queries.
    pub async fn run_mirror(mut self) {
        info!(resource = self.mirror.resource(), "Starting mirror...");
        while self.next().await.is_some() {}
        info!(resource = self.mirror.resource(), "Mirror stopped");
    }
}

#[async_trait]
impl<K> WatchSource<K> for KubeWatchSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn next(&mut self) -> Option<Notification<K>> {
        loop {
            if let Some(notification) = self.pending.pop_front() {
                return Some(notification);
            }
            let item = tokio::select! {
                _ = self.shutdown.wait() => return None,
                item = self.stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    self.backoff.reset();
                    self.pending.extend(self.mirror.apply(event));
                }
                Some(Err(error)) => {
                    let delay = self.backoff.next(Duration::ZERO);
                    warn!(
                        resource = self.mirror.resource(),
                        "Watch error: {}, retrying in {:?}", error, delay
                    );
                    if !self.shutdown.sleep(delay).await {
                        return None;
                    }
                }
                None => {
                    warn!(resource = self.mirror.resource(), "Watch stream ended");
                    return None;
                }
            }
        }
    }
}

/// Watch source fed from a channel.
pub struct ChannelWatchSource<K> {
    rx: mpsc::Receiver<Notification<K>>,
}

impl<K> ChannelWatchSource<K> {
    pub fn new(rx: mpsc::Receiver<Notification<K>>) -> Self {
        Self { rx }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<Notification<K>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl<K: Send + Sync> WatchSource<K> for ChannelWatchSource<K> {
    async fn next(&mut self) -> Option<Notification<K>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    // Third Party
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    // Local
    use super::*;

    fn namespace(name: &str, uid: &str, version: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_distinguishes_add_from_update() {
        let mirror = Mirror::new("namespaces");
        let added = mirror.apply(Event::Applied(namespace("a", "1", "10")));
        assert!(matches!(added.as_slice(), [Notification::Added(_)]));

        let updated = mirror.apply(Event::Applied(namespace("a", "1", "11")));
        match updated.as_slice() {
            [Notification::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("10"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("11"));
            }
            other => panic!("unexpected notifications: {:?}", other),
        }
        assert_eq!(mirror.len(), 1);
        assert!(!mirror.is_ready());
    }

    #[test]
    fn test_delete_is_live() {
        let mirror = Mirror::new("namespaces");
        mirror.apply(Event::Applied(namespace("a", "1", "10")));
        let deleted = mirror.apply(Event::Deleted(namespace("a", "1", "12")));
        assert!(matches!(
            deleted.as_slice(),
            [Notification::Deleted(DeleteState::Live(_))]
        ));
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_relist_tombstones_vanished_objects_and_marks_ready() {
        let registry = ReadinessRegistry::new();
        let mirror = Mirror::with_registry("namespaces", registry.clone());
        assert!(!registry.resource_ready("namespaces"));
        mirror.apply(Event::Applied(namespace("a", "1", "10")));
        mirror.apply(Event::Applied(namespace("b", "2", "10")));

        let notifications = mirror.apply(Event::Restarted(vec![
            namespace("a", "1", "10"),
            namespace("c", "3", "15"),
        ]));

        assert_eq!(notifications.len(), 3);
        assert!(matches!(notifications[0], Notification::Updated { .. }));
        assert!(matches!(notifications[1], Notification::Added(_)));
        match &notifications[2] {
            Notification::Deleted(DeleteState::Tombstone(Some(last_known))) => {
                assert_eq!(last_known.metadata.name.as_deref(), Some("b"));
            }
            other => panic!("expected tombstone, got {:?}", other),
        }
        assert!(mirror.is_ready());
        assert!(registry.resource_ready("namespaces"));
        assert!(mirror.get("2").is_none());
        assert_eq!(mirror.list().len(), 2);
    }

    #[test]
    fn test_empty_relist_still_marks_ready() {
        let mirror: Mirror<Namespace> = Mirror::new("namespaces");
        assert!(mirror.apply(Event::Restarted(vec![])).is_empty());
        assert!(mirror.is_ready());
    }

    #[test]
    fn test_unknown_resource_is_not_ready() {
        assert!(!ReadinessRegistry::new().resource_ready("pods"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_sync() {
        let (_trigger, mut shutdown) = crate::utils::shutdown_channel();
        let registry = ReadinessRegistry::new();
        let namespaces: Arc<Mirror<Namespace>> =
            Arc::new(Mirror::with_registry("namespaces", registry.clone()));
        registry.register("pods");

        assert!(
            !wait_for_sync(&registry, &["namespaces", "pods"], Duration::from_secs(5), &mut shutdown)
                .await
        );

        let syncing = Arc::clone(&namespaces);
        let pods = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            syncing.apply(Event::Restarted(vec![]));
            pods.set_ready("pods");
        });
        assert!(
            wait_for_sync(&registry, &["namespaces", "pods"], Duration::from_secs(5), &mut shutdown)
                .await
        );
    }

    #[test]
    fn test_tombstone_unwrapping() {
        let obj = Arc::new(namespace("a", "1", "1"));
        assert!(DeleteState::Live(Arc::clone(&obj)).into_last_known().is_some());
        assert!(DeleteState::Tombstone(Some(obj)).into_last_known().is_some());
        assert!(DeleteState::<Namespace>::Tombstone(None)
            .into_last_known()
            .is_none());
    }

    #[tokio::test]
    async fn test_channel_source_preserves_order() {
        let (tx, mut source) = ChannelWatchSource::channel(4);
        tx.send(Notification::Added(Arc::new(namespace("a", "1", "1"))))
            .await
            .unwrap();
        tx.send(Notification::Deleted(DeleteState::Tombstone(None)))
            .await
            .unwrap();
        drop(tx);

        assert!(matches!(source.next().await, Some(Notification::Added(_))));
        assert!(matches!(
            source.next().await,
            Some(Notification::Deleted(DeleteState::Tombstone(None)))
        ));
        assert!(source.next().await.is_none());
    }
}
