//! Resource quota entities.

// System
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// Third Party
use k8s_openapi::api::core::v1::{Pod, ResourceQuota};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::warn;

// Local
use crate::model::{CongroupUid, ContainerGroup};
use crate::quantity::metric_value;
use crate::relations::{uids_in_namespace, LabelSelector, RelationshipResolver};
use crate::source::ObjectStore;
use crate::translator::CongroupTranslator;
use crate::utils::KUBERNETES_TAG_PREFIX;

pub const RESOURCE_QUOTA_KIND: &str = "k8s_resourcequota";
pub const RESOURCE_QUOTA_RESOURCE: &str = "resourcequotas";

const TAG_PREFIX: &str = "resourcequota.";
const SCOPE_TAGS: [(&str, &str); 4] = [
    ("Terminating", "scope.terminating"),
    ("NotTerminating", "scope.notterminating"),
    ("BestEffort", "scope.besteffort"),
    ("NotBestEffort", "scope.notbesteffort"),
];

fn tag(suffix: &str) -> String {
    format!("{}{}{}", KUBERNETES_TAG_PREFIX, TAG_PREFIX, suffix)
}

pub struct ResourceQuotaTranslator {
    resolver: Arc<RelationshipResolver>,
    pod_selector: LabelSelector,
}

impl ResourceQuotaTranslator {
    pub fn new(resolver: Arc<RelationshipResolver>) -> Self {
        Self {
            resolver,
            pod_selector: LabelSelector::everything(),
        }
    }
}

impl CongroupTranslator<ResourceQuota> for ResourceQuotaTranslator {
    fn resource(&self) -> &'static str {
        RESOURCE_QUOTA_RESOURCE
    }

    fn congroup(&self, quota: &ResourceQuota) -> ContainerGroup {
        let mut group = ContainerGroup::new(quota_uid(quota));
        for (key, value) in quota.labels() {
            group
                .tags
                .insert(tag(&format!("label.{}", key)), value.clone());
        }
        set_scope_tags(&mut group.tags, quota);
        group.tags.insert(tag("name"), quota.name_any());

        add_metrics(&mut group, quota);
        let namespace = quota.namespace();
        self.resolver
            .add_namespace_parents(&mut group.parents, namespace.as_deref());
        self.resolver.add_pod_children(
            &mut group.children,
            &self.pod_selector,
            namespace.as_deref(),
        );
        group
    }

    fn equivalent(&self, old: &ResourceQuota, new: &ResourceQuota) -> bool {
        old.metadata.name == new.metadata.name
            && old.labels() == new.labels()
            && old.annotations() == new.annotations()
            && used(old) == used(new)
            && hard(old) == hard(new)
    }
}

fn quota_uid(quota: &ResourceQuota) -> CongroupUid {
    CongroupUid::new(RESOURCE_QUOTA_KIND, quota.uid().unwrap_or_default())
}

fn used(quota: &ResourceQuota) -> Option<&BTreeMap<String, Quantity>> {
    quota.status.as_ref().and_then(|status| status.used.as_ref())
}

fn hard(quota: &ResourceQuota) -> Option<&BTreeMap<String, Quantity>> {
    quota.status.as_ref().and_then(|status| status.hard.as_ref())
}

/// Every scope tag is present, `"true"` or `"false"`.
fn set_scope_tags(tags: &mut BTreeMap<String, String>, quota: &ResourceQuota) {
    let scopes = quota
        .spec
        .as_ref()
        .and_then(|spec| spec.scopes.as_ref());
    for (scope, suffix) in SCOPE_TAGS {
        let enabled = scopes
            .map(|scopes| scopes.iter().any(|s| s == scope))
            .unwrap_or(false);
        tags.insert(tag(suffix), enabled.to_string());
    }
}

fn add_metrics(group: &mut ContainerGroup, quota: &ResourceQuota) {
    let Some(used) = used(quota) else {
        return;
    };
    let hard = hard(quota);
    for (resource, used_quantity) in used {
        let hard_value = match hard.and_then(|hard| hard.get(resource)) {
            Some(quantity) => parse_metric(quota, resource, quantity),
            None => Some(0.0),
        };
        let used_value = parse_metric(quota, resource, used_quantity);
        if let (Some(hard_value), Some(used_value)) = (hard_value, used_value) {
            group.push_metric(tag(&format!("{}.hard", resource)), hard_value);
            group.push_metric(tag(&format!("{}.used", resource)), used_value);
        }
    }
}

fn parse_metric(quota: &ResourceQuota, resource: &str, quantity: &Quantity) -> Option<f64> {
    match metric_value(quantity) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(
                quota = %quota.name_any(),
                resource,
                "Skipping unparseable quantity: {}", error
            );
            None
        }
    }
}

/// Quotas in the pod's namespace, as parents of the pod entity. For a pod translator building a
/// pod's parent set.
pub fn add_resource_quota_parents_from_pod(
    parents: &mut BTreeSet<CongroupUid>,
    quotas: &dyn ObjectStore<ResourceQuota>,
    pod: &Pod,
) {
    if let Some(namespace) = pod.metadata.namespace.as_deref() {
        parents.extend(uids_in_namespace(
            quotas,
            RESOURCE_QUOTA_KIND,
            namespace,
            &LabelSelector::everything(),
        ));
    }
}

/// Quotas in `namespace`, as children of the namespace entity. For a namespace translator
/// building a namespace's child set.
pub fn add_resource_quota_children_from_namespace(
    children: &mut BTreeSet<CongroupUid>,
    quotas: &dyn ObjectStore<ResourceQuota>,
    namespace: &str,
) {
    children.extend(uids_in_namespace(
        quotas,
        RESOURCE_QUOTA_KIND,
        namespace,
        &LabelSelector::everything(),
    ));
}

#[cfg(test)]
mod tests {
    // System
    use std::time::Duration;

    // Third Party
    use k8s_openapi::api::core::v1::{Namespace, ResourceQuotaSpec, ResourceQuotaStatus};
    use kube::runtime::watcher::Event;
    use tokio::sync::mpsc;

    // Local
    use super::*;
    use crate::model::CongroupEventType;
    use crate::relations::tests::{meta, namespace_mirror, pod, pod_mirror};
    use crate::relations::{NAMESPACE_KIND, POD_KIND};
    use crate::source::{
        ChannelWatchSource, DeleteState, Mirror, Notification, ReadinessRegistry, SyncGate,
    };
    use crate::translator::{
        run_translator, run_translator_after_sync, EventCounters, TranslatorOptions,
    };
    use crate::utils::shutdown_channel;

    fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    fn quota(version: &str, used: &[(&str, &str)], hard: &[(&str, &str)]) -> ResourceQuota {
        let mut metadata = meta("compute", Some("team-a"), "a");
        metadata.resource_version = Some(version.to_string());
        ResourceQuota {
            metadata,
            spec: Some(ResourceQuotaSpec {
                hard: Some(quantities(hard)),
                scopes: Some(vec!["BestEffort".to_string()]),
                ..Default::default()
            }),
            status: Some(ResourceQuotaStatus {
                used: Some(quantities(used)),
                hard: Some(quantities(hard)),
            }),
        }
    }

    fn translator() -> ResourceQuotaTranslator {
        ResourceQuotaTranslator::new(Arc::new(RelationshipResolver::new(
            namespace_mirror(&[("team-a", "ns-a")]),
            pod_mirror(vec![
                pod("web-1", "team-a", "p1", &[]),
                pod("web-2", "team-b", "p2", &[]),
            ]),
        )))
    }

    #[test]
    fn test_tags_and_relationships() {
        let mut q = quota("1", &[("cpu", "500m")], &[("cpu", "1")]);
        q.metadata.labels = Some(
            [("tier".to_string(), "gold".to_string())]
                .into_iter()
                .collect(),
        );
        let group = translator().congroup(&q);

        assert_eq!(group.uid, CongroupUid::new(RESOURCE_QUOTA_KIND, "a"));
        assert_eq!(group.tags["kubernetes.resourcequota.label.tier"], "gold");
        assert_eq!(group.tags["kubernetes.resourcequota.name"], "compute");
        assert_eq!(group.tags["kubernetes.resourcequota.scope.besteffort"], "true");
        assert_eq!(group.tags["kubernetes.resourcequota.scope.notbesteffort"], "false");
        assert_eq!(group.tags["kubernetes.resourcequota.scope.terminating"], "false");
        assert_eq!(group.tags["kubernetes.resourcequota.scope.notterminating"], "false");
        assert_eq!(
            group.parents.into_iter().collect::<Vec<_>>(),
            vec![CongroupUid::new(NAMESPACE_KIND, "ns-a")]
        );
        assert_eq!(
            group.children.into_iter().collect::<Vec<_>>(),
            vec![CongroupUid::new(POD_KIND, "p1")]
        );
    }

    #[test]
    fn test_scope_tags_present_without_scopes() {
        let mut q = quota("1", &[], &[]);
        q.spec = None;
        let group = translator().congroup(&q);
        for (_, suffix) in SCOPE_TAGS {
            assert_eq!(group.tags[&tag(suffix)], "false");
        }
    }

    #[test]
    fn test_metrics_use_milli_precision() {
        let q = quota(
            "1",
            &[("cpu", "500m"), ("memory", "1Gi"), ("pods", "3")],
            &[("cpu", "1"), ("pods", "10")],
        );
        let group = translator().congroup(&q);

        assert_eq!(group.metric("kubernetes.resourcequota.cpu.used"), Some(0.5));
        assert_eq!(group.metric("kubernetes.resourcequota.cpu.hard"), Some(1.0));
        assert_eq!(
            group.metric("kubernetes.resourcequota.memory.used"),
            Some(1073741824.0)
        );
        assert_eq!(group.metric("kubernetes.resourcequota.memory.hard"), Some(0.0));
        assert_eq!(group.metric("kubernetes.resourcequota.pods.used"), Some(3.0));
        assert_eq!(group.metrics.len(), 6);
    }

    #[test]
    fn test_unparseable_quantity_is_skipped() {
        let q = quota("1", &[("cpu", "lots"), ("pods", "2")], &[("pods", "4")]);
        let group = translator().congroup(&q);
        assert_eq!(group.metric("kubernetes.resourcequota.cpu.used"), None);
        assert_eq!(group.metric("kubernetes.resourcequota.pods.hard"), Some(4.0));
    }

    #[test]
    fn test_equivalence_ignores_resource_version() {
        let t = translator();
        let old = quota("1", &[("cpu", "500m")], &[("cpu", "1")]);
        assert!(t.equivalent(&old, &quota("2", &[("cpu", "500m")], &[("cpu", "1")])));
        assert!(!t.equivalent(&old, &quota("2", &[("cpu", "700m")], &[("cpu", "1")])));

        let mut annotated = old.clone();
        annotated.metadata.annotations = Some(
            [("owner".to_string(), "ops".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(!t.equivalent(&old, &annotated));

        let mut renamed = old.clone();
        renamed.metadata.name = Some("other".to_string());
        assert!(!t.equivalent(&old, &renamed));
    }

    #[test]
    fn test_cross_kind_queries() {
        let quotas: Mirror<ResourceQuota> = Mirror::new(RESOURCE_QUOTA_RESOURCE);
        let mut other = quota("1", &[], &[]);
        other.metadata = meta("other", Some("team-b"), "b");
        mirror_all(&quotas, vec![quota("1", &[], &[]), other]);

        let mut parents = BTreeSet::new();
        add_resource_quota_parents_from_pod(&mut parents, &quotas, &pod("web-1", "team-a", "p1", &[]));
        assert_eq!(
            parents.into_iter().collect::<Vec<_>>(),
            vec![CongroupUid::new(RESOURCE_QUOTA_KIND, "a")]
        );

        let mut children = BTreeSet::new();
        add_resource_quota_children_from_namespace(&mut children, &quotas, "team-b");
        assert_eq!(
            children.into_iter().collect::<Vec<_>>(),
            vec![CongroupUid::new(RESOURCE_QUOTA_KIND, "b")]
        );
    }

    #[test]
    fn test_cross_kind_queries_wait_for_sync() {
        let quotas: Mirror<ResourceQuota> = Mirror::new(RESOURCE_QUOTA_RESOURCE);
        quotas.apply(Event::Applied(quota("1", &[], &[])));
        let mut children = BTreeSet::new();
        add_resource_quota_children_from_namespace(&mut children, &quotas, "team-a");
        assert!(children.is_empty());
    }

    fn mirror_all(mirror: &Mirror<ResourceQuota>, quotas: Vec<ResourceQuota>) {
        mirror.apply(Event::Restarted(quotas));
    }

    #[tokio::test]
    async fn test_add_update_remove_scenario() {
        let (tx, source) = ChannelWatchSource::channel(8);
        let (sink, mut events) = mpsc::channel(8);
        let counters = Arc::new(EventCounters::new());

        let added = Arc::new(quota("1", &[("cpu", "500m")], &[("cpu", "1")]));
        let updated = Arc::new(quota("2", &[("cpu", "700m")], &[("cpu", "1")]));
        tx.send(Notification::Added(Arc::clone(&added))).await.unwrap();
        tx.send(Notification::Updated {
            old: Arc::clone(&added),
            new: Arc::clone(&updated),
        })
        .await
        .unwrap();
        tx.send(Notification::Deleted(DeleteState::Tombstone(Some(updated))))
            .await
            .unwrap();
        drop(tx);

        run_translator(
            source,
            translator(),
            TranslatorOptions::default(),
            sink,
            Arc::clone(&counters),
        )
        .await
        .unwrap();

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }
        assert_eq!(received.len(), 3);

        assert_eq!(received[0].event_type, CongroupEventType::Added);
        assert_eq!(received[0].object.metric("kubernetes.resourcequota.cpu.used"), Some(0.5));
        assert_eq!(received[0].object.metric("kubernetes.resourcequota.cpu.hard"), Some(1.0));

        assert_eq!(received[1].event_type, CongroupEventType::Updated);
        assert_eq!(received[1].object.metric("kubernetes.resourcequota.cpu.used"), Some(0.7));

        assert_eq!(received[2].event_type, CongroupEventType::Removed);
        assert_eq!(received[2].object.metric("kubernetes.resourcequota.cpu.used"), Some(0.7));
        assert_eq!(received[2].object.uid, CongroupUid::new(RESOURCE_QUOTA_KIND, "a"));

        let counts = counters.get(RESOURCE_QUOTA_RESOURCE);
        assert_eq!((counts.add, counts.update_and_send, counts.delete), (1, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_events_wait_for_relationship_mirrors() {
        let registry = ReadinessRegistry::new();
        let namespaces: Arc<Mirror<Namespace>> =
            Arc::new(Mirror::with_registry("namespaces", registry.clone()));
        let pods: Arc<Mirror<Pod>> = Arc::new(Mirror::with_registry("pods", registry.clone()));
        let resolver = Arc::new(RelationshipResolver::new(namespaces.clone(), pods.clone()));
        let (_trigger, shutdown) = shutdown_channel();
        let (tx, source) = ChannelWatchSource::channel(8);
        let (sink, mut events) = mpsc::channel(8);

        tx.send(Notification::Added(Arc::new(quota("1", &[], &[("cpu", "1")]))))
            .await
            .unwrap();
        drop(tx);
        let handle = tokio::spawn(run_translator_after_sync(
            SyncGate::new(
                registry,
                &["namespaces", "pods"],
                Duration::from_secs(60),
                shutdown,
            ),
            source,
            ResourceQuotaTranslator::new(resolver),
            TranslatorOptions::default(),
            sink,
            Arc::new(EventCounters::new()),
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        namespaces.apply(Event::Restarted(vec![Namespace {
            metadata: meta("team-a", None, "ns-a"),
            ..Default::default()
        }]));
        pods.apply(Event::Restarted(vec![pod("web-1", "team-a", "p1", &[])]));

        let added = events.recv().await.unwrap();
        assert_eq!(added.event_type, CongroupEventType::Added);
        assert!(added
            .object
            .parents
            .contains(&CongroupUid::new(NAMESPACE_KIND, "ns-a")));
        assert!(added
            .object
            .children
            .contains(&CongroupUid::new(POD_KIND, "p1")));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_sync_skips_translation() {
        let registry = ReadinessRegistry::new();
        registry.register("pods");
        let (trigger, shutdown) = shutdown_channel();
        let (tx, source) = ChannelWatchSource::channel(8);
        let (sink, mut events) = mpsc::channel(8);
        tx.send(Notification::Added(Arc::new(quota("1", &[], &[]))))
            .await
            .unwrap();

        trigger.trigger();
        run_translator_after_sync(
            SyncGate::new(registry, &["pods"], Duration::from_secs(60), shutdown),
            source,
            translator(),
            TranslatorOptions::default(),
            sink,
            Arc::new(EventCounters::new()),
        )
        .await
        .unwrap();
        assert!(events.recv().await.is_none());
    }
}
