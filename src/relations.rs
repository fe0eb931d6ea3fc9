//! Parent/child references between entities of different kinds, computed from the mirrors.
//!
//! Every query enumerates the target kind's full snapshot and returns nothing while that kind has
//! not finished its initial sync.

// System
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// Third Party
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Resource;

// Local
use crate::model::CongroupUid;
use crate::source::ObjectStore;

pub const NAMESPACE_KIND: &str = "k8s_namespace";
pub const POD_KIND: &str = "k8s_pod";

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_labels(match_labels: BTreeMap<String, String>) -> Self {
        Self { match_labels }
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.match_labels.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .map(|found| found == value)
                .unwrap_or(false)
        })
    }
}

/// References to every object of `store` in `namespace` whose labels match `selector`.
pub fn uids_in_namespace<K: Resource>(
    store: &dyn ObjectStore<K>,
    kind: &str,
    namespace: &str,
    selector: &LabelSelector,
) -> Vec<CongroupUid> {
    if !store.is_ready() {
        return Vec::new();
    }
    store
        .list()
        .iter()
        .filter(|obj| obj.meta().namespace.as_deref() == Some(namespace))
        .filter(|obj| selector.matches(obj.meta().labels.as_ref()))
        .filter_map(|obj| {
            obj.meta()
                .uid
                .as_ref()
                .map(|uid| CongroupUid::new(kind, uid.clone()))
        })
        .collect()
}

pub struct RelationshipResolver {
    namespaces: Arc<dyn ObjectStore<Namespace>>,
    pods: Arc<dyn ObjectStore<Pod>>,
}

impl RelationshipResolver {
    pub fn new(namespaces: Arc<dyn ObjectStore<Namespace>>, pods: Arc<dyn ObjectStore<Pod>>) -> Self {
        Self { namespaces, pods }
    }

    /// Adds the entity of the namespace named `namespace` as a parent.
    pub fn add_namespace_parents(&self, parents: &mut BTreeSet<CongroupUid>, namespace: Option<&str>) {
        let Some(namespace) = namespace else {
            return;
        };
        if !self.namespaces.is_ready() {
            return;
        }
        let found = self
            .namespaces
            .list()
            .into_iter()
            .find(|ns| ns.metadata.name.as_deref() == Some(namespace));
        if let Some(uid) = found.and_then(|ns| ns.metadata.uid.clone()) {
            parents.insert(CongroupUid::new(NAMESPACE_KIND, uid));
        }
    }

    /// Adds every pod in `namespace` matching `selector` as a child.
    pub fn add_pod_children(
        &self,
        children: &mut BTreeSet<CongroupUid>,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) {
        if let Some(namespace) = namespace {
            children.extend(uids_in_namespace(
                self.pods.as_ref(),
                POD_KIND,
                namespace,
                selector,
            ));
        }
    }
}
