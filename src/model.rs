//! Logical shape of the entities and events streamed to the aggregation service.

// System
use std::collections::{BTreeMap, BTreeSet};

// Third Party
use serde::{Deserialize, Serialize};

/// Reference to one entity, unique per `(kind, id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CongroupUid {
    pub kind: String,
    pub id: String,
}

impl CongroupUid {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetric {
    pub name: String,
    pub value: f64,
}

/// Complete snapshot of one cluster object's externally visible state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerGroup {
    pub uid: CongroupUid,
    pub tags: BTreeMap<String, String>,
    pub metrics: Vec<AppMetric>,
    pub parents: BTreeSet<CongroupUid>,
    pub children: BTreeSet<CongroupUid>,
}

impl ContainerGroup {
    pub fn new(uid: CongroupUid) -> Self {
        Self {
            uid,
            tags: BTreeMap::new(),
            metrics: Vec::new(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    pub fn push_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.push(AppMetric {
            name: name.into(),
            value,
        });
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|metric| metric.name == name)
            .map(|metric| metric.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CongroupEventType {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CongroupUpdateEvent {
    #[serde(rename = "type")]
    pub event_type: CongroupEventType,
    pub object: ContainerGroup,
}

impl CongroupUpdateEvent {
    pub fn new(event_type: CongroupEventType, object: ContainerGroup) -> Self {
        Self { event_type, object }
    }
}
