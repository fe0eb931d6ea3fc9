//! Per-kind translation of watch notifications into [`CongroupUpdateEvent`]s.

// System
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

// Third Party
use kube::Resource;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// Local
use crate::error::{CollectorError, Result};
use crate::model::{CongroupEventType, CongroupUpdateEvent, ContainerGroup};
use crate::source::{DeleteState, Notification, SyncGate, WatchSource};
use crate::utils::Shutdown;

/// Kind-specific half of the translation: how an object becomes an entity and which of its
/// fields are observable.
pub trait CongroupTranslator<K>: Send + Sync {
    /// Resource name used for readiness and counters, e.g. `"resourcequotas"`.
    fn resource(&self) -> &'static str;

    /// Complete entity snapshot for `obj`, relationships included.
    fn congroup(&self, obj: &K) -> ContainerGroup;

    /// Equality over the observable fields. Must ignore the resource version.
    fn equivalent(&self, old: &K, new: &K) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslatorOptions {
    /// Also emit an update when only the resource version changed.
    pub emit_on_version_change: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountedEvent {
    Add,
    Update,
    UpdateAndSend,
    Delete,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub add: u64,
    pub update: u64,
    pub update_and_send: u64,
    pub delete: u64,
    pub dropped: u64,
}

/// Per-resource event counters, shared by every translator.
#[derive(Debug, Default)]
pub struct EventCounters {
    counts: Mutex<BTreeMap<&'static str, KindCounts>>,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, resource: &'static str, event: CountedEvent) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = counts.entry(resource).or_default();
        match event {
            CountedEvent::Add => entry.add += 1,
            CountedEvent::Update => entry.update += 1,
            CountedEvent::UpdateAndSend => entry.update_and_send += 1,
            CountedEvent::Delete => entry.delete += 1,
            CountedEvent::Dropped => entry.dropped += 1,
        }
    }

    pub fn get(&self, resource: &str) -> KindCounts {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .copied()
            .unwrap_or_default()
    }

    pub fn log(&self) {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for (resource, c) in counts.iter() {
            info!(
                resource = *resource,
                add = c.add,
                update = c.update,
                update_and_send = c.update_and_send,
                delete = c.delete,
                dropped = c.dropped,
                "Event counts"
            );
        }
    }
}

/// Logs the counters every `interval` until shutdown. A zero interval disables logging.
pub async fn log_event_counts(counters: Arc<EventCounters>, interval: Duration, mut shutdown: Shutdown) {
    if interval.is_zero() {
        return;
    }
    while shutdown.sleep(interval).await {
        counters.log();
    }
}

/// Consumes `source` until it ends, pushing accepted changes into `sink`.
///
/// Blocks when `sink` is full. Returns `CollectorError::ChannelClosed` if the consumer went away.
pub async fn run_translator<K, S, T>(
    mut source: S,
    translator: T,
    options: TranslatorOptions,
    sink: mpsc::Sender<CongroupUpdateEvent>,
    counters: Arc<EventCounters>,
) -> Result<()>
where
    K: Resource + Send + Sync,
    S: WatchSource<K>,
    T: CongroupTranslator<K>,
{
    let resource = translator.resource();
    info!(resource, "Starting translator...");
    while let Some(notification) = source.next().await {
        if let Some(event) = translate(&translator, options, &counters, notification) {
            debug!(
                resource,
                uid = %event.object.uid.id,
                event_type = ?event.event_type,
                "Sending event"
            );
            sink.send(event)
                .await
                .map_err(|_| CollectorError::ChannelClosed)?;
        }
    }
    info!(resource, "Translator stopped");
    Ok(())
}

/// [`run_translator`] for kinds whose entities carry relationships: notifications stay queued in
/// `source` until the mirrors behind `gate` have synced, so the first events already hold their
/// parents and children.
pub async fn run_translator_after_sync<K, S, T>(
    gate: SyncGate,
    source: S,
    translator: T,
    options: TranslatorOptions,
    sink: mpsc::Sender<CongroupUpdateEvent>,
    counters: Arc<EventCounters>,
) -> Result<()>
where
    K: Resource + Send + Sync,
    S: WatchSource<K>,
    T: CongroupTranslator<K>,
{
    if !gate.open().await {
        return Ok(());
    }
    run_translator(source, translator, options, sink, counters).await
}

/// Turns one notification into at most one event, recording counters either way.
pub fn translate<K, T>(
    translator: &T,
    options: TranslatorOptions,
    counters: &EventCounters,
    notification: Notification<K>,
) -> Option<CongroupUpdateEvent>
where
    K: Resource,
    T: CongroupTranslator<K> + ?Sized,
{
    let resource = translator.resource();
    match notification {
        Notification::Added(obj) => {
            counters.record(resource, CountedEvent::Add);
            Some(CongroupUpdateEvent::new(
                CongroupEventType::Added,
                translator.congroup(&obj),
            ))
        }
        Notification::Updated { old, new } => {
            counters.record(resource, CountedEvent::Update);
            let version_changed = options.emit_on_version_change
                && old.meta().resource_version != new.meta().resource_version;
            if version_changed || !translator.equivalent(&old, &new) {
                counters.record(resource, CountedEvent::UpdateAndSend);
                Some(CongroupUpdateEvent::new(
                    CongroupEventType::Updated,
                    translator.congroup(&new),
                ))
            } else {
                None
            }
        }
        Notification::Deleted(state) => {
            let tombstone = matches!(state, DeleteState::Tombstone(_));
            match state.into_last_known() {
                Some(obj) => {
                    if tombstone {
                        debug!(resource, "Resolved deletion tombstone to last known object");
                    }
                    counters.record(resource, CountedEvent::Delete);
                    Some(CongroupUpdateEvent::new(
                        CongroupEventType::Removed,
                        translator.congroup(&obj),
                    ))
                }
                None => {
                    warn!(resource, "Deletion tombstone without a usable object, dropping");
                    counters.record(resource, CountedEvent::Dropped);
                    None
                }
            }
        }
    }
}
