// System
use std::sync::Arc;
use std::time::Duration;

// Third Party
use clap::Parser;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, ResourceQuota};
use kube::{
    api::{Api, ListParams},
    Client,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

// Local
use kube_congroup_rs::{
    connection::TcpJsonConnector,
    lease::{KubeLeasePool, LeaseClient},
    relations::RelationshipResolver,
    resourcequota::{ResourceQuotaTranslator, RESOURCE_QUOTA_RESOURCE},
    source::{wait_for_sync, KubeWatchSource, Mirror, ReadinessRegistry, SyncGate},
    translator::{log_event_counts, run_translator_after_sync, EventCounters, TranslatorOptions},
    utils::{holder_identity, init_tracing, setup_exit_hooks, shutdown_channel},
    CollectorConfig, ConnectionOrchestrator,
};

/// Streams cluster state changes to the aggregation service.
#[derive(Parser, Debug)]
#[command(name = "collector", version)]
struct Args {
    #[arg(long, env = "CONGROUP_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Address of the aggregation service
    #[arg(long, env = "CONGROUP_COLLECTOR_ADDRESS", default_value = "127.0.0.1:6443")]
    collector_address: String,

    #[arg(long, env = "CONGROUP_MIN_BACKOFF_SECS", default_value_t = 60)]
    min_backoff_secs: u64,

    #[arg(long, env = "CONGROUP_MAX_BACKOFF_SECS", default_value_t = 3600)]
    max_backoff_secs: u64,

    /// Uptime after which a failed connection restarts the backoff ladder (defaults to the max
    /// backoff)
    #[arg(long, env = "CONGROUP_RECOVERY_THRESHOLD_SECS")]
    recovery_threshold_secs: Option<u64>,

    /// Number of concurrent cold start leases; 0 disables cold start admission
    #[arg(long, env = "CONGROUP_COLD_START_NUM", default_value_t = 0)]
    cold_start_num: u32,

    #[arg(long, env = "CONGROUP_MAX_COLD_START_DURATION_SECS", default_value_t = 900)]
    max_cold_start_duration_secs: u64,

    #[arg(long, env = "CONGROUP_MAX_WAIT_FOR_LEASE_SECS", default_value_t = 300)]
    max_wait_for_lease_secs: u64,

    /// Seconds of initial connection delay per cluster node
    #[arg(long, env = "CONGROUP_PER_NODE_CONN_DELAY", default_value_t = 0.0)]
    per_node_conn_delay: f64,

    #[arg(long, env = "CONGROUP_MIN_RANDOM_CONN_DELAY_SECS", default_value_t = 0)]
    min_random_conn_delay_secs: u64,

    #[arg(long, env = "CONGROUP_MAX_RANDOM_CONN_DELAY_SECS", default_value_t = 0)]
    max_random_conn_delay_secs: u64,

    #[arg(long, env = "CONGROUP_EVENT_QUEUE_LEN", default_value_t = 1024)]
    event_queue_len: usize,

    #[arg(long, env = "CONGROUP_STARTUP_SYNC_WAIT_SECS", default_value_t = 60)]
    startup_sync_wait_secs: u64,

    /// 0 disables event count logging
    #[arg(long, env = "CONGROUP_EVENT_COUNTS_LOG_SECS", default_value_t = 60)]
    event_counts_log_secs: u64,

    #[arg(long, env = "CONGROUP_LEASE_NAMESPACE", default_value = "default")]
    lease_namespace: String,

    #[arg(long, env = "CONGROUP_LEASE_PREFIX", default_value = "congroup-cold-start")]
    lease_prefix: String,

    #[arg(long, env = "CONGROUP_LEASE_TTL_SECS", default_value_t = 30)]
    lease_ttl_secs: u64,

    #[arg(long, env = "CONGROUP_LEASE_POLL_MS", default_value_t = 2000)]
    lease_poll_ms: u64,

    /// Also send an update when only the resource version changed
    #[arg(long, env = "CONGROUP_EMIT_ON_VERSION_CHANGE", default_value_t = false)]
    emit_on_version_change: bool,
}

impl Args {
    fn config(&self) -> CollectorConfig {
        let max_backoff = Duration::from_secs(self.max_backoff_secs);
        CollectorConfig {
            min_backoff: Duration::from_secs(self.min_backoff_secs),
            max_backoff,
            recovery_threshold: self
                .recovery_threshold_secs
                .map(Duration::from_secs)
                .unwrap_or(max_backoff),
            cold_start_num: self.cold_start_num,
            max_cold_start_duration: Duration::from_secs(self.max_cold_start_duration_secs),
            max_wait_for_lease: Duration::from_secs(self.max_wait_for_lease_secs),
            per_node_conn_delay: self.per_node_conn_delay,
            min_random_conn_delay: Duration::from_secs(self.min_random_conn_delay_secs),
            max_random_conn_delay: Duration::from_secs(self.max_random_conn_delay_secs),
            event_queue_len: self.event_queue_len,
            startup_sync_wait: Duration::from_secs(self.startup_sync_wait_secs),
            event_counts_log_time: Duration::from_secs(self.event_counts_log_secs),
            lease_namespace: self.lease_namespace.clone(),
            lease_prefix: self.lease_prefix.clone(),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            lease_poll_interval: Duration::from_millis(self.lease_poll_ms),
            collector_address: self.collector_address.clone(),
            ..Default::default()
        }
    }
}

/// Fleet size used to scale the initial connection delay. Zero if the nodes cannot be listed.
async fn count_nodes(client: &Client) -> u32 {
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list_metadata(&ListParams::default()).await {
        Ok(list) => u32::try_from(list.items.len()).unwrap_or(u32::MAX),
        Err(e) => {
            warn!("Failed to count cluster nodes: {}", e);
            0
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    init_tracing("kube_congroup_rs", args.log_level);
    let config = args.config();
    config.validate()?;

    let (trigger, mut shutdown) = shutdown_channel();
    setup_exit_hooks(trigger)?;

    let client = Client::try_default().await?;
    let node_count = count_nodes(&client).await;
    info!(nodes = node_count, "Starting collector");

    let registry = ReadinessRegistry::new();
    let namespaces = Arc::new(Mirror::<Namespace>::with_registry(
        "namespaces",
        registry.clone(),
    ));
    let pods = Arc::new(Mirror::<Pod>::with_registry("pods", registry.clone()));
    let quotas = Arc::new(Mirror::<ResourceQuota>::with_registry(
        RESOURCE_QUOTA_RESOURCE,
        registry.clone(),
    ));

    tokio::spawn(
        KubeWatchSource::new(
            Api::all(client.clone()),
            Arc::clone(&namespaces),
            config.watcher_backoff(),
            shutdown.clone(),
        )
        .run_mirror(),
    );
    tokio::spawn(
        KubeWatchSource::new(
            Api::all(client.clone()),
            Arc::clone(&pods),
            config.watcher_backoff(),
            shutdown.clone(),
        )
        .run_mirror(),
    );

    let (events_tx, events_rx) = mpsc::channel(config.event_queue_len);
    let counters = Arc::new(EventCounters::new());
    let resolver = Arc::new(RelationshipResolver::new(namespaces, pods));
    let translator = tokio::spawn(run_translator_after_sync(
        SyncGate::new(
            registry.clone(),
            &["namespaces", "pods"],
            config.startup_sync_wait,
            shutdown.clone(),
        ),
        KubeWatchSource::new(
            Api::all(client.clone()),
            quotas,
            config.watcher_backoff(),
            shutdown.clone(),
        ),
        ResourceQuotaTranslator::new(resolver),
        TranslatorOptions {
            emit_on_version_change: args.emit_on_version_change,
        },
        events_tx,
        Arc::clone(&counters),
    ));
    tokio::spawn(log_event_counts(
        counters,
        config.event_counts_log_time,
        shutdown.clone(),
    ));

    wait_for_sync(
        &registry,
        &["namespaces", "pods", RESOURCE_QUOTA_RESOURCE],
        config.startup_sync_wait,
        &mut shutdown,
    )
    .await;

    let lease_client = config.cold_start_enabled().then(|| {
        LeaseClient::new(KubeLeasePool::new(
            client.clone(),
            &config.lease_namespace,
            &config.lease_prefix,
            config.cold_start_num,
            &holder_identity(),
            config.lease_ttl,
            config.lease_poll_interval,
        ))
    });
    let connector = TcpJsonConnector::new(&config.collector_address);
    ConnectionOrchestrator::new(
        config,
        connector,
        lease_client,
        events_rx,
        node_count,
        shutdown,
    )
    .run()
    .await?;

    match translator.await? {
        Ok(()) => info!("Collector stopped"),
        Err(e) => warn!("Translator stopped: {}", e),
    }
    Ok(())
}
