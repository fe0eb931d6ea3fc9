// System
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Third Party
use signal_hook::consts::{SIGINT, SIGTERM};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tag namespace shared by every Kubernetes derived entity.
pub const KUBERNETES_TAG_PREFIX: &str = "kubernetes.";

pub fn init_tracing(crate_name: &str, level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", crate_name, level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Sending half of the process-wide shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // No receivers left means nothing is waiting on shutdown.
        let _ = self.tx.send(true);
    }
}

/// Receiving half of the shutdown signal. Every cancelable wait selects on [`Shutdown::wait`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Never resolves if the trigger is dropped
    /// without firing.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleeps for `duration`. Returns `false` if shutdown interrupted the sleep.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Turns SIGINT/SIGTERM into a shutdown request. A second signal exits the process immediately.
pub fn setup_exit_hooks(trigger: ShutdownTrigger) -> Result<(), std::io::Error> {
    let requested = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        // Registered first so that it sees the flag set by an earlier signal.
        signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&requested))?;
        signal_hook::flag::register(signal, Arc::clone(&requested))?;
    }

    tokio::spawn(async move {
        while !requested.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Received shutdown signal, stopping collector...");
        trigger.trigger();
    });
    Ok(())
}

/// Identity used as the admission lease holder.
pub fn holder_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| {
            let identity = format!("collector-{:08x}", rand::random::<u32>());
            warn!("Neither POD_NAME nor HOSTNAME is set, using {}", identity);
            identity
        })
}
