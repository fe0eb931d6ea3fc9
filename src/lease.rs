//! Cold-start admission: a node asks a central authority for one of a bounded number of leases
//! before opening its event stream.

// System
use std::time::Duration;

// Third Party
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use kube::{
    api::{Api, ListParams},
    Client,
};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

// Local
use crate::error::LeaseError;
use crate::utils::Shutdown;

/// Answer of the admission authority. `successful == false` means "try again later".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub successful: bool,
}

/// One outstanding lease request.
#[async_trait]
pub trait LeaseSession: Send {
    /// Waits for the authority's reply.
    async fn recv(&mut self) -> Result<LeaseGrant, LeaseError>;
}

#[async_trait]
pub trait AdmissionAuthority: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn LeaseSession>, LeaseError>;
}

pub struct LeaseClient<A> {
    authority: A,
}

impl<A: AdmissionAuthority> LeaseClient<A> {
    pub fn new(authority: A) -> Self {
        Self { authority }
    }

    /// Opens a session and blocks until the authority replies, the session fails, or shutdown is
    /// requested.
    pub async fn wait_lease(&self, shutdown: &mut Shutdown) -> Result<LeaseGrant, LeaseError> {
        let mut session = tokio::select! {
            _ = shutdown.wait() => return Err(LeaseError::Cancelled),
            session = self.authority.open_session() => session?,
        };
        debug!("Lease session open, waiting for grant...");
        tokio::select! {
            _ = shutdown.wait() => Err(LeaseError::Cancelled),
            grant = session.recv() => grant,
        }
    }
}

/// Admission authority backed by a pool of `coordination.k8s.io` Lease objects named
/// `<prefix>-<slot>`. Holding any one slot admits the node.
pub struct KubeLeasePool {
    client: Client,
    namespace: String,
    prefix: String,
    size: u32,
    holder_id: String,
    lease_ttl: Duration,
    poll_interval: Duration,
}

impl KubeLeasePool {
    pub fn new(
        client: Client,
        namespace: &str,
        prefix: &str,
        size: u32,
        holder_id: &str,
        lease_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        info!(
            namespace,
            prefix,
            size,
            holder_id,
            "Initialized cold start lease pool"
        );
        Self {
            client,
            namespace: namespace.to_string(),
            prefix: prefix.to_string(),
            size,
            holder_id: holder_id.to_string(),
            lease_ttl,
            poll_interval,
        }
    }
}

#[async_trait]
impl AdmissionAuthority for KubeLeasePool {
    async fn open_session(&self) -> Result<Box<dyn LeaseSession>, LeaseError> {
        if self.size == 0 {
            return Err(LeaseError::Session("lease pool is empty".to_string()));
        }
        // Fails fast when the API server cannot be reached.
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        leases.list(&ListParams::default().limit(1)).await?;

        let locks = slot_order(&self.holder_id, self.size)
            .into_iter()
            .map(|slot| {
                LeaseLock::new(
                    self.client.clone(),
                    &self.namespace,
                    LeaseLockParams {
                        holder_id: self.holder_id.clone(),
                        lease_name: format!("{}-{}", self.prefix, slot),
                        lease_ttl: self.lease_ttl,
                    },
                )
            })
            .collect();
        Ok(Box::new(KubeLeaseSession {
            locks,
            poll_interval: self.poll_interval,
        }))
    }
}

struct KubeLeaseSession {
    locks: Vec<LeaseLock>,
    poll_interval: Duration,
}

#[async_trait]
impl LeaseSession for KubeLeaseSession {
    async fn recv(&mut self) -> Result<LeaseGrant, LeaseError> {
        loop {
            for lock in &self.locks {
                let result = lock
                    .try_acquire_or_renew()
                    .await
                    .map_err(|e| LeaseError::Session(e.to_string()))?;
                if result.acquired_lease {
                    info!("Acquired cold start lease");
                    return Ok(LeaseGrant { successful: true });
                }
            }
            debug!("All cold start leases held, retrying in {:?}", self.poll_interval);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Order in which a holder probes the slots. Starting at a holder-specific slot keeps a fleet
/// from contending on slot 0.
pub fn slot_order(holder_id: &str, size: u32) -> Vec<u32> {
    if size == 0 {
        return Vec::new();
    }
    let digest = Sha256::digest(holder_id.as_bytes());
    let start = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % size;
    (0..size).map(|i| (start + i) % size).collect()
}
