//! Decides when the node may open its event stream and keeps it open.
//!
//! With cold start enabled, startup goes through a fleet-proportional random delay and an
//! admission lease; both are capped by the cold start limits. Every failure after that (connect, send, admission) sleeps on the jittered
//! backoff ladder before trying again.

// System
use std::time::Duration;

// Third Party
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

// Local
use crate::backoff::{random_connection_delay, Backoff};
use crate::config::CollectorConfig;
use crate::connection::{Connector, EventConnection};
use crate::error::{LeaseError, Result};
use crate::lease::{AdmissionAuthority, LeaseClient};
use crate::model::CongroupUpdateEvent;
use crate::utils::Shutdown;

enum ConnectionState {
    ColdStart,
    Admission { deadline: Instant },
    Connect,
    Streaming(Box<dyn EventConnection>),
    /// Carries how long the failed attempt ran.
    Backoff(Duration),
}

pub struct ConnectionOrchestrator<C, A> {
    config: CollectorConfig,
    connector: C,
    lease_client: Option<LeaseClient<A>>,
    events: mpsc::Receiver<CongroupUpdateEvent>,
    node_count: u32,
    shutdown: Shutdown,
    backoff: Backoff,
    started: Instant,
    attempt_started: Instant,
    /// An event whose delivery failed; sent first on the next connection.
    unsent: Option<CongroupUpdateEvent>,
}

impl<C, A> ConnectionOrchestrator<C, A>
where
    C: Connector,
    A: AdmissionAuthority,
{
    pub fn new(
        config: CollectorConfig,
        connector: C,
        lease_client: Option<LeaseClient<A>>,
        events: mpsc::Receiver<CongroupUpdateEvent>,
        node_count: u32,
        shutdown: Shutdown,
    ) -> Self {
        let backoff = Backoff::new(config.connection_backoff());
        let now = Instant::now();
        Self {
            config,
            connector,
            lease_client,
            events,
            node_count,
            shutdown,
            backoff,
            started: now,
            attempt_started: now,
            unsent: None,
        }
    }

    /// Runs until shutdown or until every event producer has gone away.
    pub async fn run(mut self) -> Result<()> {
        let mut state = ConnectionState::ColdStart;
        loop {
            state = match state {
                ConnectionState::ColdStart => {
                    debug!("State: ColdStart");
                    match self.cold_start().await {
                        Some(next) => next,
                        None => return Ok(()),
                    }
                }
                ConnectionState::Admission { deadline } => {
                    debug!("State: Admission");
                    match self.admission(deadline).await {
                        Some(next) => next,
                        None => return Ok(()),
                    }
                }
                ConnectionState::Connect => {
                    debug!("State: Connect");
                    match self.connect().await {
                        Some(next) => next,
                        None => return Ok(()),
                    }
                }
                ConnectionState::Streaming(connection) => {
                    debug!("State: Streaming");
                    match self.stream(connection).await {
                        Some(next) => next,
                        None => return Ok(()),
                    }
                }
                ConnectionState::Backoff(runtime) => {
                    debug!("State: Backoff");
                    let delay = self.backoff.next(runtime);
                    warn!("Retrying connection in {:?}...", delay);
                    if !self.shutdown.sleep(delay).await {
                        return Ok(());
                    }
                    ConnectionState::Connect
                }
            };
        }
    }

    async fn cold_start(&mut self) -> Option<ConnectionState> {
        if !self.config.cold_start_enabled() {
            return Some(ConnectionState::Connect);
        }
        let delay = random_connection_delay(
            self.config.per_node_conn_delay,
            self.node_count,
            self.config.min_random_conn_delay,
            self.config.max_random_conn_delay,
        );
        if !delay.is_zero() {
            info!(
                nodes = self.node_count,
                "Delaying initial connection by {:?}", delay
            );
            if !self.shutdown.sleep(delay).await {
                return None;
            }
        }

        if self.lease_client.is_some() {
            Some(ConnectionState::Admission {
                deadline: Instant::now() + self.config.max_wait_for_lease,
            })
        } else {
            Some(ConnectionState::Connect)
        }
    }

    /// Time left before cold start is abandoned: the earlier of the lease wait `deadline` and the
    /// end of `max_cold_start_duration`.
    fn cold_start_remaining(&self, deadline: Instant) -> Duration {
        let window_end = self
            .started
            .checked_add(self.config.max_cold_start_duration)
            .map_or(deadline, |end| end.min(deadline));
        window_end.saturating_duration_since(Instant::now())
    }

    async fn admission(&mut self, deadline: Instant) -> Option<ConnectionState> {
        let Some(lease_client) = self.lease_client.as_ref() else {
            return Some(ConnectionState::Connect);
        };
        loop {
            let remaining = self.cold_start_remaining(deadline);
            if remaining.is_zero() {
                info!("Cold start window over, connecting without a lease");
                break;
            }

            let session_started = Instant::now();
            let outcome = time::timeout(remaining, lease_client.wait_lease(&mut self.shutdown)).await;
            match outcome {
                Ok(Ok(grant)) if grant.successful => {
                    info!("Admission lease granted");
                    break;
                }
                Ok(Ok(_)) => debug!("Admission lease denied, will retry"),
                Ok(Err(LeaseError::Cancelled)) => return None,
                Ok(Err(error)) => warn!("Failed to obtain admission lease: {}", error),
                Err(_) => {
                    info!("No admission lease after {:?}, connecting anyway", remaining);
                    break;
                }
            }

            let delay = self
                .backoff
                .next(session_started.elapsed())
                .min(self.cold_start_remaining(deadline));
            debug!("Retrying admission in {:?}", delay);
            if !self.shutdown.sleep(delay).await {
                return None;
            }
        }
        self.backoff.reset();
        Some(ConnectionState::Connect)
    }

    async fn connect(&mut self) -> Option<ConnectionState> {
        self.attempt_started = Instant::now();
        let result = tokio::select! {
            _ = self.shutdown.wait() => return None,
            result = self.connector.connect() => result,
        };
        match result {
            Ok(connection) => Some(ConnectionState::Streaming(connection)),
            Err(error) => {
                error!("Failed to connect to aggregation service: {}", error);
                Some(ConnectionState::Backoff(self.attempt_started.elapsed()))
            }
        }
    }

    async fn stream(&mut self, mut connection: Box<dyn EventConnection>) -> Option<ConnectionState> {
        loop {
            let event = match self.unsent.take() {
                Some(event) => event,
                None => {
                    tokio::select! {
                        _ = self.shutdown.wait() => return None,
                        event = self.events.recv() => match event {
                            Some(event) => event,
                            None => {
                                info!("Event producers stopped, closing stream");
                                return None;
                            }
                        },
                    }
                }
            };

            let sent = tokio::select! {
                _ = self.shutdown.wait() => return None,
                sent = connection.send(&event) => sent,
            };
            if let Err(error) = sent {
                error!("Event stream broken: {}", error);
                self.unsent = Some(event);
                return Some(ConnectionState::Backoff(self.attempt_started.elapsed()));
            }
        }
    }
}
