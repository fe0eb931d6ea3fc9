//! Per-node collector that mirrors cluster objects, translates their changes into
//! [`model::CongroupUpdateEvent`]s and streams them to a central aggregation service.
//!
//! The connection to that service is admission controlled so a whole fleet restarting at once
//! does not overwhelm it: during cold start a fleet-proportional random delay and a lease from
//! [`lease::AdmissionAuthority`] gate the first connection, and every retry after a failure
//! follows the jittered ladder in [`backoff`].

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod lease;
pub mod model;
pub mod orchestrator;
pub mod quantity;
pub mod relations;
pub mod resourcequota;
pub mod source;
pub mod translator;
pub mod utils;

pub use config::CollectorConfig;
pub use error::{CollectorError, LeaseError, Result};
pub use model::{CongroupEventType, CongroupUid, CongroupUpdateEvent, ContainerGroup};
pub use orchestrator::ConnectionOrchestrator;
