//! qsa-monitor: monitoring channel between the QSA admin and QGIS Server workers.

mod version;

pub mod bridge;
pub mod link;
pub mod probe;
pub mod registry;
pub mod transport;

pub use bridge::protocol::{Command, Reply, StatsReport, WorkerMetadata};
pub use link::{DEFAULT_REQUEST_TIMEOUT, LinkInfo, RequestError, WorkerId, WorkerLink};
pub use probe::{
    Backoff, FixedBackoff, LogBuffer, LogBufferLayer, MetadataSource, Probe, ProbeConfig,
    ProbeHandle, ProbeState, RequestGuard, RequestHook, RequestInfo, Responder, StaticMetadata,
    StatsAccumulator,
};
pub use registry::{Registry, RegistryConfig, RegistryError};
pub use version::QSA_MONITOR_VERSION;
