//! Environment snapshot answered by the `metadata` command.

use crate::bridge::protocol::WorkerMetadata;

/// Something that can describe the worker's environment on demand.
pub trait MetadataSource: Send + Sync {
    fn snapshot(&self) -> WorkerMetadata;
}

/// Fixed metadata captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata(pub WorkerMetadata);

impl MetadataSource for StaticMetadata {
    fn snapshot(&self) -> WorkerMetadata {
        self.0.clone()
    }
}

impl<F> MetadataSource for F
where
    F: Fn() -> WorkerMetadata + Send + Sync,
{
    fn snapshot(&self) -> WorkerMetadata {
        self()
    }
}
