use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::{SandboxBackendKind, SandboxSpec, SandboxSummary};

/// Factory for sandboxes.
///
/// One provider is shared by every episode of a run; each `acquire()`
/// creates a fresh isolated context owned by the caller.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> SandboxBackendKind;

    /// Create a new sandbox from the given spec.
    async fn acquire(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError>;

    /// Sandboxes acquired from this provider and not yet released.
    async fn list(&self) -> Result<Vec<SandboxSummary>, SandboxError>;

    /// Number of live sandboxes; used to verify nothing leaks.
    fn live_count(&self) -> usize;
}
