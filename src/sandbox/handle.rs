use std::path::Path;

use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// Handle to one live sandbox, bound to a single episode.
///
/// Guest paths are interpreted relative to the sandbox workspace; a
/// leading `/` is allowed and means the workspace root.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;
    fn backend_kind(&self) -> SandboxBackendKind;
    fn metadata(&self) -> &SandboxMetadata;

    // ── Exec ────────────────────────────────────────────────────

    /// Run a shell command to completion or until `req.timeout`.
    ///
    /// At the deadline the whole process tree is killed and the result
    /// comes back with `timed_out` set; this never blocks past the
    /// deadline plus the backend's kill grace.
    async fn execute(&self, req: ExecRequest) -> Result<ExecResult, SandboxError>;

    // ── Files ───────────────────────────────────────────────────

    async fn copy_in(&self, host_path: &Path, guest_path: &str) -> Result<(), SandboxError>;
    async fn copy_out(&self, guest_path: &str, host_path: &Path) -> Result<(), SandboxError>;
    async fn write_file(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxError>;
    async fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError>;

    // ── Lifecycle ───────────────────────────────────────────────

    /// Tear down all resources. Idempotent: later calls return `Ok(())`.
    async fn release(&self) -> Result<(), SandboxError>;
}
