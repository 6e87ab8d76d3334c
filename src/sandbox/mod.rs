pub mod backends;
pub mod error;
pub mod handle;
pub mod lease;
pub mod local_host;
pub mod provider;
pub mod types;

pub use error::SandboxError;
pub use handle::SandboxHandle;
pub use lease::SandboxLease;
pub use provider::SandboxProvider;
pub use types::*;

use backends::docker::DockerProvider;
use backends::local::LocalProcessProvider;

/// Build a sandbox provider from runtime config.
pub fn build_provider(
    config: SandboxRuntimeConfig,
) -> Result<Box<dyn SandboxProvider>, SandboxError> {
    match config {
        SandboxRuntimeConfig::Local(c) => {
            tracing::info!(
                root_dir = %c.root_dir.display(),
                "initializing local process sandbox provider"
            );
            Ok(Box::new(LocalProcessProvider::new(c)?))
        }
        SandboxRuntimeConfig::Docker(c) => {
            tracing::info!(
                docker_bin = %c.docker_bin,
                default_image = %c.default_image,
                "initializing docker sandbox provider"
            );
            Ok(Box::new(DockerProvider::new(c)?))
        }
    }
}
