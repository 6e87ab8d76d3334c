use std::ops::Deref;
use std::sync::Arc;

use super::error::SandboxError;
use super::handle::SandboxHandle;

/// Owns a sandbox for the length of one episode.
///
/// `release()` is the normal path. A lease dropped without it (panic,
/// cancelled task) schedules the release on the current runtime so the
/// container or workspace is still reclaimed.
pub struct SandboxLease {
    handle: Arc<dyn SandboxHandle>,
    released: bool,
}

impl SandboxLease {
    pub fn new(handle: Box<dyn SandboxHandle>) -> Self {
        Self {
            handle: Arc::from(handle),
            released: false,
        }
    }

    pub fn handle(&self) -> &dyn SandboxHandle {
        self.handle.as_ref()
    }

    pub async fn release(mut self) -> Result<(), SandboxError> {
        self.released = true;
        self.handle.release().await
    }
}

impl Deref for SandboxLease {
    type Target = dyn SandboxHandle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handle = Arc::clone(&self.handle);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::warn!(sandbox_id = %handle.id(), "lease dropped without release, releasing in background");
                rt.spawn(async move {
                    if let Err(e) = handle.release().await {
                        tracing::error!(sandbox_id = %handle.id(), error = %e, "background release failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(sandbox_id = %handle.id(), "lease dropped outside a runtime, sandbox leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::local::LocalProcessProvider;
    use crate::sandbox::provider::SandboxProvider;
    use crate::sandbox::types::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn spec(id: &str) -> SandboxSpec {
        SandboxSpec {
            workspace_id: id.into(),
            image: None,
            resources: ResourceHints::default(),
            env: BTreeMap::new(),
            mounts: vec![],
            network: NetworkMode::Disabled,
            labels: BTreeMap::new(),
        }
    }

    fn provider(tmp: &tempfile::TempDir) -> LocalProcessProvider {
        LocalProcessProvider::new(LocalConfig {
            root_dir: tmp.path().join("sandboxes"),
            ..LocalConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn explicit_release_reclaims() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(&tmp);
        let lease = SandboxLease::new(provider.acquire(spec("lease-a")).await.unwrap());

        let out = lease
            .execute(ExecRequest::new("echo ok", Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "ok");

        lease.release().await.unwrap();
        assert_eq!(provider.live_count(), 0);
    }

    #[tokio::test]
    async fn dropped_lease_releases_in_background() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(&tmp);
        let lease = SandboxLease::new(provider.acquire(spec("lease-b")).await.unwrap());
        assert_eq!(provider.live_count(), 1);
        drop(lease);

        for _ in 0..50 {
            if provider.live_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(provider.live_count(), 0);
        assert!(!tmp.path().join("sandboxes").join("lease-b").exists());
    }
}
