use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;

/// Filesystem jail: workspace creation, path containment, file transfer.
///
/// All guest paths are validated to stay within the workspace root.
/// This is NOT a chroot; it is path validation for the local backend.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a new jail rooted at `root`. Creates the directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create workspace dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a guest path to a host path inside the workspace root.
    /// `..` segments are normalized without touching the filesystem and
    /// anything that would climb above the root is rejected.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        let guest = Path::new(guest_path);
        let relative = guest.strip_prefix("/").unwrap_or(guest);

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::PathEscape(guest_path.to_string()));
                    }
                }
                _ => {}
            }
        }

        // Canonical root keeps symlinked temp dirs (/var vs /private/var) consistent.
        let root_canonical = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());

        Ok(root_canonical.join(normalized))
    }

    pub fn write_file(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let path = self.resolve(guest_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    pub fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.resolve(guest_path)?;
        Ok(std::fs::read(&path)?)
    }

    /// Copy a host file or directory tree into the workspace.
    pub fn copy_in(&self, host_path: &Path, guest_path: &str) -> Result<(), SandboxError> {
        let target = self.resolve(guest_path)?;
        copy_recursive(host_path, &target)
    }

    /// Copy a workspace file or directory tree out to the host.
    pub fn copy_out(&self, guest_path: &str, host_path: &Path) -> Result<(), SandboxError> {
        let source = self.resolve(guest_path)?;
        copy_recursive(&source, host_path)
    }

    /// Remove the entire workspace directory.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

fn copy_recursive(from: &Path, to: &Path) -> Result<(), SandboxError> {
    let meta = std::fs::metadata(from)?;
    if meta.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}
