use std::io;

/// Errors from sandbox operations.
///
/// Backends map their internal errors into these variants. A command that
/// runs past its deadline is not an error: it comes back as an
/// `ExecResult` with `timed_out` set.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("provision failed: {0}")]
    Provision(String),

    #[error("sandbox already released: {0}")]
    Released(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("path escapes workspace: {0}")]
    PathEscape(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Whether the failure concerns only the requested path, leaving the
    /// sandbox usable. These are reported back to the agent instead of
    /// ending the episode.
    pub fn is_path_error(&self) -> bool {
        match self {
            SandboxError::PathEscape(_) => true,
            SandboxError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::IsADirectory
                    | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_displays_message() {
        let err = SandboxError::Unsupported("gpu passthrough");
        assert_eq!(err.to_string(), "unsupported operation: gpu passthrough");
    }

    #[test]
    fn provision_displays_reason() {
        let err = SandboxError::Provision("image missing".into());
        assert_eq!(err.to_string(), "provision failed: image missing");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn missing_file_is_a_path_error() {
        let err: SandboxError = io::Error::new(io::ErrorKind::NotFound, "nope").into();
        assert!(err.is_path_error());
        assert!(SandboxError::PathEscape("../x".into()).is_path_error());
    }

    #[test]
    fn backend_failures_are_not_path_errors() {
        assert!(!SandboxError::Backend("daemon gone".into()).is_path_error());
        assert!(!SandboxError::Exec("spawn failed".into()).is_path_error());
        assert!(!SandboxError::Released("sbx-1".into()).is_path_error());
        let broken_pipe: SandboxError = io::Error::new(io::ErrorKind::BrokenPipe, "x").into();
        assert!(!broken_pipe.is_path_error());
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
