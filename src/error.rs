use std::fmt;
use std::io;
use thiserror::Error;

/// Why a spawn attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailure {
    /// The script or interpreter does not exist
    NotFound,
    /// The script exists but cannot be executed
    PermissionDenied,
    /// The OS refused to create another process (EAGAIN, ENOMEM, EMFILE)
    ResourceExhausted,
    Other,
}

impl SpawnFailure {
    /// Classify an OS error returned by the spawn syscall
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnFailure::NotFound,
            io::ErrorKind::PermissionDenied => SpawnFailure::PermissionDenied,
            io::ErrorKind::OutOfMemory | io::ErrorKind::WouldBlock => {
                SpawnFailure::ResourceExhausted
            }
            _ => match err.raw_os_error() {
                Some(code) if is_exhaustion_errno(code) => {
                    SpawnFailure::ResourceExhausted
                }
                _ => SpawnFailure::Other,
            },
        }
    }
}

#[cfg(unix)]
fn is_exhaustion_errno(code: i32) -> bool {
    use nix::errno::Errno;
    matches!(
        Errno::from_raw(code),
        Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE
    )
}

#[cfg(not(unix))]
fn is_exhaustion_errno(_code: i32) -> bool {
    false
}

impl fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnFailure::NotFound => write!(f, "not found"),
            SpawnFailure::PermissionDenied => write!(f, "permission denied"),
            SpawnFailure::ResourceExhausted => write!(f, "resource exhausted"),
            SpawnFailure::Other => write!(f, "spawn failed"),
        }
    }
}

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Process-related errors
    #[error("Failed to spawn '{name}' ({kind}): {message}")]
    SpawnError {
        name: String,
        kind: SpawnFailure,
        message: String,
    },

    #[error("Process {0} is not running")]
    NotRunning(u32),

    #[error("Failed to sample memory of process {0}: {1}")]
    SampleError(u32, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Supervisor errors
    #[error("Invalid application spec: {0}")]
    InvalidSpec(String),

    #[error("Slot {0} does not exist")]
    SlotNotFound(usize),

    #[error("Supervisor for slot {0} has shut down")]
    SupervisorGone(usize),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WardenError {
    pub(crate) fn spawn(name: &str, err: &io::Error) -> Self {
        WardenError::SpawnError {
            name: name.to_string(),
            kind: SpawnFailure::from_io(err),
            message: err.to_string(),
        }
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_spawn_failures() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(SpawnFailure::from_io(&not_found), SpawnFailure::NotFound);

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            SpawnFailure::from_io(&denied),
            SpawnFailure::PermissionDenied
        );

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(SpawnFailure::from_io(&other), SpawnFailure::Other);
    }

    #[cfg(unix)]
    #[test]
    fn test_classify_errno_exhaustion() {
        let eagain = io::Error::from_raw_os_error(nix::errno::Errno::EAGAIN as i32);
        assert_eq!(
            SpawnFailure::from_io(&eagain),
            SpawnFailure::ResourceExhausted
        );
    }

    #[test]
    fn test_spawn_error_message() {
        let err = WardenError::spawn("api", &io::Error::from(io::ErrorKind::NotFound));
        let msg = err.to_string();
        assert!(msg.contains("api"));
        assert!(msg.contains("not found"));
    }
}
