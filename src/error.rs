use std::{fmt, io, path::Path};

use thiserror::Error;

/// Classification used when a caller has to decide between retrying,
/// skipping an instance or aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    NotSupported,
    InvalidConfig,
    Disabled,
    PermissionDenied,
    RemoteUnavailable,
    AlreadyExists,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::InvalidConfig => "invalid config",
            ErrorKind::Disabled => "disabled",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::RemoteUnavailable => "remote unavailable",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Io => "i/o error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{host}: {path} not found")]
    NotFound { host: String, path: String },
    #[error("{0}")]
    NotSupported(String),
    #[error("invalid configuration in {path}: {reason}")]
    InvalidConfig { path: String, reason: String },
    #[error("{0} is disabled")]
    Disabled(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{host}: remote unavailable: {reason}")]
    RemoteUnavailable { host: String, reason: String },
    #[error("{host}: {path} already exists")]
    AlreadyExists { host: String, path: String },
    #[error("{host}: {op} {path}: {source}")]
    Io {
        host: String,
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound { .. } => ErrorKind::NotFound,
            FleetError::NotSupported(_) => ErrorKind::NotSupported,
            FleetError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            FleetError::Disabled(_) => ErrorKind::Disabled,
            FleetError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            FleetError::RemoteUnavailable { .. } => ErrorKind::RemoteUnavailable,
            FleetError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FleetError::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn not_found(host: &str, path: &Path) -> Self {
        FleetError::NotFound {
            host: host.to_string(),
            path: path.display().to_string(),
        }
    }

    pub fn invalid_config(path: &Path, reason: impl Into<String>) -> Self {
        FleetError::InvalidConfig {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn remote(host: &str, reason: impl fmt::Display) -> Self {
        FleetError::RemoteUnavailable {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a local filesystem error, folding the kinds callers branch on
    /// into their dedicated variants.
    pub fn from_io(host: &str, op: &'static str, path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => FleetError::not_found(host, path),
            io::ErrorKind::AlreadyExists => FleetError::AlreadyExists {
                host: host.to_string(),
                path: path.display().to_string(),
            },
            io::ErrorKind::PermissionDenied => FleetError::PermissionDenied(format!(
                "{host}: {op} {}: {source}",
                path.display()
            )),
            _ => FleetError::Io {
                host: host.to_string(),
                op,
                path: path.display().to_string(),
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn io_errors_fold_into_taxonomy() {
        let path = PathBuf::from("/opt/fleet/probe/probes/p1/probe.json");
        let missing = FleetError::from_io(
            "localhost",
            "read",
            &path,
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert!(missing.is_not_found());

        let denied = FleetError::from_io(
            "localhost",
            "write",
            &path,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let other = FleetError::from_io(
            "localhost",
            "write",
            &path,
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(other.kind(), ErrorKind::Io);
        assert!(other.to_string().contains("disk full"));
    }
}
