use std::path::PathBuf;

/// Errors surfaced by the synchronisation engine.
///
/// Every variant is fatal for the running session; the only retry in the
/// engine happens inside `StoreClient::snapshot` before an error is built.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to etcd servers: {0}")]
    Connection(String),

    #[error("Failed to retrieve zonefiles after {attempts} attempt(s): {message}")]
    Snapshot { attempts: u32, message: String },

    #[error("Failed to watch zonefiles changes: {0}")]
    Watch(String),

    #[error("Error {op} zonefile {}: {source}", path.display())]
    Local {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid zonefile key {0:?}: keys must be a single file name")]
    InvalidKey(String),
}

impl SyncError {
    pub(crate) fn local(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Local {
            op,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_error_message_names_path() {
        let err = SyncError::local(
            "deleting",
            "/var/lib/zones/a.zone",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("Error deleting zonefile /var/lib/zones/a.zone"));
    }

    #[test]
    fn test_snapshot_error_reports_attempts() {
        let err = SyncError::Snapshot {
            attempts: 3,
            message: "etcdserver: unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to retrieve zonefiles after 3 attempt(s): etcdserver: unavailable"
        );
    }
}
