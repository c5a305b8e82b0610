//! Authenticated connection to the etcd cluster.
//!
//! TLS is always on: the CA certificate verifies the servers, and the client
//! authenticates with either a certificate pair or a username/password.

use std::path::Path;

use etcd_client::{Certificate, Client, ConnectOptions, Identity, TlsOptions};
use tokio::fs;
use tracing::{debug, info};
use zonefile_sync_core::SyncError;

use crate::config::{Credentials, Settings};

async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, SyncError> {
    fs::read(path).await.map_err(|e| {
        SyncError::Connection(format!("Failed to read {} {}: {}", what, path.display(), e))
    })
}

/// Build the connection options (TLS material and credentials) for `settings`.
pub async fn connect_options(settings: &Settings) -> Result<ConnectOptions, SyncError> {
    let ca = read_pem(&settings.ca_cert_path, "root certificate file").await?;
    let mut tls = TlsOptions::new().ca_certificate(Certificate::from_pem(ca));
    let mut options = ConnectOptions::new();

    match &settings.credentials {
        Credentials::Certificate {
            cert_path,
            key_path,
        } => {
            let cert = read_pem(cert_path, "user certificate").await?;
            let key = read_pem(key_path, "user key").await?;
            tls = tls.identity(Identity::from_pem(cert, key));
            debug!("Using certificate authentication ({})", cert_path.display());
        }
        Credentials::Password { username, password } => {
            options = options.with_user(username.clone(), password.clone());
            debug!("Using password authentication as {}", username);
        }
    }

    options = options.with_tls(tls);
    if let Some(timeout) = settings.connection_timeout {
        options = options.with_connect_timeout(timeout);
    }
    Ok(options)
}

/// Connect to the configured endpoints.
pub async fn connect(settings: &Settings) -> Result<Client, SyncError> {
    let options = connect_options(settings).await?;
    let client = Client::connect(&settings.endpoints, Some(options))
        .await
        .map_err(|e| SyncError::Connection(e.to_string()))?;
    info!("Connected to etcd at {}", settings.endpoints.join(","));
    Ok(client)
}
