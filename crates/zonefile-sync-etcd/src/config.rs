use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::info;
use zonefile_sync_core::{RetryPolicy, SyncError};

/// Configuration file picked up from the working directory when no
/// `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "./configs.json";

/// Command line / environment configuration for zonefile-sync.
///
/// When a JSON configuration file is found, it replaces every other setting.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "zonefile-sync")]
#[command(about = "Keeps a CoreDNS zone file directory synchronised with etcd")]
pub struct Config {
    /// JSON configuration file (defaults to ./configs.json when it exists)
    #[arg(long = "config", env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Directory the zone files are written to
    #[arg(long, env = "ZONEFILE_PATH")]
    pub zonefile_path: Option<String>,

    /// Comma-separated etcd endpoints
    #[arg(long, env = "ETCD_ENDPOINTS")]
    pub etcd_endpoints: Option<String>,

    /// Key prefix under which zone files are stored
    #[arg(long, env = "ETCD_KEY_PREFIX")]
    pub etcd_key_prefix: Option<String>,

    /// CA certificate used to verify the etcd servers
    #[arg(long, env = "CA_CERT_PATH")]
    pub ca_cert_path: Option<String>,

    /// Client certificate (certificate authentication)
    #[arg(long, env = "USER_CERT_PATH")]
    pub user_cert_path: Option<String>,

    /// Client private key (certificate authentication)
    #[arg(long, env = "USER_KEY_PATH")]
    pub user_key_path: Option<String>,

    /// Username (password authentication)
    #[arg(long, env = "ETCD_USERNAME")]
    pub etcd_username: Option<String>,

    /// Password (password authentication)
    #[arg(long, env = "ETCD_PASSWORD", hide_env_values = true)]
    pub etcd_password: Option<String>,

    /// Connection timeout in seconds (0 = library default)
    #[arg(long, default_value = "0", env = "CONNECTION_TIMEOUT")]
    pub connection_timeout: u64,

    /// Snapshot request timeout in seconds (0 = none)
    #[arg(long, default_value = "0", env = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    /// Retries for a snapshot read when etcd is unavailable
    #[arg(long, default_value = "0", env = "REQUEST_RETRIES")]
    pub request_retries: u32,

    /// Delay between snapshot retries in milliseconds
    #[arg(long, default_value = "100", env = "RETRY_INTERVAL_MS")]
    pub retry_interval_ms: u64,
}

/// Credentials nested under `UserAuth` in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct UserAuth {
    cert_path: String,
    key_path: String,
    username: String,
    password: String,
}

/// Unvalidated settings, from either the command line or a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawSettings {
    zonefiles_path: String,
    etcd_key_prefix: String,
    etcd_endpoints: String,
    ca_cert_path: String,
    user_auth: UserAuth,
    connection_timeout: u64,
    request_timeout: u64,
    request_retries: u32,
    retry_interval_ms: u64,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            zonefiles_path: String::new(),
            etcd_key_prefix: String::new(),
            etcd_endpoints: String::new(),
            ca_cert_path: String::new(),
            user_auth: UserAuth::default(),
            connection_timeout: 0,
            request_timeout: 0,
            request_retries: 0,
            retry_interval_ms: RetryPolicy::default().interval.as_millis() as u64,
        }
    }
}

impl From<&Config> for RawSettings {
    fn from(config: &Config) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Self {
            zonefiles_path: text(&config.zonefile_path),
            etcd_key_prefix: text(&config.etcd_key_prefix),
            etcd_endpoints: text(&config.etcd_endpoints),
            ca_cert_path: text(&config.ca_cert_path),
            user_auth: UserAuth {
                cert_path: text(&config.user_cert_path),
                key_path: text(&config.user_key_path),
                username: text(&config.etcd_username),
                password: text(&config.etcd_password),
            },
            connection_timeout: config.connection_timeout,
            request_timeout: config.request_timeout,
            request_retries: config.request_retries,
            retry_interval_ms: config.retry_interval_ms,
        }
    }
}

fn required(value: String, what: &str) -> Result<String, SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::Config(format!("{} cannot be empty", what)));
    }
    Ok(value)
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl RawSettings {
    fn validate(self) -> Result<Settings, SyncError> {
        let zonefiles_path = required(self.zonefiles_path, "Zone file path")?;
        let endpoints: Vec<String> = required(self.etcd_endpoints, "Etcd endpoints")?
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        if endpoints.is_empty() {
            return Err(SyncError::Config("Etcd endpoints cannot be empty".to_string()));
        }
        let ca_cert_path = required(self.ca_cert_path, "CA certificate path")?;
        let key_prefix = required(self.etcd_key_prefix, "Etcd key prefix")?;
        let credentials = Credentials::from_user_auth(self.user_auth)?;

        Ok(Settings {
            zonefiles_path: PathBuf::from(zonefiles_path),
            key_prefix,
            endpoints,
            ca_cert_path: PathBuf::from(ca_cert_path),
            credentials,
            connection_timeout: seconds(self.connection_timeout),
            request_timeout: seconds(self.request_timeout),
            retry: RetryPolicy::new(
                self.request_retries,
                Duration::from_millis(self.retry_interval_ms),
            ),
        })
    }
}

/// How the client authenticates to etcd. Exactly one method is configured.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Certificate { cert_path: PathBuf, key_path: PathBuf },
    Password { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Certificate { cert_path, key_path } => f
                .debug_struct("Certificate")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl Credentials {
    fn from_user_auth(auth: UserAuth) -> Result<Self, SyncError> {
        let has_cert = !auth.cert_path.is_empty() || !auth.key_path.is_empty();
        let has_password = !auth.username.is_empty() || !auth.password.is_empty();

        match (has_cert, has_password) {
            (true, true) => Err(SyncError::Config(
                "User credentials are ambiguous: set either a certificate pair or a username and password, not both"
                    .to_string(),
            )),
            (false, false) => Err(SyncError::Config(
                "User credentials are missing: set either a certificate pair or a username and password"
                    .to_string(),
            )),
            (true, false) => Ok(Credentials::Certificate {
                cert_path: PathBuf::from(required(auth.cert_path, "User certificate path")?),
                key_path: PathBuf::from(required(auth.key_path, "User key path")?),
            }),
            (false, true) => Ok(Credentials::Password {
                username: required(auth.username, "Username")?,
                password: required(auth.password, "Password")?,
            }),
        }
    }
}

/// Validated settings for one run of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub zonefiles_path: PathBuf,
    pub key_prefix: String,
    pub endpoints: Vec<String>,
    pub ca_cert_path: PathBuf,
    pub credentials: Credentials,
    pub connection_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Settings {
    /// Resolve settings from a configuration file if one is present,
    /// otherwise from flags and environment.
    pub fn load(config: &Config) -> Result<Self, SyncError> {
        let file = config.config_file.clone().or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });

        match file {
            Some(path) => {
                info!("Reading configuration from {}", path.display());
                Self::from_file(&path)
            }
            None => RawSettings::from(config).validate(),
        }
    }

    /// Read and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let bytes = std::fs::read(path).map_err(|e| {
            SyncError::Config(format!(
                "Error reading configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        let raw: RawSettings = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::Config(format!(
                "Error reading configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        raw.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cert_config() -> Config {
        Config::try_parse_from([
            "zonefile-sync",
            "--zonefile-path",
            "/var/lib/coredns/zonefiles",
            "--etcd-endpoints",
            "https://10.0.0.1:2379, https://10.0.0.2:2379",
            "--etcd-key-prefix",
            "/coredns/zonefiles/",
            "--ca-cert-path",
            "/etc/certs/ca.pem",
            "--user-cert-path",
            "/etc/certs/root.pem",
            "--user-key-path",
            "/etc/certs/root.key",
            "--request-timeout",
            "5",
            "--request-retries",
            "3",
        ])
        .unwrap()
    }

    #[test]
    fn test_flags_to_settings() {
        let settings = RawSettings::from(&cert_config()).validate().unwrap();

        assert_eq!(
            settings.endpoints,
            vec!["https://10.0.0.1:2379", "https://10.0.0.2:2379"]
        );
        assert_eq!(settings.key_prefix, "/coredns/zonefiles/");
        assert_eq!(settings.request_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.connection_timeout, None);
        assert_eq!(settings.retry.retries, 3);
        assert_eq!(settings.retry.interval, Duration::from_millis(100));
        assert!(matches!(settings.credentials, Credentials::Certificate { .. }));
    }

    #[test]
    fn test_missing_prefix_is_rejected() {
        let mut config = cert_config();
        config.etcd_key_prefix = None;

        let err = RawSettings::from(&config).validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: Etcd key prefix cannot be empty"
        );
    }

    #[test]
    fn test_ambiguous_credentials_are_rejected() {
        let mut config = cert_config();
        config.etcd_username = Some("root".to_string());
        config.etcd_password = Some("secret".to_string());

        let err = RawSettings::from(&config).validate().unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_incomplete_certificate_pair_is_rejected() {
        let mut config = cert_config();
        config.user_key_path = None;

        let err = RawSettings::from(&config).validate().unwrap_err();
        assert!(err.to_string().contains("User key path cannot be empty"));
    }

    #[test]
    fn test_missing_credentials_are_rejected() {
        let mut config = cert_config();
        config.user_cert_path = None;
        config.user_key_path = None;

        let err = RawSettings::from(&config).validate().unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_password_is_redacted() {
        let credentials = Credentials::Password {
            username: "root".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("root"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_configuration_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("configs.json");
        std::fs::write(
            &path,
            r#"{
                "ZonefilesPath": "/zonefiles",
                "EtcdKeyPrefix": "/coredns/",
                "EtcdEndpoints": "https://127.0.0.1:2379",
                "CaCertPath": "/certs/ca.pem",
                "UserAuth": { "Username": "root", "Password": "secret" },
                "ConnectionTimeout": 10,
                "RequestRetries": 2
            }"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.zonefiles_path, PathBuf::from("/zonefiles"));
        assert_eq!(settings.connection_timeout, Some(Duration::from_secs(10)));
        assert_eq!(settings.request_timeout, None);
        assert_eq!(settings.retry.retries, 2);
        assert_eq!(
            settings.credentials,
            Credentials::Password {
                username: "root".to_string(),
                password: "secret".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_configuration_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("configs.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Settings::from_file(&path).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
