//! etcd backend for the zone file synchroniser.
//!
//! - `config`: flags, environment and JSON configuration file
//! - `connect`: TLS material and credentials for the etcd client
//! - `transport`: `KvTransport` implementation over the etcd v3 API

pub mod config;
pub mod connect;
pub mod transport;

pub use config::{Config, Credentials, Settings};
pub use connect::connect;
pub use transport::EtcdTransport;
