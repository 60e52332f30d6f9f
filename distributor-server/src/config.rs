use envconfig::Envconfig;
use std::net::SocketAddr;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3100")]
    pub address: SocketAddr,

    /// This instance's identity in the distributor ring.
    #[envconfig(default = "distributor-1")]
    pub instance_id: String,
    #[envconfig(default = "127.0.0.1:3100")]
    pub instance_addr: String,

    /// Comma-separated ingester addresses forming the write ring.
    pub ingester_addresses: String,
    #[envconfig(default = "3")]
    pub replication_factor: usize,

    /// "local" or "global".
    #[envconfig(default = "local")]
    pub rate_limit_strategy: String,
    #[envconfig(default = "4194304")]
    pub ingestion_rate_bytes: u32,
    #[envconfig(default = "6291456")]
    pub ingestion_burst_bytes: u32,
    /// JSON map of tenant id to partial limit overrides.
    #[envconfig(default = "{}")]
    pub tenant_overrides: String,

    #[envconfig(default = "10000")]
    pub remote_timeout_ms: u64,
    #[envconfig(default = "5")]
    pub heartbeat_period_secs: u64,
    #[envconfig(default = "60")]
    pub heartbeat_timeout_secs: i64,

    #[envconfig(default = "true")]
    pub export_metrics: bool,
}
