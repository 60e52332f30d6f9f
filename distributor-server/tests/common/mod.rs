#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::str::FromStr;
use std::sync::Once;

use rand::distributions::Alphanumeric;
use rand::Rng;

use distributor_server::config::Config;
use distributor_server::server::serve;

pub fn setup_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init()
    });
}

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{prefix}_{suffix}")
}

pub struct ServerConfig {
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let config = Config {
            address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
            instance_id: random_string("distributor", 8),
            instance_addr: "127.0.0.1:0".to_string(),
            ingester_addresses: "ingester-0:9095,ingester-1:9095,ingester-2:9095".to_string(),
            replication_factor: 3,
            rate_limit_strategy: "local".to_string(),
            ingestion_rate_bytes: 4 << 20,
            ingestion_burst_bytes: 6 << 20,
            tenant_overrides: "{}".to_string(),
            remote_timeout_ms: 1000,
            heartbeat_period_secs: 5,
            heartbeat_timeout_secs: 60,
            // the recorder is process-global and these tests boot many servers
            export_metrics: false,
        };
        Self { config }
    }
}

impl ServerConfig {
    pub fn new(mutate: impl FnOnce(&mut Config)) -> Self {
        let mut base = Self::default();
        mutate(&mut base.config);
        base
    }

    pub fn start(self) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(self.config, listener, std::future::pending()));
        ServerHandle {
            addr,
            client: reqwest::Client::new(),
        }
    }
}

pub struct ServerHandle {
    pub addr: SocketAddr,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn push(&self, tenant: Option<&str>, body: String) -> reqwest::Response {
        let mut req = self
            .client
            .post(format!("http://{}/api/v1/push", self.addr))
            .body(body);
        if let Some(tenant) = tenant {
            req = req.header("X-Scope-OrgID", tenant);
        }
        req.send().await.expect("failed to send push request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }
}
