use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::kv::{KvError, KvStore};
use crate::ring::{generate_tokens, InstanceDesc, InstanceState, DEFAULT_TOKENS_PER_INSTANCE};

/// Ring key distributor instances register themselves under. Only consumed
/// by the global rate-limit strategy, which counts healthy peers here.
pub const DISTRIBUTOR_RING_KEY: &str = "distributor";

#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    pub ring_key: String,
    pub instance_id: String,
    pub instance_addr: String,
    pub num_tokens: usize,
    pub heartbeat_period: std::time::Duration,
}

impl Default for LifecyclerConfig {
    fn default() -> Self {
        Self {
            ring_key: DISTRIBUTOR_RING_KEY.to_string(),
            instance_id: "distributor-1".to_string(),
            instance_addr: "127.0.0.1:3100".to_string(),
            num_tokens: DEFAULT_TOKENS_PER_INSTANCE,
            heartbeat_period: std::time::Duration::from_secs(5),
        }
    }
}

/// Maintains this process's own membership record: registers it as active
/// on start, heartbeats it until shutdown, then removes it.
pub struct Lifecycler {
    cfg: LifecyclerConfig,
    kv: Arc<dyn KvStore>,
    tokens: Vec<u32>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycler {
    pub fn new(cfg: LifecyclerConfig, kv: Arc<dyn KvStore>) -> Self {
        let tokens = generate_tokens(cfg.num_tokens);
        Self {
            cfg,
            kv,
            tokens,
            heartbeat_task: Mutex::new(None),
        }
    }

    fn desc(&self) -> InstanceDesc {
        InstanceDesc {
            id: self.cfg.instance_id.clone(),
            addr: self.cfg.instance_addr.clone(),
            tokens: self.tokens.clone(),
            state: InstanceState::Active,
            heartbeat: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    /// Register this instance as active and start heartbeating it.
    pub async fn start(&self) -> Result<(), KvError> {
        self.kv
            .update_instance(&self.cfg.ring_key, self.desc())
            .await?;
        info!(
            ring = %self.cfg.ring_key,
            instance = %self.cfg.instance_id,
            "registered in ring"
        );

        let kv = Arc::clone(&self.kv);
        let ring_key = self.cfg.ring_key.clone();
        let id = self.cfg.instance_id.clone();
        let addr = self.cfg.instance_addr.clone();
        let tokens = self.tokens.clone();
        let period = self.cfg.heartbeat_period;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the registration above was the first beat
            loop {
                interval.tick().await;
                let desc = InstanceDesc {
                    id: id.clone(),
                    addr: addr.clone(),
                    tokens: tokens.clone(),
                    state: InstanceState::Active,
                    heartbeat: OffsetDateTime::now_utc().unix_timestamp(),
                };
                if let Err(err) = kv.update_instance(&ring_key, desc).await {
                    warn!(ring = %ring_key, error = %err, "heartbeat failed");
                }
            }
        });
        *self.heartbeat_task.lock() = Some(task);
        Ok(())
    }

    /// Stop heartbeating and remove this instance from the ring.
    pub async fn shutdown(&self) -> Result<(), KvError> {
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
        self.kv
            .remove_instance(&self.cfg.ring_key, &self.cfg.instance_id)
            .await?;
        info!(
            ring = %self.cfg.ring_key,
            instance = %self.cfg.instance_id,
            "deregistered from ring"
        );
        Ok(())
    }
}
