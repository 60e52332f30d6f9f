use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{PushRequest, PushResponse};
use crate::ring::ReadRing;

#[derive(Debug, Error, Clone)]
pub enum ClientError {
    #[error("failed to connect to ingester {addr}: {message}")]
    Connect { addr: String, message: String },
    #[error("ingester request failed: {message}")]
    Upstream { message: String },
    #[error("timeout pushing to ingester")]
    Timeout,
}

/// The outbound contract this process holds against an ingester. The
/// concrete transport lives behind this trait; the pool and dispatcher only
/// see it.
#[async_trait]
pub trait PushClient: Send + Sync {
    async fn push(&self, tenant: &str, req: PushRequest) -> Result<PushResponse, ClientError>;
}

/// Builds a client for an ingester address. Injected so deployments pick
/// their transport and tests capture calls.
pub type ClientFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn PushClient>, ClientError> + Send + Sync>;

/// Long-lived clients keyed by ingester address. Creation is serialised per
/// address; lookups of existing clients only take a shard read lock. Clients
/// are shared across requests and tasks, with multiplexing left to the
/// underlying transport.
pub struct ClientPool {
    factory: ClientFactory,
    clients: DashMap<String, Arc<dyn PushClient>>,
}

impl ClientPool {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            clients: DashMap::new(),
        }
    }

    pub fn get_client_for(&self, addr: &str) -> Result<Arc<dyn PushClient>, ClientError> {
        if let Some(client) = self.clients.get(addr) {
            return Ok(Arc::clone(client.value()));
        }
        match self.clients.entry(addr.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let client = (self.factory)(addr)?;
                entry.insert(Arc::clone(&client));
                debug!(ingester = %addr, "created ingester client");
                Ok(client)
            }
        }
    }

    /// Drop clients whose address has left the ring.
    pub fn remove_stale(&self, ring: &dyn ReadRing) {
        let live: HashSet<String> = ring.addresses().into_iter().collect();
        self.clients.retain(|addr, _| {
            let keep = live.contains(addr);
            if !keep {
                info!(ingester = %addr, "removing client for departed ingester");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Periodically evict clients for ingesters that are gone from the ring.
pub fn spawn_pool_pruner(
    pool: Arc<ClientPool>,
    ring: Arc<dyn ReadRing>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            pool.remove_stale(ring.as_ref());
        }
    })
}

/// A client that logs instead of sending, for local development without
/// real ingesters.
pub struct PrintClient {
    addr: String,
}

impl PrintClient {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

#[async_trait]
impl PushClient for PrintClient {
    async fn push(&self, tenant: &str, req: PushRequest) -> Result<PushResponse, ClientError> {
        for stream in &req.streams {
            info!(
                ingester = %self.addr,
                tenant = %tenant,
                labels = %stream.labels,
                entries = stream.entries.len(),
                "push"
            );
        }
        Ok(PushResponse::default())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    /// Records pushes and replays scripted responses; unscripted calls
    /// succeed. An optional delay simulates a slow ingester.
    #[derive(Default)]
    pub(crate) struct MockPushClient {
        state: Mutex<MockState>,
        pub delay: Option<std::time::Duration>,
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<(String, PushRequest)>,
        ret: VecDeque<Result<PushResponse, ClientError>>,
    }

    impl MockPushClient {
        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Queue one failed response ahead of the default successes.
        pub fn enqueue_error(&self, message: &str) {
            self.state.lock().ret.push_back(Err(ClientError::Upstream {
                message: message.to_string(),
            }));
        }

        pub fn calls(&self) -> Vec<(String, PushRequest)> {
            self.state.lock().calls.clone()
        }
    }

    #[async_trait]
    impl PushClient for Arc<MockPushClient> {
        async fn push(&self, tenant: &str, req: PushRequest) -> Result<PushResponse, ClientError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock();
            state.calls.push((tenant.to_string(), req));
            state.ret.pop_front().unwrap_or(Ok(PushResponse::default()))
        }
    }

    /// A factory serving pre-built mock clients by address.
    pub(crate) fn mock_factory(clients: HashMap<String, Arc<MockPushClient>>) -> ClientFactory {
        Arc::new(move |addr| {
            clients
                .get(addr)
                .map(|c| Arc::new(Arc::clone(c)) as Arc<dyn PushClient>)
                .ok_or_else(|| ClientError::Connect {
                    addr: addr.to_string(),
                    message: "no such ingester".to_string(),
                })
        })
    }
}
