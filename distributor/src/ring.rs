use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use crate::kv::KvStore;

/// Ring key the ingester membership lives under in the kv store.
pub const INGESTER_RING_KEY: &str = "ring";

/// Tokens claimed by each instance when joining a ring.
pub const DEFAULT_TOKENS_PER_INSTANCE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOp {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Active,
    Leaving,
}

/// One member of a ring: its identity, the address clients dial, the tokens
/// it claims on the hash ring, and its liveness record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    pub tokens: Vec<u32>,
    pub state: InstanceState,
    /// Unix seconds of the last heartbeat.
    pub heartbeat: i64,
}

impl InstanceDesc {
    /// Writes only go to active instances; reads also tolerate leaving ones.
    /// A zero heartbeat timeout disables staleness checks (static rings).
    fn is_healthy(&self, op: RingOp, heartbeat_timeout: time::Duration, now: i64) -> bool {
        let fresh = heartbeat_timeout.is_zero()
            || now - self.heartbeat <= heartbeat_timeout.whole_seconds();
        let state_ok = match op {
            RingOp::Write => self.state == InstanceState::Active,
            RingOp::Read => true,
        };
        fresh && state_ok
    }
}

/// The full membership record for one ring, as stored in the kv store.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RingDesc {
    pub instances: HashMap<String, InstanceDesc>,
}

/// The instances that must receive a given key's write, plus the number of
/// per-replica failures tolerable before the write is deemed failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationSet {
    pub instances: Vec<InstanceDesc>,
    pub max_errors: usize,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RingError {
    #[error("empty ring")]
    EmptyRing,
    #[error("at least {required} live replicas required, could only find {found}")]
    TooManyUnhealthy { required: usize, found: usize },
}

/// Read-only view of a membership ring. Implemented by the kv-backed ring
/// below; tests substitute fixed views.
pub trait ReadRing: Send + Sync {
    /// The replication set for a routing key.
    fn replication_set(&self, key: u32, op: RingOp) -> Result<ReplicationSet, RingError>;

    /// Number of instances currently considered healthy for writes. Feeds
    /// the global rate-limit divisor.
    fn healthy_instance_count(&self) -> usize;

    fn replication_factor(&self) -> usize;

    /// All registered addresses, healthy or not. Used to evict pooled
    /// clients whose ingester has left the ring entirely.
    fn addresses(&self) -> Vec<String>;
}

/// 32-bit FNV-1a over tenant + canonical label string. The routing key for
/// the ingester ring: identical (tenant, labels) always land on the same
/// token arc while membership is stable.
pub fn token_for(tenant: &str, labels: &str) -> u32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;

    let mut hash = OFFSET;
    for b in tenant.bytes().chain(labels.bytes()) {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub fn generate_tokens(count: usize) -> Vec<u32> {
    let mut rng = rand::thread_rng();
    let mut tokens: Vec<u32> = (0..count).map(|_| rng.gen()).collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

struct RingState {
    desc: RingDesc,
    /// All claimed tokens sorted ascending, each with its owner's id.
    tokens: Vec<(u32, String)>,
}

impl RingState {
    fn from_desc(desc: RingDesc) -> Self {
        let mut tokens: Vec<(u32, String)> = desc
            .instances
            .values()
            .flat_map(|inst| inst.tokens.iter().map(|t| (*t, inst.id.clone())))
            .collect();
        tokens.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Self { desc, tokens }
    }
}

/// Consistent-hash view over one ring in the kv store. A background task
/// polls the store and swaps in fresh snapshots; lookups never touch the
/// store.
pub struct Ring {
    replication_factor: usize,
    heartbeat_timeout: time::Duration,
    state: Arc<RwLock<RingState>>,
}

impl Ring {
    pub async fn new(
        kv: Arc<dyn KvStore>,
        key: &str,
        replication_factor: usize,
        heartbeat_timeout: time::Duration,
        poll_interval: std::time::Duration,
    ) -> Self {
        // take an initial snapshot so lookups work before the first poll
        let initial = kv.get_ring(key).await.unwrap_or_default();
        let state = Arc::new(RwLock::new(RingState::from_desc(initial)));

        let watcher_state = Arc::clone(&state);
        let key = key.to_string();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                match kv.get_ring(&key).await {
                    Ok(desc) => {
                        let mut state = watcher_state.write();
                        if state.desc != desc {
                            *state = RingState::from_desc(desc);
                        }
                    }
                    Err(err) => warn!(ring = %key, error = %err, "failed to refresh ring view"),
                }
            }
        });

        Self {
            replication_factor,
            heartbeat_timeout,
            state,
        }
    }

    /// A ring over a fixed membership snapshot, never refreshed. Used for
    /// statically-configured ingester lists and in tests.
    pub fn from_desc(
        desc: RingDesc,
        replication_factor: usize,
        heartbeat_timeout: time::Duration,
    ) -> Self {
        Self {
            replication_factor,
            heartbeat_timeout,
            state: Arc::new(RwLock::new(RingState::from_desc(desc))),
        }
    }
}

impl ReadRing for Ring {
    fn replication_set(&self, key: u32, op: RingOp) -> Result<ReplicationSet, RingError> {
        let state = self.state.read();
        if state.tokens.is_empty() {
            return Err(RingError::EmptyRing);
        }

        // Walk the token ring clockwise from the key, collecting distinct
        // owners until the replication factor is met or the ring is
        // exhausted.
        let start = state.tokens.partition_point(|(t, _)| *t < key);
        let mut owners: Vec<&str> = Vec::with_capacity(self.replication_factor);
        for i in 0..state.tokens.len() {
            let (_, id) = &state.tokens[(start + i) % state.tokens.len()];
            if owners.contains(&id.as_str()) {
                continue;
            }
            owners.push(id.as_str());
            if owners.len() == self.replication_factor {
                break;
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let instances: Vec<InstanceDesc> = owners
            .iter()
            .filter_map(|id| state.desc.instances.get(*id))
            .filter(|inst| inst.is_healthy(op, self.heartbeat_timeout, now))
            .cloned()
            .collect();

        let min_success = self.replication_factor / 2 + 1;
        if instances.len() < min_success {
            return Err(RingError::TooManyUnhealthy {
                required: min_success,
                found: instances.len(),
            });
        }

        Ok(ReplicationSet {
            max_errors: instances.len() - min_success,
            instances,
        })
    }

    fn healthy_instance_count(&self) -> usize {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let state = self.state.read();
        state
            .desc
            .instances
            .values()
            .filter(|inst| inst.is_healthy(RingOp::Write, self.heartbeat_timeout, now))
            .count()
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    fn addresses(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .desc
            .instances
            .values()
            .map(|inst| inst.addr.clone())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn instance(id: &str, tokens: Vec<u32>) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: format!("{id}:9095"),
            tokens,
            state: InstanceState::Active,
            heartbeat: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    fn three_instance_desc() -> RingDesc {
        let mut desc = RingDesc::default();
        for (id, tokens) in [
            ("ingester-0", vec![100, 400]),
            ("ingester-1", vec![200, 500]),
            ("ingester-2", vec![300, 600]),
        ] {
            desc.instances
                .insert(id.to_string(), instance(id, tokens));
        }
        desc
    }

    #[test]
    fn token_for_is_deterministic_and_tenant_scoped() {
        let labels = r#"{app="api"}"#;
        assert_eq!(token_for("tenant-a", labels), token_for("tenant-a", labels));
        assert_ne!(token_for("tenant-a", labels), token_for("tenant-b", labels));
        assert_ne!(
            token_for("tenant-a", labels),
            token_for("tenant-a", r#"{app="web"}"#)
        );
    }

    #[test]
    fn replication_set_holds_distinct_instances() {
        let ring = Ring::from_desc(three_instance_desc(), 3, time::Duration::ZERO);
        let set = ring.replication_set(150, RingOp::Write).unwrap();

        assert_eq!(set.instances.len(), 3);
        assert_eq!(set.max_errors, 1);
        let mut ids: Vec<&str> = set.instances.iter().map(|i| i.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn same_key_same_set() {
        let ring = Ring::from_desc(three_instance_desc(), 2, time::Duration::ZERO);
        let a = ring.replication_set(250, RingOp::Write).unwrap();
        let b = ring.replication_set(250, RingOp::Write).unwrap();
        let ids = |s: &ReplicationSet| {
            s.instances
                .iter()
                .map(|i| i.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn key_wraps_around_the_ring() {
        let ring = Ring::from_desc(three_instance_desc(), 1, time::Duration::ZERO);
        // past the last token, the walk wraps to the first
        let set = ring.replication_set(u32::MAX, RingOp::Write).unwrap();
        assert_eq!(set.instances[0].id, "ingester-0");
        assert_eq!(set.max_errors, 0);
    }

    #[test]
    fn single_instance_single_replica() {
        let mut desc = RingDesc::default();
        desc.instances
            .insert("only".to_string(), instance("only", vec![42]));
        let ring = Ring::from_desc(desc, 1, time::Duration::ZERO);

        let set = ring.replication_set(7, RingOp::Write).unwrap();
        assert_eq!(set.instances.len(), 1);
        assert_eq!(set.max_errors, 0);
    }

    #[test]
    fn empty_ring_errors() {
        let ring = Ring::from_desc(RingDesc::default(), 3, time::Duration::ZERO);
        assert_eq!(
            ring.replication_set(1, RingOp::Write),
            Err(RingError::EmptyRing)
        );
    }

    #[test]
    fn stale_instances_are_skipped_for_writes() {
        let mut desc = three_instance_desc();
        desc.instances.get_mut("ingester-1").unwrap().heartbeat = 0;
        let ring = Ring::from_desc(desc, 3, time::Duration::seconds(60));

        let set = ring.replication_set(150, RingOp::Write).unwrap();
        assert_eq!(set.instances.len(), 2);
        // one instance down eats the whole failure budget
        assert_eq!(set.max_errors, 0);
        assert_eq!(ring.healthy_instance_count(), 2);
    }

    #[test]
    fn too_many_unhealthy_fails_lookup() {
        let mut desc = three_instance_desc();
        desc.instances.get_mut("ingester-0").unwrap().heartbeat = 0;
        desc.instances.get_mut("ingester-1").unwrap().heartbeat = 0;
        let ring = Ring::from_desc(desc, 3, time::Duration::seconds(60));

        assert_eq!(
            ring.replication_set(150, RingOp::Write),
            Err(RingError::TooManyUnhealthy {
                required: 2,
                found: 1
            })
        );
    }

    #[test]
    fn leaving_instances_serve_reads_not_writes() {
        let mut desc = RingDesc::default();
        let mut inst = instance("only", vec![42]);
        inst.state = InstanceState::Leaving;
        desc.instances.insert("only".to_string(), inst);
        let ring = Ring::from_desc(desc, 1, time::Duration::ZERO);

        assert!(ring.replication_set(7, RingOp::Read).is_ok());
        assert!(ring.replication_set(7, RingOp::Write).is_err());
        assert_eq!(ring.healthy_instance_count(), 0);
    }

    #[tokio::test]
    async fn watcher_picks_up_membership_changes() {
        let kv = Arc::new(MemoryKvStore::default());
        let ring = Ring::new(
            kv.clone(),
            INGESTER_RING_KEY,
            1,
            time::Duration::ZERO,
            std::time::Duration::from_millis(10),
        )
        .await;
        assert_eq!(
            ring.replication_set(1, RingOp::Write),
            Err(RingError::EmptyRing)
        );

        kv.update_instance(INGESTER_RING_KEY, instance("late-joiner", vec![9]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let set = ring.replication_set(1, RingOp::Write).unwrap();
        assert_eq!(set.instances[0].id, "late-joiner");
    }
}
