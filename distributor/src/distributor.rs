use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, instrument, Instrument};

use crate::api::{PushError, PushRequest, PushResponse, Stream};
use crate::clientpool::{ClientError, ClientFactory, ClientPool};
use crate::labels::{canonical_string, parse_labels, LabelCache, DEFAULT_LABEL_CACHE_SIZE};
use crate::prometheus::report_discarded_samples;
use crate::ratelimit::{
    GlobalStrategy, LocalStrategy, RateLimiter, RateLimiterStrategy, RECHECK_PERIOD,
};
use crate::ring::{token_for, InstanceDesc, ReadRing, RingOp};
use crate::validation::{
    IngestionRateStrategy, Overrides, ValidationContext, Validator, INVALID_LABELS, RATE_LIMITED,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("global rate limiting requires a distributor ring")]
    MissingDistributorRing,
}

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Deadline for each outbound push RPC.
    pub remote_timeout: std::time::Duration,
    pub label_cache_size: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            remote_timeout: std::time::Duration::from_secs(10),
            label_cache_size: DEFAULT_LABEL_CACHE_SIZE,
        }
    }
}

/// Transient per-request, per-stream record. The two counters drive the
/// quorum state machine: a stream succeeds when `success_budget` hits zero
/// and fails the request when `failure_budget` does. The decrements are
/// independent, so a stream can never take both transitions.
struct StreamTracker {
    stream: Stream,
    /// Successful pushes still needed: `replicas - max_errors`.
    success_budget: AtomicI32,
    /// Additional per-replica failures tolerable: `max_errors`.
    failure_budget: AtomicI32,
}

impl StreamTracker {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            success_budget: AtomicI32::new(0),
            failure_budget: AtomicI32::new(0),
        }
    }
}

/// Transient per-request record. The buffered capacity-1 channels and the
/// single-shot failed flag guarantee at most one signal per outcome no
/// matter how the fan-out tasks interleave.
struct PushTracker {
    pending: AtomicI32,
    failed: AtomicBool,
    done: mpsc::Sender<()>,
    err: mpsc::Sender<PushError>,
}

/// Coordinates replication and distribution of log streams: validates and
/// normalises each stream, admits the request past the tenant's rate limit,
/// then fans the streams out to the replication set the ingester ring picks
/// for each of them.
pub struct Distributor {
    validator: Validator,
    label_cache: LabelCache,
    rate_limiter: RateLimiter,
    ingesters_ring: Arc<dyn ReadRing>,
    pool: Arc<ClientPool>,
    remote_timeout: std::time::Duration,
}

impl Distributor {
    pub fn new(
        cfg: DistributorConfig,
        overrides: Arc<Overrides>,
        ingesters_ring: Arc<dyn ReadRing>,
        distributors_ring: Option<Arc<dyn ReadRing>>,
        factory: ClientFactory,
    ) -> Result<Self, ConfigError> {
        let strategy: Arc<dyn RateLimiterStrategy> = match overrides.ingestion_rate_strategy() {
            IngestionRateStrategy::Local => Arc::new(LocalStrategy::new(Arc::clone(&overrides))),
            IngestionRateStrategy::Global => {
                let ring = distributors_ring.ok_or(ConfigError::MissingDistributorRing)?;
                Arc::new(GlobalStrategy::new(Arc::clone(&overrides), ring))
            }
        };

        gauge!(
            "distributor_replication_factor",
            ingesters_ring.replication_factor() as f64
        );

        Ok(Self {
            validator: Validator::new(overrides),
            label_cache: LabelCache::new(cfg.label_cache_size),
            rate_limiter: RateLimiter::new(strategy, RECHECK_PERIOD),
            ingesters_ring,
            pool: Arc::new(ClientPool::new(factory)),
            remote_timeout: cfg.remote_timeout,
        })
    }

    pub fn pool(&self) -> Arc<ClientPool> {
        Arc::clone(&self.pool)
    }

    /// Push a set of streams. Succeeds once every surviving stream has been
    /// acknowledged by a quorum of its replicas; fails with a precise error
    /// otherwise. Dropping the returned future abandons the wait only - the
    /// fan-out keeps running so replicas converge even when the caller gives
    /// up early.
    #[instrument(skip_all, fields(tenant = %tenant, streams = req.streams.len()))]
    pub async fn push(&self, tenant: &str, req: PushRequest) -> Result<PushResponse, PushError> {
        if req.streams.is_empty() {
            return Ok(PushResponse::default());
        }

        let ctx = self
            .validator
            .validation_context(OffsetDateTime::now_utc(), tenant);

        let mut validation_error: Option<PushError> = None;
        let mut streams: Vec<StreamTracker> = Vec::with_capacity(req.streams.len());
        let mut keys: Vec<u32> = Vec::with_capacity(req.streams.len());
        let mut validated_bytes = 0usize;
        let mut validated_samples = 0usize;

        for mut stream in req.streams {
            if stream.entries.is_empty() {
                continue;
            }

            // Truncate first so the length checks below see the final sizes.
            self.validator.truncate_lines(&ctx, &mut stream);

            match self.parse_stream_labels(&ctx, &stream) {
                Ok(canonical) => stream.labels = canonical,
                Err(err) => {
                    report_discarded_samples(
                        INVALID_LABELS,
                        tenant,
                        stream.entries.len(),
                        stream.line_bytes(),
                    );
                    validation_error.get_or_insert(err);
                    continue;
                }
            }

            let labels = stream.labels.clone();
            stream.entries.retain(|entry| {
                match self.validator.validate_entry(&ctx, &labels, entry) {
                    Ok(()) => {
                        validated_bytes += entry.line.len();
                        validated_samples += 1;
                        true
                    }
                    Err(err) => {
                        report_discarded_samples(err.reason(), tenant, 1, entry.line.len());
                        validation_error.get_or_insert(err.into());
                        false
                    }
                }
            });

            keys.push(token_for(tenant, &stream.labels));
            streams.push(StreamTracker::new(stream));
        }

        if streams.is_empty() {
            return match validation_error {
                Some(err) => Err(err),
                None => Ok(PushResponse::default()),
            };
        }

        if !self.rate_limiter.allow(tenant, validated_bytes) {
            report_discarded_samples(RATE_LIMITED, tenant, validated_samples, validated_bytes);
            return Err(PushError::RateLimited {
                tenant: tenant.to_string(),
                limit: self.rate_limiter.limit(tenant),
                samples: validated_samples,
                bytes: validated_bytes,
            });
        }

        // Pick each stream's replication set and group the streams by
        // destination ingester, preserving input order per destination.
        let mut streams_by_ingester: HashMap<String, Vec<usize>> = HashMap::new();
        let mut desc_by_ingester: HashMap<String, InstanceDesc> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            let set = self
                .ingesters_ring
                .replication_set(*key, RingOp::Write)
                .map_err(|err| PushError::Ring {
                    message: err.to_string(),
                })?;

            let replicas = set.instances.len();
            streams[i]
                .success_budget
                .store((replicas - set.max_errors) as i32, Ordering::Release);
            streams[i]
                .failure_budget
                .store(set.max_errors as i32, Ordering::Release);

            for ingester in set.instances {
                streams_by_ingester
                    .entry(ingester.addr.clone())
                    .or_default()
                    .push(i);
                desc_by_ingester.entry(ingester.addr.clone()).or_insert(ingester);
            }
        }

        // Capacity-1 buffers: the fan-out tasks fire-and-forget at most one
        // value into each, even when the caller has already gone away.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let (err_tx, mut err_rx) = mpsc::channel::<PushError>(1);
        let tracker = Arc::new(PushTracker {
            pending: AtomicI32::new(streams.len() as i32),
            failed: AtomicBool::new(false),
            done: done_tx,
            err: err_tx,
        });
        let streams = Arc::new(streams);

        for (addr, indexes) in streams_by_ingester {
            let Some(ingester) = desc_by_ingester.remove(&addr) else {
                continue;
            };
            let pool = Arc::clone(&self.pool);
            let streams = Arc::clone(&streams);
            let tracker = Arc::clone(&tracker);
            let tenant = tenant.to_string();
            let remote_timeout = self.remote_timeout;
            // Spawned rather than joined: the caller abandoning the wait
            // must not curtail replication already admitted past the rate
            // limiter. The current span rides along for tracing.
            tokio::spawn(
                async move {
                    send_to_ingester(
                        pool,
                        ingester,
                        streams,
                        indexes,
                        tracker,
                        tenant,
                        remote_timeout,
                    )
                    .await;
                }
                .in_current_span(),
            );
        }

        tokio::select! {
            Some(err) = err_rx.recv() => Err(err),
            Some(()) = done_rx.recv() => {
                debug!("all streams reached quorum");
                match validation_error {
                    Some(err) => Err(err),
                    None => Ok(PushResponse::default()),
                }
            }
            else => Err(PushError::ReplicationFailed {
                message: "push trackers dropped without a decision".to_string(),
            }),
        }
    }

    /// Canonicalise a stream's label set, consulting the cache first. Only
    /// sets that parse and validate make it into the cache, so hits skip
    /// both steps.
    fn parse_stream_labels(
        &self,
        ctx: &ValidationContext,
        stream: &Stream,
    ) -> Result<String, PushError> {
        if let Some(canonical) = self.label_cache.get(&stream.labels) {
            return Ok(canonical);
        }

        let labels = parse_labels(&stream.labels).map_err(|message| PushError::InvalidLabels {
            labels: stream.labels.clone(),
            message,
        })?;
        self.validator.validate_labels(ctx, &labels, &stream.labels)?;

        let canonical = canonical_string(&labels);
        self.label_cache
            .insert(stream.labels.clone(), canonical.clone());
        Ok(canonical)
    }
}

/// Deliver one batch to one ingester and settle the budgets of every stream
/// in it. Success decrements each stream's success budget; on the decrement
/// that lands a stream exactly on zero the stream has its quorum, and the
/// last such stream signals done. Failure mirrors this through the failure
/// budgets and the single-shot failed flag.
async fn send_to_ingester(
    pool: Arc<ClientPool>,
    ingester: InstanceDesc,
    streams: Arc<Vec<StreamTracker>>,
    indexes: Vec<usize>,
    tracker: Arc<PushTracker>,
    tenant: String,
    remote_timeout: std::time::Duration,
) {
    let payload: Vec<Stream> = indexes.iter().map(|&i| streams[i].stream.clone()).collect();

    let result = execute_push_request(pool, &ingester, &tenant, payload, remote_timeout).await;
    match result {
        Ok(_) => {
            for &i in &indexes {
                if streams[i].success_budget.fetch_sub(1, Ordering::AcqRel) - 1 != 0 {
                    continue;
                }
                if tracker.pending.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
                    let _ = tracker.done.try_send(());
                }
            }
        }
        Err(err) => {
            for &i in &indexes {
                if streams[i].failure_budget.fetch_sub(1, Ordering::AcqRel) - 1 != 0 {
                    continue;
                }
                if !tracker.failed.swap(true, Ordering::AcqRel) {
                    let _ = tracker.err.try_send(PushError::ReplicationFailed {
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

async fn execute_push_request(
    pool: Arc<ClientPool>,
    ingester: &InstanceDesc,
    tenant: &str,
    streams: Vec<Stream>,
    remote_timeout: std::time::Duration,
) -> Result<PushResponse, ClientError> {
    let client = pool.get_client_for(&ingester.addr)?;
    let req = PushRequest { streams };

    let result = match tokio::time::timeout(remote_timeout, client.push(tenant, req)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    };

    counter!(
        "distributor_ingester_appends_total",
        1,
        "ingester" => ingester.addr.clone()
    );
    if let Err(err) = &result {
        counter!(
            "distributor_ingester_append_failures_total",
            1,
            "ingester" => ingester.addr.clone()
        );
        debug!(ingester = %ingester.addr, error = %err, "ingester push failed");
    }

    result
}
