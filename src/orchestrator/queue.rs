//! Serialized request queue drained by a single worker task.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::quota::{QuotaLedger, QuotaSnapshot};
use crate::config::{OrchestratorConfig, QuotaConfig};
use crate::error::GatewayError;
use crate::executor::{ApiRequest, ApiTransport};
use crate::token::TokenManager;

const QUEUED: u8 = 0;
const DISPATCHED: u8 = 1;
const CANCELLED: u8 = 2;

/// Supplies access tokens to the worker.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, owner_id: &str) -> Result<String, GatewayError>;
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self, owner_id: &str) -> Result<String, GatewayError> {
        self.get_access_token(owner_id).await
    }
}

type Completion = oneshot::Sender<Result<Value, GatewayError>>;

struct QueuedRequest {
    seq: u64,
    request: ApiRequest,
    enqueued_at: Instant,
    not_before: Instant,
    quota_retries: u32,
    attempts: u32,
    status: Arc<AtomicU8>,
    completion: Option<Completion>,
}

impl QueuedRequest {
    fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::Acquire) == CANCELLED
    }

    fn mark_dispatched(&self) -> bool {
        match self
            .status
            .compare_exchange(QUEUED, DISPATCHED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == DISPATCHED,
        }
    }

    /// Resolve the caller's handle. Later calls are no-ops.
    fn complete(&mut self, result: Result<Value, GatewayError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// Caller side of a queued request.
pub struct RequestHandle {
    id: u64,
    status: Arc<AtomicU8>,
    rx: oneshot::Receiver<Result<Value, GatewayError>>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Withdraw the request. Only succeeds while it has not been dispatched.
    pub fn cancel(&self) -> bool {
        self.status
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Wait for the request to complete.
    pub async fn result(self) -> Result<Value, GatewayError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) if self.status.load(Ordering::Acquire) == CANCELLED => Err(GatewayError::Cancelled),
            Err(_) => Err(GatewayError::ShuttingDown),
        }
    }
}

/// Front door for every outbound Ads API call.
///
/// Quota windows and the queue are owned by one worker task; callers only
/// ever hold a submission channel and a completion handle.
pub struct Orchestrator {
    submit_tx: mpsc::Sender<QueuedRequest>,
    ledger: Arc<Mutex<QuotaLedger>>,
    next_seq: AtomicU64,
}

impl Orchestrator {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        quota: QuotaConfig,
        tokens: Arc<dyn TokenSource>,
        transport: Arc<dyn ApiTransport>,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(Mutex::new(QuotaLedger::new(quota.clone())));

        let worker = Worker {
            submit_rx,
            submissions_closed: false,
            retry_tx,
            retry_rx,
            pending: VecDeque::new(),
            ledger: ledger.clone(),
            tokens,
            transport,
            min_interval: quota.min_dispatch_interval(),
            config,
        };
        tokio::spawn(worker.run());

        Self {
            submit_tx,
            ledger,
            next_seq: AtomicU64::new(1),
        }
    }

    fn prepare(&self, request: ApiRequest) -> (QueuedRequest, RequestHandle) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(AtomicU8::new(QUEUED));
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let queued = QueuedRequest {
            seq,
            request,
            enqueued_at: now,
            not_before: now,
            quota_retries: 0,
            attempts: 0,
            status: status.clone(),
            completion: Some(tx),
        };
        (queued, RequestHandle { id: seq, status, rx })
    }

    /// Queue a request, waiting for space when the queue is full.
    pub async fn submit(&self, request: ApiRequest) -> Result<RequestHandle, GatewayError> {
        let (queued, handle) = self.prepare(request);
        self.submit_tx
            .send(queued)
            .await
            .map_err(|_| GatewayError::ShuttingDown)?;
        Ok(handle)
    }

    /// Queue a request without waiting; fails with `QueueFull` under backpressure.
    pub fn try_submit(&self, request: ApiRequest) -> Result<RequestHandle, GatewayError> {
        let (queued, handle) = self.prepare(request);
        self.submit_tx.try_send(queued).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => GatewayError::ShuttingDown,
        })?;
        Ok(handle)
    }

    /// Submit and wait for the result.
    pub async fn execute(&self, request: ApiRequest) -> Result<Value, GatewayError> {
        self.submit(request).await?.result().await
    }

    pub fn quota_snapshot(&self) -> QuotaSnapshot {
        let now = Instant::now();
        match self.ledger.lock() {
            Ok(ledger) => ledger.snapshot(now),
            Err(poisoned) => poisoned.into_inner().snapshot(now),
        }
    }
}

struct Worker {
    submit_rx: mpsc::Receiver<QueuedRequest>,
    submissions_closed: bool,
    retry_tx: mpsc::UnboundedSender<QueuedRequest>,
    retry_rx: mpsc::UnboundedReceiver<QueuedRequest>,
    /// Ordered by `seq`, so per-account submission order is the queue order.
    pending: VecDeque<QueuedRequest>,
    ledger: Arc<Mutex<QuotaLedger>>,
    tokens: Arc<dyn TokenSource>,
    transport: Arc<dyn ApiTransport>,
    /// Pause after every dispatch; caps sustained throughput at the QPS limit.
    min_interval: Duration,
    config: OrchestratorConfig,
}

impl Worker {
    async fn run(mut self) {
        info!(
            queue_capacity = self.config.queue_capacity,
            min_interval_ms = self.min_interval.as_millis() as u64,
            "Request orchestrator started"
        );

        loop {
            self.drain_channels();
            self.drop_cancelled();

            if self.pending.is_empty() {
                if self.submissions_closed {
                    break;
                }
                tokio::select! {
                    msg = self.submit_rx.recv() => match msg {
                        Some(req) => self.insert(req),
                        None => self.submissions_closed = true,
                    },
                    Some(req) = self.retry_rx.recv() => self.insert(req),
                }
                continue;
            }

            let now = Instant::now();
            match self.next_ready(now) {
                Some(req) => {
                    if self.try_dispatch(req, now) {
                        tokio::time::sleep(self.min_interval).await;
                    }
                }
                None => self.wait_for_work().await,
            }
        }

        info!("Request orchestrator stopped");
    }

    fn drain_channels(&mut self) {
        while let Ok(req) = self.retry_rx.try_recv() {
            self.insert(req);
        }
        while !self.submissions_closed {
            match self.submit_rx.try_recv() {
                Ok(req) => self.insert(req),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.submissions_closed = true,
            }
        }
    }

    fn insert(&mut self, req: QueuedRequest) {
        let idx = self.pending.partition_point(|p| p.seq < req.seq);
        self.pending.insert(idx, req);
    }

    fn drop_cancelled(&mut self) {
        self.pending.retain_mut(|req| {
            if req.is_cancelled() {
                debug!(id = req.seq, "Dropping cancelled request");
                req.complete(Err(GatewayError::Cancelled));
                false
            } else {
                true
            }
        });
    }

    /// Earliest request whose delay has elapsed and which is not queued
    /// behind an older request for the same account.
    fn next_ready(&mut self, now: Instant) -> Option<QueuedRequest> {
        let mut blocked_accounts: HashSet<&str> = HashSet::new();
        let mut ready = None;

        for (idx, req) in self.pending.iter().enumerate() {
            let bucket = req.request.qps_bucket();
            if blocked_accounts.contains(bucket) {
                continue;
            }
            if req.not_before > now {
                blocked_accounts.insert(bucket);
                continue;
            }
            ready = Some(idx);
            break;
        }

        ready.and_then(|idx| self.pending.remove(idx))
    }

    /// When the earliest delayed account head becomes ready. Requests queued
    /// behind a delayed head are ignored: they cannot leave before it.
    fn next_wake(&self) -> Option<Instant> {
        let mut heads: HashSet<&str> = HashSet::new();
        self.pending
            .iter()
            .filter(|req| heads.insert(req.request.qps_bucket()))
            .map(|req| req.not_before)
            .min()
    }

    async fn wait_for_work(&mut self) {
        let wake_at = self.next_wake();

        tokio::select! {
            _ = tokio::time::sleep_until(wake_at.unwrap_or_else(Instant::now)), if wake_at.is_some() => {}
            msg = self.submit_rx.recv(), if !self.submissions_closed => match msg {
                Some(req) => self.insert(req),
                None => self.submissions_closed = true,
            },
            Some(req) = self.retry_rx.recv() => self.insert(req),
        }
    }

    /// Check quotas and hand the request to a dispatch task, or put it back
    /// with a delay when a window is full. Returns whether it was sent.
    fn try_dispatch(&mut self, mut req: QueuedRequest, now: Instant) -> bool {
        let bucket = req.request.qps_bucket().to_string();
        let kind = req.request.operation.kind;

        {
            let mut ledger = match self.ledger.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            if let Err(dimension) = ledger.check(now, &bucket, kind) {
                drop(ledger);
                req.quota_retries += 1;
                if req.quota_retries > self.config.quota_max_retries {
                    warn!(
                        id = req.seq,
                        account = %bucket,
                        %dimension,
                        queued_ms = now.duration_since(req.enqueued_at).as_millis() as u64,
                        "Quota retries exhausted"
                    );
                    req.complete(Err(GatewayError::RateLimitExceeded { dimension }));
                    return false;
                }

                debug!(id = req.seq, account = %bucket, %dimension, retry = req.quota_retries, "Quota at capacity, rescheduling");
                req.not_before = now + self.config.quota_retry_delay;
                self.insert(req);
                return false;
            }

            if !req.mark_dispatched() {
                req.complete(Err(GatewayError::Cancelled));
                return false;
            }

            ledger.commit(now, &bucket, kind);
            if req.seq % 256 == 0 {
                ledger.prune(now);
            }
        }

        req.attempts += 1;
        self.spawn_dispatch(req);
        true
    }

    fn spawn_dispatch(&self, mut req: QueuedRequest) {
        let tokens = self.tokens.clone();
        let transport = self.transport.clone();
        let retry_tx = self.retry_tx.clone();
        let max_attempts = self.config.transient_max_attempts;
        let backoff_base = self.config.transient_backoff_base;

        tokio::spawn(async move {
            let result = match tokens.access_token(&req.request.owner_id).await {
                Ok(token) => transport.execute(&token, &req.request).await,
                Err(e) => Err(e),
            };

            match result {
                Err(e @ GatewayError::TransientApi { .. }) if req.attempts < max_attempts => {
                    let backoff = backoff_base * 2u32.saturating_pow(req.attempts - 1);
                    warn!(
                        id = req.seq,
                        attempt = req.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient API failure, retrying: {e}"
                    );
                    req.not_before = Instant::now() + backoff;
                    if let Err(mpsc::error::SendError(mut req)) = retry_tx.send(req) {
                        req.complete(Err(e));
                    }
                }
                Err(e) => {
                    debug!(id = req.seq, "Request failed: {e}");
                    req.complete(Err(e));
                }
                Ok(value) => req.complete(Ok(value)),
            }
        });
    }
}
