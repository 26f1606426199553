//! Leader election using Kubernetes Leases
//!
//! Workloads that run several replicas of the same pod (Deployments,
//! ReplicaSets, ReplicationControllers) must only run one backup scheduler at
//! a time. Each replica races for a `coordination.k8s.io/v1` Lease named after
//! the workload; the holder runs the scheduler.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the write fails with 409 Conflict and the replica
//! treats the attempt as lost rather than as an error.
//!
//! # Timing
//!
//! The holder renews every `retry_period`. If it cannot renew for
//! `renew_deadline` it steps down. Other replicas take over once
//! `lease_duration` has passed since the last renewal, so a partitioned
//! holder always stops before anyone else starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a lease is valid after its last renewal
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
/// How long the holder keeps leading without a successful renewal
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Interval between acquire and renew attempts
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The stored lease cannot be used for compare-and-swap
    #[error("invalid lease {name}: {message}")]
    InvalidLease {
        /// Lease name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// The lease store is unreachable
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}

/// Compare-and-swap storage for lease records
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError>;

    /// Create the lease; `Ok(false)` if another replica created it first
    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;

    /// Replace the lease if its resourceVersion still matches; `Ok(false)` on conflict
    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;
}

/// Lease store backed by the Kubernetes API
pub struct KubeLeaseStore {
    api: Api<Lease>,
}

impl KubeLeaseStore {
    /// Store leases in `namespace`
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        let name = lease.metadata.name.as_deref().unwrap_or_default();
        match self.api.replace(name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process lease store with the same compare-and-swap rules as the API server
///
/// Used for single-process setups and for simulating many replicas in tests.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    version: AtomicU64,
}

impl InMemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of the named lease, if any
    pub fn holder(&self, name: &str) -> Option<String> {
        self.lock()
            .get(name)
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.holder_identity.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError> {
        Ok(self.lock().get(name).cloned())
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        let name = lease_name(lease)?;
        let mut leases = self.lock();
        if leases.contains_key(&name) {
            return Ok(false);
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version());
        leases.insert(name, stored);
        Ok(true)
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        let name = lease_name(lease)?;
        let mut leases = self.lock();
        let Some(current) = leases.get(&name) else {
            return Ok(false);
        };
        if current.metadata.resource_version != lease.metadata.resource_version {
            return Ok(false);
        }
        let mut stored = lease.clone();
        stored.metadata.resource_version = Some(self.next_version());
        leases.insert(name, stored);
        Ok(true)
    }
}

fn lease_name(lease: &Lease) -> Result<String, LeaderElectionError> {
    lease
        .metadata
        .name
        .clone()
        .ok_or_else(|| LeaderElectionError::InvalidLease {
            name: String::new(),
            message: "lease has no name".to_string(),
        })
}

/// Wall-clock source for lease timestamps
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Transitions of the leadership state machine
///
/// `on_lose` is called exactly once after every `on_acquire`, including when
/// the election is shut down while leading.
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    /// This replica became the leader
    async fn on_acquire(&self);

    /// This replica is no longer the leader
    async fn on_lose(&self);
}

enum HoldOutcome {
    Lost,
    Shutdown,
}

/// Leader elector for one lease
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    /// Create an elector with default timing (15s lease, 10s renew deadline, 2s retry)
    pub fn new(
        store: Arc<dyn LeaseStore>,
        lease_name: &str,
        namespace: &str,
        identity: &str,
    ) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
            is_leader: AtomicBool::new(false),
        }
    }

    /// Use a different wall clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Identity this elector competes with
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this replica currently holds leadership
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Run the election until `shutdown` is cancelled
    ///
    /// Calls `handler.on_acquire` when leadership is gained and
    /// `handler.on_lose` when it is lost. After losing, the replica competes
    /// again. On shutdown a held lease is released so a standby can take
    /// over without waiting for expiry.
    pub async fn run(&self, handler: Arc<dyn LeadershipHandler>, shutdown: CancellationToken) {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            if !self.acquire(&shutdown).await {
                return;
            }

            self.is_leader.store(true, Ordering::SeqCst);
            info!(identity = %self.identity, lease = %self.lease_name, "Leadership acquired");
            handler.on_acquire().await;

            let outcome = self.hold(&shutdown).await;

            self.is_leader.store(false, Ordering::SeqCst);
            handler.on_lose().await;

            if let HoldOutcome::Shutdown = outcome {
                if let Err(e) = self.release_lease().await {
                    warn!(identity = %self.identity, error = %e, "Failed to release lease");
                }
                return;
            }
            warn!(identity = %self.identity, lease = %self.lease_name, "Leadership lost");
        }
    }

    /// Retry until the lease is ours; false if shut down first
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_period.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
    }

    /// Renew every retry period until a renewal is rejected, the renew
    /// deadline passes without success, or shutdown
    async fn hold(&self, shutdown: &CancellationToken) -> HoldOutcome {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return HoldOutcome::Shutdown,
                _ = tokio::time::sleep(self.retry_period) => {}
            }

            let remaining = self.renew_deadline.saturating_sub(last_renewal.elapsed());
            match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => last_renewal = Instant::now(),
                Ok(Ok(false)) => return HoldOutcome::Lost,
                Ok(Err(e)) => {
                    if last_renewal.elapsed() >= self.renew_deadline {
                        warn!(identity = %self.identity, error = %e, "Renew deadline exceeded");
                        return HoldOutcome::Lost;
                    }
                    debug!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Renew deadline exceeded");
                    return HoldOutcome::Lost;
                }
            }
        }
    }

    /// Try to acquire or renew the lease atomically
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = self.clock.now();

        let Some(lease) = self.store.get(&self.lease_name).await? else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            return self.renew_lease(&lease, now).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let is_expired = match (holder, renew_time, duration_secs) {
            (None, _, _) => true,
            (Some(_), Some(rt), Some(duration)) => {
                now > rt.0 + chrono::Duration::seconds(i64::from(duration))
            }
            _ => true,
        };

        if !is_expired {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        self.take_over_lease(&lease, now, transitions).await
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        let created = self.store.create(&lease).await?;
        if created {
            info!(identity = %self.identity, "Created new lease");
        } else {
            debug!(identity = %self.identity, "Lease creation conflict, will retry");
        }
        Ok(created)
    }

    async fn renew_lease(
        &self,
        existing: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        self.require_resource_version(existing)?;

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        let renewed = self.store.replace(&updated).await?;
        if renewed {
            debug!(identity = %self.identity, "Lease renewed");
        } else {
            warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
        }
        Ok(renewed)
    }

    async fn take_over_lease(
        &self,
        existing: &Lease,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        self.require_resource_version(existing)?;

        let lease = Lease {
            metadata: existing.metadata.clone(),
            spec: Some(self.lease_spec(now, transitions + 1)),
        };

        let taken = self.store.replace(&lease).await?;
        if taken {
            info!(
                identity = %self.identity,
                transitions = transitions + 1,
                "Took over expired lease"
            );
        } else {
            debug!(identity = %self.identity, "Lease takeover conflict, will retry");
        }
        Ok(taken)
    }

    fn require_resource_version(&self, lease: &Lease) -> Result<(), LeaderElectionError> {
        if lease.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::InvalidLease {
                name: self.lease_name.clone(),
                message: "missing resourceVersion".to_string(),
            });
        }
        Ok(())
    }

    /// Clear the holder so another replica can acquire immediately
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let Some(lease) = self.store.get(&self.lease_name).await? else {
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let mut released = lease.clone();
        if let Some(ref mut spec) = released.spec {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(self.clock.now() - chrono::Duration::seconds(60)));
        }

        if self.store.replace(&released).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Wall clock that follows tokio's (pausable) clock
    struct TokioClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TokioClock {
        fn new() -> Self {
            Self {
                base: Utc::now(),
                start: Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default();
            self.base + elapsed
        }
    }

    /// Store view of one replica that can be cut off from the shared store
    struct PartitionableStore {
        inner: Arc<InMemoryLeaseStore>,
        partitioned: AtomicBool,
    }

    impl PartitionableStore {
        fn check(&self) -> Result<(), LeaderElectionError> {
            if self.partitioned.load(Ordering::SeqCst) {
                return Err(LeaderElectionError::Unavailable("partitioned".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LeaseStore for PartitionableStore {
        async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError> {
            self.check()?;
            self.inner.get(name).await
        }
        async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
            self.check()?;
            self.inner.create(lease).await
        }
        async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
            self.check()?;
            self.inner.replace(lease).await
        }
    }

    /// Counts concurrently active schedulers across all replicas
    struct ActiveTracker {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        leading: AtomicBool,
        acquisitions: AtomicUsize,
    }

    #[async_trait]
    impl LeadershipHandler for ActiveTracker {
        async fn on_acquire(&self) {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            self.leading.store(true, Ordering::SeqCst);
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_lose(&self) {
            self.leading.store(false, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Replica {
        store: Arc<PartitionableStore>,
        tracker: Arc<ActiveTracker>,
    }

    fn spawn_replicas(
        n: usize,
        shared: &Arc<InMemoryLeaseStore>,
        clock: &Arc<TokioClock>,
        shutdown: &CancellationToken,
        active: &Arc<AtomicUsize>,
        max_active: &Arc<AtomicUsize>,
    ) -> (Vec<Replica>, Vec<tokio::task::JoinHandle<()>>) {
        let mut replicas = Vec::new();
        let mut handles = Vec::new();
        for i in 0..n {
            let store = Arc::new(PartitionableStore {
                inner: shared.clone(),
                partitioned: AtomicBool::new(false),
            });
            let tracker = Arc::new(ActiveTracker {
                active: active.clone(),
                max_active: max_active.clone(),
                leading: AtomicBool::new(false),
                acquisitions: AtomicUsize::new(0),
            });
            let elector = LeaderElector::new(
                store.clone(),
                "cadence-lock-deployment-web",
                "default",
                &format!("web-{}", i),
            )
            .with_clock(clock.clone());
            let handler: Arc<dyn LeadershipHandler> = tracker.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                elector.run(handler, token).await;
            }));
            replicas.push(Replica { store, tracker });
        }
        (replicas, handles)
    }

    fn leaders(replicas: &[Replica]) -> Vec<usize> {
        replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.tracker.leading.load(Ordering::SeqCst))
            .map(|(i, _)| i)
            .collect()
    }

    /// Story: several replicas of a Deployment race for the same lease;
    /// exactly one runs the scheduler, and when it is cut off another takes
    /// over without ever overlapping
    #[tokio::test(start_paused = true)]
    async fn story_single_active_scheduler_with_failover() {
        let shared = Arc::new(InMemoryLeaseStore::new());
        let clock = Arc::new(TokioClock::new());
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let (replicas, handles) =
            spawn_replicas(5, &shared, &clock, &shutdown, &active, &max_active);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let first = leaders(&replicas);
        assert_eq!(first.len(), 1, "exactly one leader expected");
        let first = first[0];
        assert_eq!(
            shared.holder("cadence-lock-deployment-web").as_deref(),
            Some(format!("web-{}", first).as_str())
        );

        // Cut the leader off from the lease store
        replicas[first].store.partitioned.store(true, Ordering::SeqCst);

        // The old leader steps down at the renew deadline
        tokio::time::sleep(RENEW_DEADLINE + RETRY_PERIOD).await;
        assert!(!replicas[first].tracker.leading.load(Ordering::SeqCst));

        // Someone else leads once the lease expires
        tokio::time::sleep(LEASE_DURATION).await;
        let second = leaders(&replicas);
        assert_eq!(second.len(), 1);
        assert_ne!(second[0], first);

        assert_eq!(max_active.load(Ordering::SeqCst), 1, "leaders overlapped");

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_lease_for_fast_failover() {
        let shared = Arc::new(InMemoryLeaseStore::new());
        let clock = Arc::new(TokioClock::new());
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let (replicas, handles) =
            spawn_replicas(1, &shared, &clock, &shutdown, &active, &max_active);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(leaders(&replicas), vec![0]);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(shared.holder("cadence-lock-deployment-web").is_none());
        assert_eq!(replicas[0].tracker.acquisitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partitioned_leader_reacquires_after_recovery() {
        let shared = Arc::new(InMemoryLeaseStore::new());
        let clock = Arc::new(TokioClock::new());
        let shutdown = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let (replicas, handles) =
            spawn_replicas(1, &shared, &clock, &shutdown, &active, &max_active);
        tokio::time::sleep(Duration::from_secs(5)).await;
        replicas[0].store.partitioned.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(leaders(&replicas).is_empty());

        replicas[0].store.partitioned.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(leaders(&replicas), vec![0]);
        assert_eq!(replicas[0].tracker.acquisitions.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn in_memory_store_rejects_stale_writes() {
        let store = InMemoryLeaseStore::new();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some("l".to_string()),
                ..Default::default()
            },
            spec: None,
        };
        assert!(store.create(&lease).await.unwrap());
        assert!(!store.create(&lease).await.unwrap());

        let current = store.get("l").await.unwrap().unwrap();
        assert!(store.replace(&current).await.unwrap());
        // Same resourceVersion again is now stale
        assert!(!store.replace(&current).await.unwrap());
    }
}
