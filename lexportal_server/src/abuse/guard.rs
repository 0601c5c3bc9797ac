//! Abuse guard middleware.
//!
//! Runs before every handler: banned identities get 429 on any path,
//! sensitive requests are counted, and crossing the threshold starts a ban.

use super::blocklist::{ProbeClassifier, RequestCheck};
use super::identity::{ClientIdentity, IdentityResolver};
use super::policy::BanPolicy;
use super::store::{local::LocalViolationStore, BanStatus, StoreError, StoreStats, ViolationOutcome, ViolationStore};
use crate::config::AbuseConfig;
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use ipnet::IpNet;
use lexportal_common::{constants, ErrorBody};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass through untouched
    Forward,
    /// Pass through; a violation was counted
    ForwardWithViolation { count: u32 },
    /// Answer without reaching the handler
    Reject(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Identity was already banned
    Banned { retry_after: Duration },
    /// This request crossed the threshold
    BanTriggered { retry_after: Duration },
    /// Guard failed and is configured to fail closed
    Unavailable,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let (status, detail, retry_after) = match self {
            Rejection::Banned { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                constants::BANNED_MESSAGE,
                Some(retry_after),
            ),
            Rejection::BanTriggered { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                constants::BAN_TRIGGERED_MESSAGE,
                Some(retry_after),
            ),
            Rejection::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                constants::GUARD_UNAVAILABLE_MESSAGE,
                None,
            ),
        };

        let mut response = (status, Json(ErrorBody::new(detail))).into_response();
        if let Some(retry_after) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
        }
        response
    }
}

/// Whole seconds, rounded up, never zero
fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}

struct GuardInner {
    enabled: bool,
    fail_open: bool,
    policy: BanPolicy,
    trusted_ips: Vec<IpNet>,
    classifier: ProbeClassifier,
    resolver: IdentityResolver,
    store: Arc<dyn ViolationStore>,
}

/// Request interceptor owning the violation store
#[derive(Clone)]
pub struct AbuseGuard {
    inner: Arc<GuardInner>,
}

impl AbuseGuard {
    pub fn new(config: &AbuseConfig, store: Arc<dyn ViolationStore>) -> Self {
        let classifier = ProbeClassifier::new(&config.sensitive_paths, config.detect_sql_injection);

        tracing::info!(
            backend = store.backend(),
            patterns = classifier.pattern_count(),
            max_violations = config.policy.max_violations,
            mode = %config.policy.mode,
            tolerated = config.policy.tolerated(),
            ban_secs = config.policy.ban_duration.as_secs(),
            window_secs = config.policy.window.as_secs(),
            "Abuse guard initialized"
        );
        if !config.trusted_ips.is_empty() {
            tracing::info!(count = config.trusted_ips.len(), "Abuse guard trusted IPs enabled");
        }

        Self {
            inner: Arc::new(GuardInner {
                enabled: config.enabled,
                fail_open: config.fail_open,
                policy: config.policy.clone(),
                trusted_ips: config.trusted_ips.clone(),
                classifier,
                resolver: IdentityResolver::new(config.trusted_proxies.clone()),
                store,
            }),
        }
    }

    /// Guard backed by the in-process store
    pub fn in_memory(config: &AbuseConfig) -> Self {
        Self::new(config, Arc::new(LocalViolationStore::new()))
    }

    pub fn policy(&self) -> &BanPolicy {
        &self.inner.policy
    }

    pub fn backend(&self) -> &'static str {
        self.inner.store.backend()
    }

    pub fn is_trusted(&self, identity: ClientIdentity) -> bool {
        let ip = identity.ip();
        self.inner.trusted_ips.iter().any(|net| net.contains(&ip))
    }

    /// Decide what to do with a request from `identity`
    pub async fn inspect(&self, identity: ClientIdentity, path: &str, query: Option<&str>) -> Verdict {
        self.inspect_at(identity, path, query, Instant::now()).await
    }

    pub(crate) async fn inspect_at(
        &self,
        identity: ClientIdentity,
        path: &str,
        query: Option<&str>,
        now: Instant,
    ) -> Verdict {
        if !self.inner.enabled || self.is_trusted(identity) {
            return Verdict::Forward;
        }

        match self.evaluate(identity, path, query, now).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(ip = %identity, path = path, error = %e, "Abuse guard store failure");
                self.on_failure()
            }
        }
    }

    async fn evaluate(
        &self,
        identity: ClientIdentity,
        path: &str,
        query: Option<&str>,
        now: Instant,
    ) -> Result<Verdict, StoreError> {
        let store = &self.inner.store;

        if let BanStatus::Banned { remaining } = store.ban_status(identity, now).await? {
            tracing::debug!(ip = %identity, path = path, "Rejected banned client");
            return Ok(Verdict::Reject(Rejection::Banned {
                retry_after: remaining,
            }));
        }

        let reason = match self.inner.classifier.check(path, query) {
            RequestCheck::Normal => return Ok(Verdict::Forward),
            RequestCheck::Probe(reason) => reason,
        };

        let outcome = store.record_violation(identity, &self.inner.policy, now).await?;
        let verdict = match outcome {
            ViolationOutcome::Recorded { count } => {
                tracing::debug!(
                    ip = %identity,
                    path = path,
                    count = count,
                    reason = %reason.message(),
                    "Violation recorded"
                );
                Verdict::ForwardWithViolation { count }
            }
            ViolationOutcome::BanStarted { count, ban } => {
                tracing::warn!(
                    ip = %identity,
                    path = path,
                    count = count,
                    ban_secs = ban.as_secs(),
                    reason = %reason.message(),
                    "Client banned after repeated violations"
                );
                Verdict::Reject(Rejection::BanTriggered { retry_after: ban })
            }
            ViolationOutcome::AlreadyBanned { remaining } => Verdict::Reject(Rejection::Banned {
                retry_after: remaining,
            }),
        };

        Ok(verdict)
    }

    fn on_failure(&self) -> Verdict {
        if self.inner.fail_open {
            Verdict::Forward
        } else {
            Verdict::Reject(Rejection::Unavailable)
        }
    }

    /// Lift a ban (and any pending violations) for an identity
    pub async fn unban(&self, identity: ClientIdentity) -> Result<bool, StoreError> {
        let existed = self.inner.store.clear(identity).await?;
        if existed {
            tracing::info!(ip = %identity, "Abuse record cleared");
        }
        Ok(existed)
    }

    pub async fn stats(&self) -> Result<Option<StoreStats>, StoreError> {
        self.inner.store.stats(Instant::now()).await
    }

    /// Purge idle and expired records
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        self.sweep_at(Instant::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: Instant) -> Result<usize, StoreError> {
        self.inner.store.sweep(&self.inner.policy, now).await
    }
}

/// Axum middleware; install with `middleware::from_fn_with_state`
pub async fn guard_middleware(State(guard): State<AbuseGuard>, request: Request, next: Next) -> Response {
    let identity = match guard.inner.resolver.resolve(&request) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!(error = %e, "Could not determine client identity");
            return match guard.on_failure() {
                Verdict::Reject(rejection) => rejection.into_response(),
                _ => next.run(request).await,
            };
        }
    };

    let verdict = guard
        .inspect(identity, request.uri().path(), request.uri().query())
        .await;

    match verdict {
        Verdict::Reject(rejection) => rejection.into_response(),
        Verdict::Forward | Verdict::ForwardWithViolation { .. } => next.run(request).await,
    }
}

/// Start the background task that sweeps idle records
pub fn spawn_sweeper(
    guard: AbuseGuard,
    interval: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match guard.sweep().await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "Swept idle abuse records"),
                        Err(e) => tracing::error!("Failed to sweep abuse records: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Abuse sweeper shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::IpAddr;

    fn identity(s: &str) -> ClientIdentity {
        ClientIdentity::new(s.parse::<IpAddr>().unwrap())
    }

    fn guard() -> AbuseGuard {
        AbuseGuard::in_memory(&AbuseConfig::default())
    }

    /// Store that fails every call
    struct BrokenStore;

    #[async_trait]
    impl ViolationStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }

        async fn ban_status(&self, _: ClientIdentity, _: Instant) -> Result<BanStatus, StoreError> {
            Err(StoreError::Redis(fred::error::Error::new(
                fred::error::ErrorKind::IO,
                "connection refused",
            )))
        }

        async fn record_violation(
            &self,
            _: ClientIdentity,
            _: &BanPolicy,
            _: Instant,
        ) -> Result<ViolationOutcome, StoreError> {
            unreachable!("ban_status fails first")
        }

        async fn clear(&self, _: ClientIdentity) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn sweep(&self, _: &BanPolicy, _: Instant) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_sixth_probe_bans() {
        let guard = guard();
        let ip = identity("1.2.3.4");

        for i in 1..=5 {
            assert_eq!(
                guard.inspect(ip, "/.env", None).await,
                Verdict::ForwardWithViolation { count: i }
            );
        }

        match guard.inspect(ip, "/.env", None).await {
            Verdict::Reject(Rejection::BanTriggered { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(900));
            }
            other => panic!("expected ban, got {:?}", other),
        }

        assert!(matches!(
            guard.inspect(ip, "/.env", None).await,
            Verdict::Reject(Rejection::Banned { .. })
        ));
    }

    #[tokio::test]
    async fn test_ban_covers_every_path() {
        let guard = guard();
        let ip = identity("1.2.3.4");
        for _ in 0..6 {
            guard.inspect(ip, "/phpmyadmin", None).await;
        }

        assert!(matches!(
            guard.inspect(ip, "/api/v1/health", None).await,
            Verdict::Reject(Rejection::Banned { .. })
        ));
        assert!(matches!(
            guard.inspect(ip, "/", None).await,
            Verdict::Reject(Rejection::Banned { .. })
        ));
    }

    #[tokio::test]
    async fn test_normal_traffic_never_counts() {
        let guard = guard();
        let ip = identity("8.8.4.4");
        for _ in 0..50 {
            assert_eq!(guard.inspect(ip, "/api/v1/cases", None).await, Verdict::Forward);
        }
        assert_eq!(
            guard.inspect(ip, "/.env", None).await,
            Verdict::ForwardWithViolation { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_isolation_between_identities() {
        let guard = guard();
        let attacker = identity("10.0.0.1");
        let bystander = identity("10.0.0.2");
        for _ in 0..6 {
            guard.inspect(attacker, "/.git/config", None).await;
        }

        assert_eq!(guard.inspect(bystander, "/api/v1/health", None).await, Verdict::Forward);
        assert_eq!(
            guard.inspect(bystander, "/.env", None).await,
            Verdict::ForwardWithViolation { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_ban_expiry_allows_new_probe() {
        let mut config = AbuseConfig::default();
        config.policy = BanPolicy::new(5, 60, 300);
        let guard = AbuseGuard::in_memory(&config);
        let ip = identity("1.2.3.4");
        let now = Instant::now();

        for _ in 0..6 {
            guard.inspect_at(ip, "/.env", None, now).await;
        }
        let later = now + Duration::from_secs(61);

        assert_eq!(guard.inspect_at(ip, "/api/v1/health", None, later).await, Verdict::Forward);
        assert_eq!(
            guard.inspect_at(ip, "/.env", None, later).await,
            Verdict::ForwardWithViolation { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_reaches_mode_bans_on_fifth() {
        let mut config = AbuseConfig::default();
        config.policy = BanPolicy::new(5, 900, 300).with_mode(crate::abuse::policy::ThresholdMode::Reaches);
        let guard = AbuseGuard::in_memory(&config);
        let ip = identity("1.2.3.4");

        for _ in 0..4 {
            assert!(matches!(
                guard.inspect(ip, "/.env", None).await,
                Verdict::ForwardWithViolation { .. }
            ));
        }
        assert!(matches!(
            guard.inspect(ip, "/.env", None).await,
            Verdict::Reject(Rejection::BanTriggered { .. })
        ));
    }

    #[tokio::test]
    async fn test_trusted_ip_is_never_banned() {
        let mut config = AbuseConfig::default();
        config.trusted_ips = vec!["127.0.0.1/32".parse().unwrap()];
        let guard = AbuseGuard::in_memory(&config);
        let ip = identity("127.0.0.1");

        for _ in 0..10 {
            assert_eq!(guard.inspect(ip, "/phpmyadmin", None).await, Verdict::Forward);
        }
        assert_eq!(guard.stats().await.unwrap().unwrap().tracked_identities, 0);
    }

    #[tokio::test]
    async fn test_mapped_ipv4_trusted_ip() {
        let mut config = AbuseConfig::default();
        config.trusted_ips = vec!["127.0.0.1/32".parse().unwrap()];
        let guard = AbuseGuard::in_memory(&config);
        let ip = identity("::ffff:127.0.0.1");

        assert!(guard.is_trusted(ip));
        for _ in 0..10 {
            assert_eq!(guard.inspect(ip, "/.env", None).await, Verdict::Forward);
        }
    }

    #[tokio::test]
    async fn test_disabled_guard_forwards() {
        let mut config = AbuseConfig::default();
        config.enabled = false;
        let guard = AbuseGuard::in_memory(&config);

        for _ in 0..10 {
            assert_eq!(guard.inspect(identity("1.1.1.1"), "/.env", None).await, Verdict::Forward);
        }
    }

    #[tokio::test]
    async fn test_sql_injection_counts_as_violation() {
        let guard = guard();
        assert_eq!(
            guard
                .inspect(identity("10.0.0.2"), "/api/v1/cases/", Some("title=%27+OR+%271%27%3D%271"))
                .await,
            Verdict::ForwardWithViolation { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let guard = AbuseGuard::new(&AbuseConfig::default(), Arc::new(BrokenStore));
        assert_eq!(guard.inspect(identity("1.2.3.4"), "/.env", None).await, Verdict::Forward);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let mut config = AbuseConfig::default();
        config.fail_open = false;
        let guard = AbuseGuard::new(&config, Arc::new(BrokenStore));
        assert_eq!(
            guard.inspect(identity("1.2.3.4"), "/", None).await,
            Verdict::Reject(Rejection::Unavailable)
        );
    }

    #[tokio::test]
    async fn test_unban() {
        let guard = guard();
        let ip = identity("1.2.3.4");
        for _ in 0..6 {
            guard.inspect(ip, "/.env", None).await;
        }

        assert!(guard.unban(ip).await.unwrap());
        assert_eq!(guard.inspect(ip, "/api/v1/health", None).await, Verdict::Forward);
    }

    #[tokio::test]
    async fn test_sweep_through_guard() {
        let guard = guard();
        let now = Instant::now();
        guard.inspect_at(identity("1.2.3.4"), "/.env", None, now).await;

        assert_eq!(guard.sweep_at(now + Duration::from_secs(10)).await.unwrap(), 0);
        assert_eq!(guard.sweep_at(now + Duration::from_secs(301)).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_probes_match_sequential_outcome() {
        let guard = guard();
        let ip = identity("1.2.3.4");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                tokio::spawn(async move { guard.inspect(ip, "/.env", None).await })
            })
            .collect();

        let mut forwarded = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Verdict::ForwardWithViolation { .. } => forwarded += 1,
                Verdict::Reject(Rejection::BanTriggered { .. } | Rejection::Banned { .. }) => rejected += 1,
                other => panic!("unexpected verdict {:?}", other),
            }
        }

        assert_eq!(forwarded, 5);
        assert_eq!(rejected, 3);
        assert!(matches!(
            guard.inspect(ip, "/api/v1/health", None).await,
            Verdict::Reject(Rejection::Banned { .. })
        ));
    }

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(900)), 900);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
