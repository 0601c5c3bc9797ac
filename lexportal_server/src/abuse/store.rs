//! Violation tracking store
//!
//! The guard talks to an injectable [`ViolationStore`]. Two backends exist:
//! an in-process sharded map for single-node deployments and Redis for
//! sharing ban state across replicas.

use super::identity::ClientIdentity;
use super::policy::BanPolicy;
use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::*;
use fred::types::Expiration;
use lexportal_common::constants;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Ban state of an identity at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    /// Not banned
    Clear,
    /// Banned for `remaining` more
    Banned { remaining: Duration },
}

/// What recording a violation led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// Counted, still under the threshold
    Recorded { count: u32 },
    /// This violation crossed the threshold and started a ban
    BanStarted { count: u32, ban: Duration },
    /// Another request banned the identity first; nothing was counted
    AlreadyBanned { remaining: Duration },
}

/// Snapshot of store occupancy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub tracked_identities: usize,
    pub banned_identities: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),
}

/// Shared per-identity violation state.
///
/// Every method must be atomic per identity: two concurrent
/// `record_violation` calls for the same identity must observe each other.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Backend name for logs and stats
    fn backend(&self) -> &'static str;

    /// Current ban state; an expired ban is cleared as a side effect
    async fn ban_status(&self, identity: ClientIdentity, now: Instant) -> Result<BanStatus, StoreError>;

    /// Count one violation and escalate to a ban when the policy says so
    async fn record_violation(
        &self,
        identity: ClientIdentity,
        policy: &BanPolicy,
        now: Instant,
    ) -> Result<ViolationOutcome, StoreError>;

    /// Forget everything about an identity; returns whether anything existed
    async fn clear(&self, identity: ClientIdentity) -> Result<bool, StoreError>;

    /// Purge idle and expired records; returns how many were removed
    async fn sweep(&self, policy: &BanPolicy, now: Instant) -> Result<usize, StoreError>;

    /// Occupancy, for backends that can enumerate their keys
    async fn stats(&self, _now: Instant) -> Result<Option<StoreStats>, StoreError> {
        Ok(None)
    }
}

/// Redis-backed store for multi-replica deployments.
///
/// Counters live under `abuse:violations:<ip>` with the tracking window as
/// TTL; bans live under `abuse:ban:<ip>` with the ban duration as TTL.
#[derive(Clone)]
pub struct RedisViolationStore {
    redis: Client,
}

impl RedisViolationStore {
    pub fn new(redis: Client) -> Self {
        Self { redis }
    }

    fn violation_key(identity: ClientIdentity) -> String {
        format!("{}{}", constants::VIOLATION_PREFIX, identity)
    }

    fn ban_key(identity: ClientIdentity) -> String {
        format!("{}{}", constants::BAN_PREFIX, identity)
    }

    async fn ban_ttl(&self, identity: ClientIdentity) -> Result<Option<Duration>, StoreError> {
        let ttl: i64 = self.redis.ttl(&Self::ban_key(identity)).await?;
        Ok((ttl > 0).then(|| Duration::from_secs(ttl as u64)))
    }
}

/// Whole seconds for a Redis TTL, clamped to what Redis accepts
fn secs_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs().max(1)).unwrap_or(i64::MAX)
}

#[async_trait]
impl ViolationStore for RedisViolationStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ban_status(&self, identity: ClientIdentity, _now: Instant) -> Result<BanStatus, StoreError> {
        Ok(match self.ban_ttl(identity).await? {
            Some(remaining) => BanStatus::Banned { remaining },
            None => BanStatus::Clear,
        })
    }

    async fn record_violation(
        &self,
        identity: ClientIdentity,
        policy: &BanPolicy,
        _now: Instant,
    ) -> Result<ViolationOutcome, StoreError> {
        let key = Self::violation_key(identity);

        // INCR is atomic, so each concurrent caller sees a distinct count.
        // The TTL is pushed back on every hit: the count only lapses after a
        // full window without violations.
        let pipeline = self.redis.pipeline();
        let _: () = pipeline.incr(&key).await?;
        let _: () = pipeline.expire(&key, secs_i64(policy.window), None).await?;
        let (count, _): (i64, i64) = pipeline.all().await?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);

        if policy.is_exceeded(count) {
            let ban_secs = secs_i64(policy.ban_duration);
            self.redis
                .set::<(), _, _>(
                    &Self::ban_key(identity),
                    i64::from(count),
                    Some(Expiration::EX(ban_secs)),
                    None,
                    false,
                )
                .await?;
            self.redis.del::<i64, _>(&key).await?;

            return Ok(ViolationOutcome::BanStarted {
                count,
                ban: Duration::from_secs(ban_secs as u64),
            });
        }

        // A request racing the ban may have restarted the counter after DEL
        if let Some(remaining) = self.ban_ttl(identity).await? {
            self.redis.del::<i64, _>(&key).await?;
            return Ok(ViolationOutcome::AlreadyBanned { remaining });
        }

        Ok(ViolationOutcome::Recorded { count })
    }

    async fn clear(&self, identity: ClientIdentity) -> Result<bool, StoreError> {
        let violations: i64 = self.redis.del(&Self::violation_key(identity)).await?;
        let bans: i64 = self.redis.del(&Self::ban_key(identity)).await?;
        Ok(violations + bans > 0)
    }

    async fn sweep(&self, _policy: &BanPolicy, _now: Instant) -> Result<usize, StoreError> {
        // Key TTLs expire records server-side
        Ok(0)
    }
}

/// In-memory store for single-node deployments
pub mod local {
    use super::*;
    use dashmap::DashMap;

    /// Per-identity state
    #[derive(Debug, Clone)]
    pub struct ViolationRecord {
        pub count: u32,
        pub first_violation_at: Instant,
        pub last_seen: Instant,
        pub banned_until: Option<Instant>,
    }

    impl ViolationRecord {
        fn fresh(now: Instant) -> Self {
            Self {
                count: 0,
                first_violation_at: now,
                last_seen: now,
                banned_until: None,
            }
        }

        fn is_banned_at(&self, now: Instant) -> bool {
            self.banned_until.is_some_and(|until| until > now)
        }

        fn is_stale_at(&self, policy: &BanPolicy, now: Instant) -> bool {
            match self.banned_until {
                Some(until) => until <= now,
                None => now.duration_since(self.last_seen) > policy.window,
            }
        }
    }

    /// End of a ban starting at `now`, shortened if the clock cannot represent it
    fn ban_deadline(now: Instant, ban: Duration) -> (Instant, Duration) {
        if let Some(until) = now.checked_add(ban) {
            return (until, ban);
        }
        let fallback = Duration::from_secs(MAX_LOCAL_BAN_SECS);
        match now.checked_add(fallback) {
            Some(until) => (until, fallback),
            None => (now, Duration::ZERO),
        }
    }

    /// Upper bound used when a ban would overflow the clock (one year)
    const MAX_LOCAL_BAN_SECS: u64 = 365 * 24 * 60 * 60;

    /// Sharded map keyed by identity; the entry lock makes each
    /// read-increment-compare atomic without a global lock.
    #[derive(Default)]
    pub struct LocalViolationStore {
        records: DashMap<ClientIdentity, ViolationRecord>,
    }

    impl LocalViolationStore {
        pub fn new() -> Self {
            Self {
                records: DashMap::new(),
            }
        }

        /// Copy of an identity's record
        #[cfg(test)]
        pub fn record(&self, identity: ClientIdentity) -> Option<ViolationRecord> {
            self.records.get(&identity).map(|r| r.value().clone())
        }

        #[cfg(test)]
        pub fn len(&self) -> usize {
            self.records.len()
        }

        #[cfg(test)]
        pub fn is_empty(&self) -> bool {
            self.records.is_empty()
        }
    }

    #[async_trait]
    impl ViolationStore for LocalViolationStore {
        fn backend(&self) -> &'static str {
            "memory"
        }

        async fn ban_status(&self, identity: ClientIdentity, now: Instant) -> Result<BanStatus, StoreError> {
            let banned_until = match self.records.get(&identity) {
                Some(record) => record.banned_until,
                None => return Ok(BanStatus::Clear),
            };

            match banned_until {
                Some(until) if until > now => Ok(BanStatus::Banned {
                    remaining: until - now,
                }),
                Some(_) => {
                    // Ban ran out: start over as a fresh identity
                    self.records
                        .remove_if(&identity, |_, record| {
                            record.banned_until.is_some_and(|until| until <= now)
                        });
                    Ok(BanStatus::Clear)
                }
                None => Ok(BanStatus::Clear),
            }
        }

        async fn record_violation(
            &self,
            identity: ClientIdentity,
            policy: &BanPolicy,
            now: Instant,
        ) -> Result<ViolationOutcome, StoreError> {
            let mut entry = self
                .records
                .entry(identity)
                .or_insert_with(|| ViolationRecord::fresh(now));
            let record = entry.value_mut();

            if let Some(until) = record.banned_until {
                if until > now {
                    return Ok(ViolationOutcome::AlreadyBanned {
                        remaining: until - now,
                    });
                }
                *record = ViolationRecord::fresh(now);
            } else if now.duration_since(record.last_seen) > policy.window {
                *record = ViolationRecord::fresh(now);
            }

            record.count = record.count.saturating_add(1);
            record.last_seen = now;

            if policy.is_exceeded(record.count) {
                let (until, ban) = ban_deadline(now, policy.ban_duration);
                record.banned_until = Some(until);
                tracing::debug!(
                    ip = %identity,
                    active_secs = now.duration_since(record.first_violation_at).as_secs(),
                    "Violation threshold crossed"
                );
                return Ok(ViolationOutcome::BanStarted {
                    count: record.count,
                    ban,
                });
            }

            Ok(ViolationOutcome::Recorded {
                count: record.count,
            })
        }

        async fn clear(&self, identity: ClientIdentity) -> Result<bool, StoreError> {
            Ok(self.records.remove(&identity).is_some())
        }

        async fn sweep(&self, policy: &BanPolicy, now: Instant) -> Result<usize, StoreError> {
            let mut removed = 0;
            self.records.retain(|_, record| {
                let keep = !record.is_stale_at(policy, now);
                if !keep {
                    removed += 1;
                }
                keep
            });
            Ok(removed)
        }

        async fn stats(&self, now: Instant) -> Result<Option<StoreStats>, StoreError> {
            let mut stats = StoreStats::default();
            for entry in self.records.iter() {
                stats.tracked_identities += 1;
                if entry.value().is_banned_at(now) {
                    stats.banned_identities += 1;
                }
            }
            Ok(Some(stats))
        }
    }
}
