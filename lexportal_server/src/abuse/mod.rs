//! Abuse prevention module
//!
//! Bans clients that repeatedly probe sensitive paths:
//! - Probe classification (path denylist, SQL injection fragments)
//! - Client identity resolution behind trusted proxies
//! - Violation counting and timed bans (in-memory or Redis)
//! - Axum middleware wiring it together

pub mod blocklist;
pub mod guard;
pub mod identity;
pub mod policy;
pub mod store;

pub use guard::{guard_middleware, spawn_sweeper, AbuseGuard};
pub use identity::ClientIdentity;
pub use store::{local::LocalViolationStore, RedisViolationStore, ViolationStore};
