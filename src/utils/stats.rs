//! Process-wide counters for solver and resolution activity.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static QUERIES: AtomicU64 = AtomicU64::new(0);
static QUERY_FAILURES: AtomicU64 = AtomicU64::new(0);
static SOLVER_TIME_US: AtomicU64 = AtomicU64::new(0);
static RESOLUTIONS: AtomicU64 = AtomicU64::new(0);
static RESOLVE_TIME_US: AtomicU64 = AtomicU64::new(0);
static REPAIRS_ATTEMPTED: AtomicU64 = AtomicU64::new(0);
static REPAIRS_FOUND: AtomicU64 = AtomicU64::new(0);
static GROWTH_REALLOCATIONS: AtomicU64 = AtomicU64::new(0);

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

pub fn record_query(elapsed: Duration, failed: bool) {
    QUERIES.fetch_add(1, Ordering::Relaxed);
    if failed {
        QUERY_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
    SOLVER_TIME_US.fetch_add(micros(elapsed), Ordering::Relaxed);
}

pub fn record_resolution(elapsed: Duration) {
    RESOLUTIONS.fetch_add(1, Ordering::Relaxed);
    RESOLVE_TIME_US.fetch_add(micros(elapsed), Ordering::Relaxed);
}

pub fn record_repair(found: bool) {
    REPAIRS_ATTEMPTED.fetch_add(1, Ordering::Relaxed);
    if found {
        REPAIRS_FOUND.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_growth() {
    GROWTH_REALLOCATIONS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub query_failures: u64,
    pub solver_time_us: u64,
    pub resolutions: u64,
    pub resolve_time_us: u64,
    pub repairs_attempted: u64,
    pub repairs_found: u64,
    pub growth_reallocations: u64,
}

pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        queries: QUERIES.load(Ordering::Relaxed),
        query_failures: QUERY_FAILURES.load(Ordering::Relaxed),
        solver_time_us: SOLVER_TIME_US.load(Ordering::Relaxed),
        resolutions: RESOLUTIONS.load(Ordering::Relaxed),
        resolve_time_us: RESOLVE_TIME_US.load(Ordering::Relaxed),
        repairs_attempted: REPAIRS_ATTEMPTED.load(Ordering::Relaxed),
        repairs_found: REPAIRS_FOUND.load(Ordering::Relaxed),
        growth_reallocations: GROWTH_REALLOCATIONS.load(Ordering::Relaxed),
    }
}
