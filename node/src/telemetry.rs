use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SyncTelemetry {
    waiting_missions: AtomicU64,
    in_flight_missions: AtomicU64,
    done_blocks: AtomicU64,
    mission_timeouts: AtomicU64,
    hash_queries_served: AtomicU64,
    retry_rounds: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct TelemetrySnapshot {
    pub waiting_missions: u64,
    pub in_flight_missions: u64,
    pub done_blocks: u64,
    pub mission_timeouts: u64,
    pub hash_queries_served: u64,
    pub retry_rounds: u64,
}

impl SyncTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn mission_created(&self) {
        self.waiting_missions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mission_dispatched(&self) {
        self.waiting_missions.fetch_sub(1, Ordering::Relaxed);
        self.in_flight_missions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mission_timed_out(&self) {
        self.in_flight_missions.fetch_sub(1, Ordering::Relaxed);
        self.waiting_missions.fetch_add(1, Ordering::Relaxed);
        self.mission_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mission_completed(&self, was_assigned: bool) {
        if was_assigned {
            self.in_flight_missions.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.waiting_missions.fetch_sub(1, Ordering::Relaxed);
        }
        self.done_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_missions(&self) {
        self.waiting_missions.store(0, Ordering::Relaxed);
        self.in_flight_missions.store(0, Ordering::Relaxed);
    }

    pub(crate) fn hash_query_served(&self) {
        self.hash_queries_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retry_round(&self) {
        self.retry_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            waiting_missions: self.waiting_missions.load(Ordering::Relaxed),
            in_flight_missions: self.in_flight_missions.load(Ordering::Relaxed),
            done_blocks: self.done_blocks.load(Ordering::Relaxed),
            mission_timeouts: self.mission_timeouts.load(Ordering::Relaxed),
            hash_queries_served: self.hash_queries_served.load(Ordering::Relaxed),
            retry_rounds: self.retry_rounds.load(Ordering::Relaxed),
        }
    }
}
