use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::download::SchedulerConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Height slack below the network tip before catch-up starts.
    pub sync_slack: u64,
    /// Heights covered by one ranged hash query.
    pub hash_query_window: u64,
    pub retry_interval: Duration,
    pub mission_timeout: Duration,
    /// Pause inserted after every tenth query window.
    pub query_pacing: Duration,
    /// Widest hash query this node will answer.
    pub max_acceptable_length: u64,
    /// Ancestors inspected by the fork-stall heuristic.
    pub confirm_number: u64,
    pub peer_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_slack: 2,
            hash_query_window: 10,
            retry_interval: Duration::from_secs(5),
            mission_timeout: Duration::from_secs(3),
            query_pacing: Duration::from_secs(1),
            max_acceptable_length: 100,
            confirm_number: 7,
            peer_concurrency: 20,
        }
    }
}

impl SyncConfig {
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            mission_timeout: self.mission_timeout,
            peer_concurrency: self.peer_concurrency,
        }
    }
}
