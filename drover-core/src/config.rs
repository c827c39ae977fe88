use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};

/// Knobs shared by every drover agent.
///
/// All sections carry defaults so a deployment only spells out what it
/// changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    /// Queue engine tuning.
    pub fifo: FifoConfig,
    /// Monitor-queue population and scheduling.
    pub monitor: MonitorConfig,
    /// Lease lifetimes.
    pub lease: LeaseConfig,
    /// Agent loop batch size and cadence.
    pub agent: AgentConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FifoConfig {
    /// How often a blocking `get` re-polls the store while waiting.
    pub poll_interval_ms: u64,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl FifoConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Name of the time-ordered monitor queue.
    pub queue_name: String,
    /// Name used instead of `queue_name` when `event_based` is set.
    pub event_queue_name: String,
    /// Upper bound on entities read by one populate pass.
    pub max_workers_to_populate: u64,
    /// Entities per chunk.
    pub max_workers_per_chunk: usize,
    /// Delay before a checked chunk is due again.
    pub check_interval_secs: u64,
    /// Wall-clock budget a monitor agent spends draining due chunks per pass.
    pub fifo_check_duration_secs: u64,
    /// Feed the event-driven monitor queue instead of the periodic one.
    pub event_based: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_name: "monitor".to_string(),
            event_queue_name: "monitor_event".to_string(),
            max_workers_to_populate: 1 << 32,
            max_workers_per_chunk: 500,
            check_interval_secs: 300,
            fifo_check_duration_secs: 30,
            event_based: false,
        }
    }
}

impl MonitorConfig {
    /// Queue this configuration feeds.
    pub fn active_queue_name(&self) -> &str {
        if self.event_based {
            &self.event_queue_name
        } else {
            &self.queue_name
        }
    }

    /// Populate cap clamped to the platform's address width.
    pub fn populate_limit(&self) -> usize {
        usize::try_from(self.max_workers_to_populate).unwrap_or(usize::MAX)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn fifo_check_duration(&self) -> Duration {
        Duration::from_secs(self.fifo_check_duration_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease taken on an entity row before acting on it.
    pub lease_interval_secs: u64,
    /// Lease on generic keys in the lock table.
    pub object_lock_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_interval_secs: 600,
            object_lock_interval_secs: 120,
        }
    }
}

impl LeaseConfig {
    pub fn lease_interval(&self) -> Duration {
        Duration::from_secs(self.lease_interval_secs)
    }

    pub fn object_lock_interval(&self) -> Duration {
        Duration::from_secs(self.object_lock_interval_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Candidates fetched per pass.
    pub max_workers: usize,
    /// Sleep between passes.
    pub sleep_time_secs: u64,
    /// Lease each agent takes on an entity before acting.
    pub lock_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_workers: 500,
            sleep_time_secs: 60,
            lock_interval_secs: 600,
        }
    }
}

impl AgentConfig {
    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    pub fn lock_interval(&self) -> Duration {
        Duration::from_secs(self.lock_interval_secs)
    }
}

impl DroverConfig {
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 6] = [
            (self.fifo.poll_interval_ms == 0, "fifo.poll_interval_ms"),
            (self.monitor.max_workers_per_chunk == 0, "monitor.max_workers_per_chunk"),
            (self.monitor.max_workers_to_populate == 0, "monitor.max_workers_to_populate"),
            (self.agent.max_workers == 0, "agent.max_workers"),
            (self.agent.lock_interval_secs == 0, "agent.lock_interval_secs"),
            (
                self.lease.lease_interval_secs == 0 || self.lease.object_lock_interval_secs == 0,
                "lease intervals",
            ),
        ];
        if let Some((_, field)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(DroverError::Config(format!("{field} must be greater than zero")));
        }
        if self.monitor.active_queue_name().trim().is_empty() {
            return Err(DroverError::Config("monitor queue name must not be empty".into()));
        }
        Ok(())
    }
}
