//! Performance monitor.
//!
//! Tracks, per protocol instance, how many requests were ordered and how
//! long ordering took (PRE-PREPARE time to execution). The master's
//! numbers are compared against the backups': a master that is slower
//! than the redundant instances is the signal for an instance change.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use conclave_types::{InstId, RequestKey, Timestamp};
use serde::{Deserialize, Serialize};

/// Degradation thresholds. Defaults follow the classic RBFT tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Master throughput must stay above `delta × max(backup throughput)`.
    pub delta: f64,
    /// Master moving-average latency ceiling, in seconds.
    pub lambda_secs: f64,
    /// Moving-average window: number of recent requests considered, and
    /// the minimum evidence before either predicate may fire.
    pub omega: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            delta: 0.8,
            lambda_secs: 60.0,
            omega: 5,
        }
    }
}

/// Counters for one protocol instance.
#[derive(Debug, Default, Clone)]
struct InstanceStats {
    ordered: u64,
    recent_latencies: VecDeque<Duration>,
}

impl InstanceStats {
    fn record(&mut self, latency: Duration, window: usize) {
        self.ordered += 1;
        self.recent_latencies.push_back(latency);
        while self.recent_latencies.len() > window {
            self.recent_latencies.pop_front();
        }
    }

    fn avg_latency(&self) -> Option<Duration> {
        if self.recent_latencies.is_empty() {
            return None;
        }
        let total: Duration = self.recent_latencies.iter().sum();
        Some(total / self.recent_latencies.len() as u32)
    }
}

/// Latency/throughput statistics and the master-degradation predicate.
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    /// When a request was forwarded to the replicas, keyed by request.
    started: HashMap<RequestKey, Timestamp>,
    instances: Vec<InstanceStats>,
    since: Timestamp,
}

impl Monitor {
    pub fn new(config: MonitorConfig, now: Timestamp) -> Self {
        Self {
            config,
            started: HashMap::new(),
            instances: Vec::new(),
            since: now,
        }
    }

    /// Registers one more protocol instance to track.
    pub fn add_instance(&mut self) {
        self.instances.push(InstanceStats::default());
    }

    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Clears all statistics; called after a view change.
    pub fn reset(&mut self, now: Timestamp) {
        for stats in &mut self.instances {
            *stats = InstanceStats::default();
        }
        self.started.clear();
        self.since = now;
    }

    /// Marks a request as forwarded to the replicas (ordering begins).
    pub fn request_un_ordered(&mut self, key: RequestKey, now: Timestamp) {
        self.started.entry(key).or_insert(now);
    }

    /// Marks a request as ordered by `inst_id`, returning its latency.
    ///
    /// The start mark is removed only when the master orders, so backup
    /// instances that finish later still find it.
    pub fn request_ordered(
        &mut self,
        key: &RequestKey,
        inst_id: InstId,
        now: Timestamp,
    ) -> Option<Duration> {
        let started = self.started.get(key).copied()?;
        let latency = now.saturating_sub(started);
        let window = self.config.omega;
        let stats = self.instances.get_mut(inst_id.as_usize())?;
        stats.record(latency, window);
        if inst_id.is_master() {
            self.started.remove(key);
        }
        Some(latency)
    }

    /// Requests ordered per second by an instance since the last reset.
    pub fn throughput(&self, inst_id: InstId, now: Timestamp) -> f64 {
        let Some(stats) = self.instances.get(inst_id.as_usize()) else {
            return 0.0;
        };
        let elapsed = now.saturating_sub(self.since).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        stats.ordered as f64 / elapsed
    }

    /// The master-degradation predicate: true when the master's moving
    /// average latency exceeds λ, or its throughput drops below
    /// Δ × max(backup throughput), with at least ω requests of evidence.
    pub fn is_master_degraded(&self, now: Timestamp) -> bool {
        let Some(master) = self.instances.first() else {
            return false;
        };

        // Latency check over the ω-window
        if master.recent_latencies.len() >= self.config.omega {
            if let Some(avg) = master.avg_latency() {
                if avg.as_secs_f64() > self.config.lambda_secs {
                    tracing::warn!(
                        avg_latency_secs = avg.as_secs_f64(),
                        lambda = self.config.lambda_secs,
                        "master latency above threshold"
                    );
                    return true;
                }
            }
        }

        // Throughput check against the best backup
        let best_backup = self
            .instances
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, s)| s.ordered as usize >= self.config.omega)
            .map(|(i, s)| (i, self.throughput(InstId::new(i as u8), now), s.ordered))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((inst, backup_tps, _)) = best_backup {
            let master_tps = self.throughput(InstId::MASTER, now);
            if master_tps < self.config.delta * backup_tps {
                tracing::warn!(
                    master_tps,
                    backup_tps,
                    backup_inst = inst,
                    delta = self.config.delta,
                    "master throughput below delta of best backup"
                );
                return true;
            }
        }

        false
    }

    /// One-line metric summary for the stats dump.
    pub fn pretty_metrics(&self, now: Timestamp) -> String {
        let parts: Vec<String> = (0..self.instances.len())
            .map(|i| {
                let inst = InstId::new(i as u8);
                let stats = &self.instances[i];
                format!(
                    "inst {i}: ordered={} tps={:.2}",
                    stats.ordered,
                    self.throughput(inst, now)
                )
            })
            .collect();
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::ClientId;
    use conclave_types::ReqId;

    fn key(i: u64) -> RequestKey {
        (ClientId::from("Alice"), ReqId::new(i))
    }

    fn secs(s: u64) -> Timestamp {
        Timestamp::from_nanos(s * 1_000_000_000)
    }

    fn monitor(n_instances: usize) -> Monitor {
        let mut m = Monitor::new(MonitorConfig::default(), secs(0));
        for _ in 0..n_instances {
            m.add_instance();
        }
        m
    }

    #[test]
    fn healthy_master_is_not_degraded() {
        let mut m = monitor(2);
        for i in 0..10 {
            m.request_un_ordered(key(i), secs(i));
            m.request_ordered(&key(i), InstId::new(1), secs(i + 1));
            m.request_ordered(&key(i), InstId::MASTER, secs(i + 1));
        }
        assert!(!m.is_master_degraded(secs(20)));
    }

    #[test]
    fn stalled_master_is_degraded_by_throughput() {
        let mut m = monitor(2);
        // Backup orders everything, master orders nothing
        for i in 0..10 {
            m.request_un_ordered(key(i), secs(i));
            m.request_ordered(&key(i), InstId::new(1), secs(i + 1));
        }
        assert!(m.is_master_degraded(secs(20)));
    }

    #[test]
    fn slow_master_is_degraded_by_latency() {
        let mut m = monitor(2);
        for i in 0..5 {
            m.request_un_ordered(key(i), secs(i * 100));
            // 90-second latency per request, above the 60 s lambda
            m.request_ordered(&key(i), InstId::MASTER, secs(i * 100 + 90));
        }
        assert!(m.is_master_degraded(secs(600)));
    }

    #[test]
    fn too_little_evidence_does_not_degrade() {
        let mut m = monitor(2);
        // Only 2 requests (< omega) through the backup
        for i in 0..2 {
            m.request_un_ordered(key(i), secs(i));
            m.request_ordered(&key(i), InstId::new(1), secs(i + 1));
        }
        assert!(!m.is_master_degraded(secs(10)));
    }

    #[test]
    fn reset_clears_evidence() {
        let mut m = monitor(2);
        for i in 0..10 {
            m.request_un_ordered(key(i), secs(i));
            m.request_ordered(&key(i), InstId::new(1), secs(i + 1));
        }
        assert!(m.is_master_degraded(secs(20)));
        m.reset(secs(20));
        assert!(!m.is_master_degraded(secs(30)));
    }

    #[test]
    fn latency_measured_from_forward_to_order() {
        let mut m = monitor(1);
        m.request_un_ordered(key(1), secs(10));
        let latency = m.request_ordered(&key(1), InstId::MASTER, secs(13)).unwrap();
        assert_eq!(latency, Duration::from_secs(3));
        // Master removal: a second order finds no start mark
        assert!(m.request_ordered(&key(1), InstId::MASTER, secs(14)).is_none());
    }
}
