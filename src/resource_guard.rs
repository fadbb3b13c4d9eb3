// SPDX-License-Identifier: BUSL-1.1

//! Resource Guard: periodic CPU/RSS/task sampling, admission predicates,
//! the ingress CPU brake, and the ingress/broadcast token buckets.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;

use crate::config::FanoutConfig;
use crate::error::FanoutError;
use crate::rate_limiter::TokenBucket;

/// Fixed-point CPU percentage, stored as `percent * 100` so the sampler
/// avoids floats in atomics.
const CPU_SCALE: i64 = 100;

/// Sampled, atomically-published resource state plus the admission
/// predicates and backpressure gate that read it.
pub struct ResourceGuard {
    cpu_percent_x100: AtomicI64,
    rss_bytes: AtomicU64,
    /// Best-effort live task estimate: two tasks per connection (Read Pipe +
    /// Write Pipe) plus a small fixed baseline for background tasks. Rust
    /// has no direct goroutine-count equivalent; this is the engine's
    /// stand-in for a max-concurrent-task admission predicate.
    live_tasks: AtomicUsize,
    cgroup_throttled_periods: AtomicU64,
    config: ResourceLimits,
    pub ingress_bucket: TokenBucket,
    pub broadcast_bucket: TokenBucket,
}

struct ResourceLimits {
    max_connections: usize,
    cpu_reject_threshold: f32,
    cpu_pause_threshold: f32,
    memory_limit_bytes: u64,
    max_tasks: usize,
}

impl ResourceGuard {
    pub fn new(config: &FanoutConfig) -> Arc<Self> {
        Arc::new(Self {
            cpu_percent_x100: AtomicI64::new(0),
            rss_bytes: AtomicU64::new(0),
            live_tasks: AtomicUsize::new(0),
            cgroup_throttled_periods: AtomicU64::new(0),
            config: ResourceLimits {
                max_connections: config.max_connections,
                cpu_reject_threshold: config.cpu_reject_threshold,
                cpu_pause_threshold: config.cpu_pause_threshold,
                memory_limit_bytes: config.memory_limit_bytes,
                max_tasks: config.max_tasks,
            },
            ingress_bucket: TokenBucket::with_double_burst(config.ingress_rate_per_sec),
            broadcast_bucket: TokenBucket::with_double_burst(config.broadcast_rate_per_sec),
        })
    }

    pub fn cpu_percent(&self) -> f32 {
        self.cpu_percent_x100.load(Ordering::Relaxed) as f32 / CPU_SCALE as f32
    }

    pub fn rss_bytes(&self) -> u64 {
        self.rss_bytes.load(Ordering::Relaxed)
    }

    pub fn note_connection_admitted(&self) {
        self.live_tasks.fetch_add(2, Ordering::Relaxed);
    }

    pub fn note_connection_torn_down(&self) {
        self.live_tasks.fetch_sub(2, Ordering::Relaxed);
    }

    /// Admission predicates, evaluated in the order §4.7 lists them; the
    /// first failure decides the rejection reason. All of these are
    /// capacity predicates, reported as 503 — only the per-IP/global
    /// connection-rate buckets in `admission::admit` report 429.
    pub fn check_admission(&self, current_connections: usize) -> Result<(), FanoutError> {
        if current_connections >= self.config.max_connections {
            return Err(FanoutError::ResourceExhausted);
        }
        if self.cpu_percent() > self.config.cpu_reject_threshold {
            return Err(FanoutError::ResourceExhausted);
        }
        if self.rss_bytes() > self.config.memory_limit_bytes {
            return Err(FanoutError::ResourceExhausted);
        }
        if self.live_tasks.load(Ordering::Relaxed) > self.config.max_tasks {
            return Err(FanoutError::ResourceExhausted);
        }
        Ok(())
    }

    /// The ingress CPU brake: `true` means the Ingress Consumer should drop
    /// the current record rather than hand it to the Broadcast Engine.
    pub fn should_pause_ingress(&self) -> bool {
        self.cpu_percent() > self.config.cpu_pause_threshold
    }

    fn publish_sample(&self, cpu_percent: f32, rss_bytes: u64, throttled_periods: u64) {
        self.cpu_percent_x100.store((cpu_percent * CPU_SCALE as f32) as i64, Ordering::Relaxed);
        self.rss_bytes.store(rss_bytes, Ordering::Relaxed);
        self.cgroup_throttled_periods.store(throttled_periods, Ordering::Relaxed);
    }
}

/// Spawn the periodic sampler task. Prefers cgroup v2 accounting (container
/// CPU/memory limits); falls back to host-wide `sysinfo` figures when the
/// cgroup files aren't present (e.g. running outside a container, or on a
/// non-Linux host).
pub fn spawn_sampler(guard: Arc<ResourceGuard>, config: &FanoutConfig, shutdown: CancellationToken) {
    let interval = config.sample_interval();
    tokio::spawn(async move {
        let pid = Pid::from_u32(std::process::id());
        let mut sys = System::new();
        let mut cgroup = CgroupCpuSampler::new();
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            let rss = sys.process(pid).map(|p| p.memory()).unwrap_or(0);

            let cpu_percent = match cgroup.sample() {
                Some(pct) => pct,
                None => {
                    sys.refresh_cpu_all();
                    sys.global_cpu_usage()
                }
            };

            guard.publish_sample(cpu_percent, rss, cgroup.throttled_periods());
        }
    });
}

/// Minimal cgroup v2 CPU accounting reader. Reads `cpu.stat`'s
/// `usage_usec` under `/sys/fs/cgroup` and derives a percentage from the
/// delta between consecutive samples. Returns `None` (falls back to host
/// CPU) whenever the file is absent, as on a non-Linux host or outside a
/// container.
struct CgroupCpuSampler {
    last_usage_usec: Option<u64>,
    last_sampled_at: std::time::Instant,
    last_throttled: AtomicU32,
}

impl CgroupCpuSampler {
    fn new() -> Self {
        Self {
            last_usage_usec: None,
            last_sampled_at: std::time::Instant::now(),
            last_throttled: AtomicU32::new(0),
        }
    }

    fn throttled_periods(&self) -> u64 {
        self.last_throttled.load(Ordering::Relaxed) as u64
    }

    fn sample(&mut self) -> Option<f32> {
        let contents = std::fs::read_to_string("/sys/fs/cgroup/cpu.stat").ok()?;
        let mut usage_usec = None;
        let mut nr_throttled = None;
        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("usage_usec"), Some(v)) => usage_usec = v.parse::<u64>().ok(),
                (Some("nr_throttled"), Some(v)) => nr_throttled = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        if let Some(v) = nr_throttled {
            self.last_throttled.store(v, Ordering::Relaxed);
        }

        let usage_usec = usage_usec?;
        let now = std::time::Instant::now();
        let percent = match self.last_usage_usec {
            Some(prev_usage) => {
                let elapsed_usec = now.duration_since(self.last_sampled_at).as_micros().max(1) as u64;
                let delta_usec = usage_usec.saturating_sub(prev_usage);
                Some((delta_usec as f64 / elapsed_usec as f64 * 100.0) as f32)
            }
            None => None,
        };
        self.last_usage_usec = Some(usage_usec);
        self.last_sampled_at = now;
        percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_with(max_connections: usize, cpu_reject: f32, memory_limit: u64, max_tasks: usize) -> ResourceGuard {
        ResourceGuard {
            cpu_percent_x100: AtomicI64::new(0),
            rss_bytes: AtomicU64::new(0),
            live_tasks: AtomicUsize::new(0),
            cgroup_throttled_periods: AtomicU64::new(0),
            config: ResourceLimits {
                max_connections,
                cpu_reject_threshold: cpu_reject,
                cpu_pause_threshold: cpu_reject + 5.0,
                memory_limit_bytes: memory_limit,
                max_tasks,
            },
            ingress_bucket: TokenBucket::with_double_burst(1000.0),
            broadcast_bucket: TokenBucket::with_double_burst(1000.0),
        }
    }

    #[test]
    fn admission_rejects_over_connection_cap() {
        let guard = guard_with(10, 75.0, u64::MAX, usize::MAX);
        assert!(guard.check_admission(10).is_err());
        assert!(guard.check_admission(9).is_ok());
    }

    #[test]
    fn admission_rejects_over_cpu_threshold() {
        let guard = guard_with(1000, 75.0, u64::MAX, usize::MAX);
        guard.publish_sample(80.0, 0, 0);
        assert!(guard.check_admission(0).is_err());
    }

    #[test]
    fn admission_rejects_over_memory_limit() {
        let guard = guard_with(1000, 75.0, 100, usize::MAX);
        guard.publish_sample(0.0, 200, 0);
        assert!(guard.check_admission(0).is_err());
    }

    #[test]
    fn pause_ingress_above_pause_threshold() {
        let guard = guard_with(1000, 75.0, u64::MAX, usize::MAX);
        guard.publish_sample(79.0, 0, 0);
        assert!(!guard.should_pause_ingress());
        guard.publish_sample(81.0, 0, 0);
        assert!(guard.should_pause_ingress());
    }
}
