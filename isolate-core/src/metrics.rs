//! Platform metrics
//!
//! Lightweight counters shared by every isolate on a [`Platform`](crate::Platform).
//!
//! # Design Goals:
//! - Relaxed atomic counters, no locks on the hot path
//! - One snapshot type for reports and tests
//! - Zero allocation when recording

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for scheduling, memory governance and lifecycle events
#[derive(Debug, Default)]
pub struct PlatformMetrics {
    // Scheduling
    pub episodes_dispatched: AtomicU64,
    pub episodes_completed: AtomicU64,
    pub episode_time_ns: AtomicU64,
    pub tasks_run: AtomicU64,
    pub handle_tasks_run: AtomicU64,
    pub interrupts_run: AtomicU64,
    pub work_discarded: AtomicU64,

    // Memory governance
    pub pressure_notifications: AtomicU64,
    pub heap_limit_grants: AtomicU64,
    pub memory_limit_hits: AtomicU64,

    // Lifecycle
    pub isolates_created: AtomicU64,
    pub isolates_disposed: AtomicU64,
    pub terminations: AtomicU64,
}

impl PlatformMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_episode_dispatched(&self) {
        self.episodes_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished execution episode
    pub fn record_episode(&self, duration: Duration) {
        self.episodes_completed.fetch_add(1, Ordering::Relaxed);
        self.episode_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_tasks(&self, count: usize) {
        self.tasks_run.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_handle_tasks(&self, count: usize) {
        self.handle_tasks_run.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_interrupts(&self, count: usize) {
        self.interrupts_run.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record queued work dropped without running
    pub fn record_discarded(&self, count: usize) {
        self.work_discarded.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_pressure_notification(&self) {
        self.pressure_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heap_limit_grant(&self) {
        self.heap_limit_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_limit_hit(&self) {
        self.memory_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_isolate_created(&self) {
        self.isolates_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_isolate_disposed(&self) {
        self.isolates_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_termination(&self) {
        self.terminations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let episodes_completed = self.episodes_completed.load(Ordering::Relaxed);
        let episode_time_ns = self.episode_time_ns.load(Ordering::Relaxed);
        let avg_episode_ms = if episodes_completed == 0 {
            0.0
        } else {
            episode_time_ns as f64 / episodes_completed as f64 / 1_000_000.0
        };

        MetricsSnapshot {
            episodes_dispatched: self.episodes_dispatched.load(Ordering::Relaxed),
            episodes_completed,
            avg_episode_ms,
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            handle_tasks_run: self.handle_tasks_run.load(Ordering::Relaxed),
            interrupts_run: self.interrupts_run.load(Ordering::Relaxed),
            work_discarded: self.work_discarded.load(Ordering::Relaxed),
            pressure_notifications: self.pressure_notifications.load(Ordering::Relaxed),
            heap_limit_grants: self.heap_limit_grants.load(Ordering::Relaxed),
            memory_limit_hits: self.memory_limit_hits.load(Ordering::Relaxed),
            isolates_created: self.isolates_created.load(Ordering::Relaxed),
            isolates_disposed: self.isolates_disposed.load(Ordering::Relaxed),
            terminations: self.terminations.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.episodes_dispatched,
            &self.episodes_completed,
            &self.episode_time_ns,
            &self.tasks_run,
            &self.handle_tasks_run,
            &self.interrupts_run,
            &self.work_discarded,
            &self.pressure_notifications,
            &self.heap_limit_grants,
            &self.memory_limit_hits,
            &self.isolates_created,
            &self.isolates_disposed,
            &self.terminations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of platform metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub episodes_dispatched: u64,
    pub episodes_completed: u64,
    pub avg_episode_ms: f64,
    pub tasks_run: u64,
    pub handle_tasks_run: u64,
    pub interrupts_run: u64,
    pub work_discarded: u64,
    pub pressure_notifications: u64,
    pub heap_limit_grants: u64,
    pub memory_limit_hits: u64,
    pub isolates_created: u64,
    pub isolates_disposed: u64,
    pub terminations: u64,
}

impl MetricsSnapshot {
    /// Print a human-readable report
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║         Isolate Platform Metrics Report                   ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Scheduling                                                ║");
        println!("║   Episodes:    {:>8} of {:>8} (avg: {:>8.3} ms)     ║",
                 self.episodes_completed, self.episodes_dispatched, self.avg_episode_ms);
        println!("║   Tasks:       {:>8}                                   ║", self.tasks_run);
        println!("║   Handle:      {:>8}                                   ║", self.handle_tasks_run);
        println!("║   Interrupts:  {:>8}                                   ║", self.interrupts_run);
        println!("║   Discarded:   {:>8}                                   ║", self.work_discarded);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Memory Governance                                         ║");
        println!("║   Pressure:    {:>8}                                   ║", self.pressure_notifications);
        println!("║   Grants:      {:>8}                                   ║", self.heap_limit_grants);
        println!("║   Limit hits:  {:>8}                                   ║", self.memory_limit_hits);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Lifecycle                                                 ║");
        println!("║   Created:     {:>8}                                   ║", self.isolates_created);
        println!("║   Disposed:    {:>8}                                   ║", self.isolates_disposed);
        println!("║   Terminated:  {:>8}                                   ║", self.terminations);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// Records an episode's duration on drop
pub struct EpisodeTimer<'a> {
    start: Instant,
    metrics: &'a PlatformMetrics,
}

impl<'a> EpisodeTimer<'a> {
    pub fn new(metrics: &'a PlatformMetrics) -> Self {
        Self {
            start: Instant::now(),
            metrics,
        }
    }
}

impl Drop for EpisodeTimer<'_> {
    fn drop(&mut self) {
        self.metrics.record_episode(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = PlatformMetrics::new().snapshot();
        assert_eq!(snapshot, MetricsSnapshot::default());
    }

    #[test]
    fn test_record_episodes() {
        let metrics = PlatformMetrics::new();
        metrics.record_episode(Duration::from_millis(100));
        metrics.record_episode(Duration::from_millis(200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.episodes_completed, 2);
        assert_eq!(snapshot.avg_episode_ms, 150.0);
    }

    #[test]
    fn test_counts_and_reset() {
        let metrics = PlatformMetrics::new();
        metrics.record_tasks(3);
        metrics.record_discarded(2);
        metrics.record_memory_limit_hit();
        metrics.record_termination();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_run, 3);
        assert_eq!(snapshot.work_discarded, 2);
        assert_eq!(snapshot.memory_limit_hits, 1);
        assert_eq!(snapshot.terminations, 1);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_episode_timer() {
        let metrics = PlatformMetrics::new();
        {
            let _timer = EpisodeTimer::new(&metrics);
            std::thread::sleep(Duration::from_millis(10));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.episodes_completed, 1);
        assert!(snapshot.avg_episode_ms >= 10.0);
    }
}
