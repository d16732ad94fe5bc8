//! Execution statistics.
//!
//! The executor feeds per-task outcomes into an [`ExecutionStatsCollector`]
//! while a graph runs; [`ExecutionStatsCollector::finish`] turns them into
//! [`ExecutionStats`] with the achieved speedup and efficiency.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::healing::FailureKind;

/// Metrics for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Task ID
    pub task_id: String,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Wall-clock duration of all attempts
    pub duration: Duration,
    /// Whether the task succeeded
    pub success: bool,
    /// Cost reported by the agent
    pub cost: f64,
    /// Classified kind of the final failure, if any
    pub failure_kind: Option<FailureKind>,
    /// Whether a healing strategy touched this task
    pub healed: bool,
}

impl TaskMetrics {
    fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            attempts: 0,
            duration: Duration::ZERO,
            success: false,
            cost: 0.0,
            failure_kind: None,
            healed: false,
        }
    }
}

/// Aggregated statistics for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_tasks: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Retries across all tasks
    pub total_retries: u32,
    /// Tasks a healing strategy touched
    pub healed_tasks: u32,
    /// Sum of individual task durations
    pub total_task_time: Duration,
    /// Actual wall-clock duration of the run
    pub wall_clock: Duration,
    /// `total_task_time / wall_clock`
    pub speedup: f64,
    /// `speedup / max_concurrency`
    pub efficiency: f64,
    /// Configured concurrency cap
    pub max_concurrency: usize,
    /// Highest concurrency observed
    pub peak_concurrency: usize,
    pub total_cost: f64,
    /// Final failure kinds by frequency
    pub failure_frequency: HashMap<FailureKind, u32>,
}

impl ExecutionStats {
    /// Fraction of tasks that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total_tasks as f64
    }

    /// Get the most common failure kind.
    pub fn most_common_failure(&self) -> Option<FailureKind> {
        self.failure_frequency
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, _)| *kind)
    }
}

/// Speedup of a parallel run over running the same work serially.
pub fn speedup(total_task_time: Duration, wall_clock: Duration) -> f64 {
    if wall_clock.is_zero() {
        return 0.0;
    }
    total_task_time.as_secs_f64() / wall_clock.as_secs_f64()
}

/// Speedup per unit of configured concurrency.
pub fn efficiency(speedup: f64, max_concurrency: usize) -> f64 {
    if max_concurrency == 0 {
        return 0.0;
    }
    speedup / max_concurrency as f64
}

#[derive(Debug)]
struct CollectorState {
    started: Instant,
    max_concurrency: usize,
    peak_concurrency: usize,
    tasks: HashMap<String, TaskMetrics>,
}

/// Thread-safe statistics collector.
#[derive(Debug, Clone)]
pub struct ExecutionStatsCollector {
    inner: Arc<Mutex<CollectorState>>,
}

impl ExecutionStatsCollector {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectorState {
                started: Instant::now(),
                max_concurrency,
                peak_concurrency: 0,
                tasks: HashMap::new(),
            })),
        }
    }

    /// Record the number of tasks running right now.
    pub fn observe_concurrency(&self, running: usize) {
        let mut state = self.lock();
        state.peak_concurrency = state.peak_concurrency.max(running);
    }

    /// Record completion of a task.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        attempts: u32,
        duration: Duration,
        cost: f64,
        failure_kind: Option<FailureKind>,
        healed: bool,
    ) {
        let mut state = self.lock();
        let entry = state
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskMetrics::new(task_id));
        entry.attempts = attempts;
        entry.duration = duration;
        entry.success = success;
        entry.cost = cost;
        entry.failure_kind = failure_kind;
        entry.healed = healed;
    }

    /// Metrics for one task, if it has completed.
    pub fn task(&self, task_id: &str) -> Option<TaskMetrics> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Build a statistics snapshot using the elapsed time since creation.
    pub fn finish(&self) -> ExecutionStats {
        let wall_clock = self.lock().started.elapsed();
        self.finish_with(wall_clock)
    }

    /// Build a statistics snapshot for a known wall-clock duration.
    pub fn finish_with(&self, wall_clock: Duration) -> ExecutionStats {
        let state = self.lock();

        let mut stats = ExecutionStats {
            wall_clock,
            max_concurrency: state.max_concurrency,
            peak_concurrency: state.peak_concurrency,
            ..ExecutionStats::default()
        };
        for task in state.tasks.values() {
            stats.total_tasks += 1;
            if task.success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            if task.healed {
                stats.healed_tasks += 1;
            }
            stats.total_retries += task.attempts.saturating_sub(1);
            stats.total_task_time += task.duration;
            stats.total_cost += task.cost;
            if let Some(kind) = task.failure_kind.filter(|_| !task.success) {
                *stats.failure_frequency.entry(kind).or_insert(0) += 1;
            }
        }
        stats.speedup = speedup(stats.total_task_time, wall_clock);
        stats.efficiency = efficiency(stats.speedup, stats.max_concurrency);
        stats
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Format statistics for display.
pub fn format_stats(stats: &ExecutionStats) -> String {
    let mut output = String::from("## Execution Statistics\n\n");

    output.push_str(&format!(
        "- **Tasks**: {} ({} succeeded, {} failed)\n",
        stats.total_tasks, stats.succeeded, stats.failed
    ));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        stats.success_rate() * 100.0
    ));
    output.push_str(&format!("- **Retries**: {}\n", stats.total_retries));
    output.push_str(&format!("- **Healed Tasks**: {}\n", stats.healed_tasks));
    output.push_str(&format!(
        "- **Speedup**: {:.2}x (efficiency {:.0}% at concurrency {}, peak {})\n",
        stats.speedup,
        stats.efficiency * 100.0,
        stats.max_concurrency,
        stats.peak_concurrency
    ));
    output.push_str(&format!(
        "- **Wall Clock**: {:.2}s for {:.2}s of task time\n",
        stats.wall_clock.as_secs_f64(),
        stats.total_task_time.as_secs_f64()
    ));
    output.push_str(&format!("- **Cost**: {:.2}\n", stats.total_cost));

    if !stats.failure_frequency.is_empty() {
        output.push_str("\n### Failure Kinds\n");
        let mut kinds: Vec<_> = stats.failure_frequency.iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (kind, count) in kinds {
            output.push_str(&format!("- **{}**: {}\n", kind.as_str(), count));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speedup_and_efficiency() {
        assert_eq!(speedup(Duration::from_secs(8), Duration::from_secs(2)), 4.0);
        assert_eq!(speedup(Duration::from_secs(8), Duration::ZERO), 0.0);
        assert_eq!(efficiency(4.0, 4), 1.0);
        assert_eq!(efficiency(3.0, 0), 0.0);
    }

    #[test]
    fn test_poisoned_collector_keeps_recorded_tasks() {
        let collector = ExecutionStatsCollector::new(2);
        collector.complete_task("a", true, 1, Duration::from_secs(1), 2.0, None, false);

        let inner = Arc::clone(&collector.inner);
        let poisoned = std::thread::spawn(move || {
            let _guard = inner.lock().expect("lock");
            panic!("recorder crashed");
        })
        .join();
        assert!(poisoned.is_err());
        assert!(collector.inner.is_poisoned());

        collector.complete_task("b", false, 2, Duration::from_secs(1), 0.0, Some(FailureKind::Timeout), false);
        let stats = collector.finish_with(Duration::from_secs(1));

        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.total_cost, 2.0);
        assert!(collector.task("b").is_some());
    }

    #[test]
    fn test_collector_aggregates_tasks() {
        let collector = ExecutionStatsCollector::new(2);
        collector.observe_concurrency(1);
        collector.observe_concurrency(2);
        collector.complete_task("a", true, 1, Duration::from_secs(2), 1.0, None, false);
        collector.complete_task("b", true, 3, Duration::from_secs(2), 0.5, None, true);
        collector.complete_task(
            "c",
            false,
            4,
            Duration::from_secs(1),
            0.0,
            Some(FailureKind::Timeout),
            false,
        );

        let stats = collector.finish_with(Duration::from_secs(2));

        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_retries, 5);
        assert_eq!(stats.healed_tasks, 1);
        assert_eq!(stats.peak_concurrency, 2);
        assert_eq!(stats.total_task_time, Duration::from_secs(5));
        assert_eq!(stats.speedup, 2.5);
        assert_eq!(stats.efficiency, 1.25);
        assert_eq!(stats.total_cost, 1.5);
        assert_eq!(stats.most_common_failure(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_success_rate_empty() {
        assert_eq!(ExecutionStats::default().success_rate(), 0.0);
        assert_eq!(ExecutionStats::default().most_common_failure(), None);
    }

    #[test]
    fn test_format_stats_lists_failures() {
        let collector = ExecutionStatsCollector::new(4);
        collector.complete_task(
            "a",
            false,
            1,
            Duration::from_millis(10),
            0.0,
            Some(FailureKind::RateLimit),
            false,
        );

        let output = format_stats(&collector.finish());

        assert!(output.contains("## Execution Statistics"));
        assert!(output.contains("rate_limit"));
        assert!(output.contains("0 succeeded, 1 failed"));
    }
}
