//! Enforces the timing invariants on raw transport output.
//!
//! A wrapper that reports `runtime >= cutoff` under any non-timeout status is
//! corrected to `TIMEOUT` with the runtime clamped to the requested cutoff.
//! The decorator also keeps the session-wide overhead accounting and warns
//! (with escalating thresholds, to stay quiet) when runs blow noticeably past
//! their cutoffs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::evaluator::{
    CompletionCallback, EvaluationResult, RunObserver, TargetAlgorithmEvaluator,
};
use crate::run::{RunConfiguration, RunResult, RunStatus};

#[derive(Debug)]
struct TimingStats {
    total_runtime: f64,
    total_walltime: f64,
    total_runtime_overhead: f64,
    total_wallclock_overhead: f64,
    total_wall_vs_runtime: f64,
    runtime_delta_to_log: f64,
    wallclock_delta_to_log: f64,
}

impl Default for TimingStats {
    fn default() -> Self {
        TimingStats {
            total_runtime: 0.0,
            total_walltime: 0.0,
            total_runtime_overhead: 0.0,
            total_wallclock_overhead: 0.0,
            total_wall_vs_runtime: 0.0,
            runtime_delta_to_log: 1.0,
            wallclock_delta_to_log: 10.0,
        }
    }
}

struct TimingShared {
    stats: Mutex<TimingStats>,
    slow_run_warned: Mutex<HashSet<RunConfiguration>>,
}

impl TimingShared {
    fn process_run(&self, run: RunResult) -> RunResult {
        if !run.is_completed() {
            return run;
        }

        let cutoff = run.config().cutoff_time();
        {
            let mut stats = self.stats.lock().expect("poisoned");
            let runtime_overhead = run.runtime() - cutoff;
            stats.total_runtime += run.runtime().max(0.0);
            stats.total_runtime_overhead += runtime_overhead.max(0.0);
            if runtime_overhead > stats.runtime_delta_to_log {
                stats.runtime_delta_to_log = runtime_overhead + 1.0;
                warn!(
                    "run reported a runtime of {}s exceeding its cutoff of {cutoff}s by {runtime_overhead}s, next warning at {}s",
                    run.runtime(),
                    stats.runtime_delta_to_log
                );
            }

            let wallclock_overhead = run.wallclock_time() - cutoff;
            stats.total_walltime += run.wallclock_time().max(0.0);
            stats.total_wallclock_overhead += wallclock_overhead.max(0.0);
            if wallclock_overhead > stats.wallclock_delta_to_log {
                stats.wallclock_delta_to_log = wallclock_overhead + 1.0;
                warn!(
                    "run took {}s of wall-clock time against a cutoff of {cutoff}s, next warning at {}s",
                    run.wallclock_time(),
                    stats.wallclock_delta_to_log
                );
            }

            stats.total_wall_vs_runtime += (run.wallclock_time() - run.runtime()).max(0.0);
        }

        let needs_correction = (run.runtime() >= cutoff && run.status() != RunStatus::Timeout)
            || (run.status() == RunStatus::Timeout && run.runtime() > cutoff);
        if needs_correction {
            corrected_to_timeout(&run)
        } else {
            run
        }
    }

    fn process_all(&self, runs: Vec<RunResult>) -> Vec<RunResult> {
        runs.into_iter().map(|r| self.process_run(r)).collect()
    }
}

fn corrected_to_timeout(run: &RunResult) -> RunResult {
    RunResult::new(
        run.config().clone(),
        RunStatus::Timeout,
        run.config().cutoff_time(),
        run.run_length(),
        run.quality(),
        run.result_seed(),
        run.additional_data(),
        run.wallclock_time(),
    )
}

/// Decorator correcting results so that `runtime >= cutoff` implies
/// `TIMEOUT` with `runtime == cutoff`, for every cutoff `>= 0`.
pub struct TimingInvariantEvaluator {
    inner: Arc<dyn TargetAlgorithmEvaluator>,
    shared: Arc<TimingShared>,
}

impl TimingInvariantEvaluator {
    pub fn new(inner: Arc<dyn TargetAlgorithmEvaluator>) -> Self {
        TimingInvariantEvaluator {
            inner,
            shared: Arc::new(TimingShared {
                stats: Mutex::new(TimingStats::default()),
                slow_run_warned: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn wrap_observer(&self, observer: Option<Arc<dyn RunObserver>>) -> Arc<dyn RunObserver> {
        Arc::new(SlowRunObserver {
            observer,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Warns once per run configuration when an outstanding run has been running
/// far past its cutoff (the transport is supposed to enforce cutoffs, so this
/// points at a stuck wrapper).
struct SlowRunObserver {
    observer: Option<Arc<dyn RunObserver>>,
    shared: Arc<TimingShared>,
}

impl RunObserver for SlowRunObserver {
    fn current_status(&self, runs: &[RunResult]) {
        if let Some(observer) = &self.observer {
            observer.current_status(runs);
        }
        for run in runs {
            if run.is_completed() {
                continue;
            }
            let waited = run.wallclock_time();
            if waited > 3.0 * run.config().cutoff_time() && waited > 180.0 {
                let mut warned = self.shared.slow_run_warned.lock().expect("poisoned");
                if warned.insert(run.config().clone()) {
                    warn!(
                        "waited {waited}s for a run that should have taken at most {}s: {}",
                        run.config().cutoff_time(),
                        run.config()
                    );
                }
            }
        }
    }
}

impl TargetAlgorithmEvaluator for TimingInvariantEvaluator {
    fn evaluate_runs(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        let observer = self.wrap_observer(observer);
        self.inner
            .evaluate_runs(configs, Some(observer))
            .map(|runs| self.shared.process_all(runs))
    }

    fn evaluate_runs_async(
        &self,
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
    ) {
        let observer = self.wrap_observer(observer);
        let shared = Arc::clone(&self.shared);
        self.inner.evaluate_runs_async(
            configs,
            Box::new(move |result| callback(result.map(|runs| shared.process_all(runs)))),
            Some(observer),
        );
    }

    fn is_run_final(&self) -> bool {
        self.inner.is_run_final()
    }

    fn are_runs_persisted(&self) -> bool {
        self.inner.are_runs_persisted()
    }

    fn are_runs_observable(&self) -> bool {
        self.inner.are_runs_observable()
    }

    fn notify_shutdown(&self) {
        self.inner.notify_shutdown();
        let stats = self.shared.stats.lock().expect("poisoned");
        debug!(
            "total reported runtime {}s (overhead {}s), total wall-clock {}s (overhead {}s), wall-clock minus runtime {}s",
            stats.total_runtime,
            stats.total_runtime_overhead,
            stats.total_walltime,
            stats.total_wallclock_overhead,
            stats.total_wall_vs_runtime
        );
    }
}

#[cfg(test)]
mod timing_tests {
    use super::*;
    use crate::inprocess::InProcessEvaluator;
    use crate::run::{
        ExecutionContext, InstanceSeedPair, ParameterConfiguration, ParameterSpace,
        ProblemInstance,
    };
    use std::collections::BTreeMap;

    fn config_with_cutoff(cutoff: f64) -> RunConfiguration {
        let space = Arc::new(ParameterSpace::new("s"));
        let ctx = Arc::new(ExecutionContext::new(Arc::clone(&space), 100.0));
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new("i1")), 1);
        let pc = ParameterConfiguration::new(space, BTreeMap::new());
        RunConfiguration::new(pisp, cutoff, pc, ctx).unwrap()
    }

    fn evaluator_reporting(runtime: f64, status: RunStatus) -> TimingInvariantEvaluator {
        let base = InProcessEvaluator::new(move |config: &RunConfiguration| {
            RunResult::new(
                config.clone(),
                status,
                runtime,
                0.0,
                0.0,
                1,
                "",
                runtime,
            )
        });
        TimingInvariantEvaluator::new(Arc::new(base))
    }

    #[test]
    fn overlong_sat_becomes_timeout_at_cutoff() {
        let tae = evaluator_reporting(12.0, RunStatus::Sat);
        let runs = tae
            .evaluate_runs(vec![config_with_cutoff(10.0)], None)
            .unwrap();
        assert_eq!(runs[0].status(), RunStatus::Timeout);
        assert_eq!(runs[0].runtime(), 10.0);
    }

    #[test]
    fn runtime_exactly_at_cutoff_is_a_timeout() {
        let tae = evaluator_reporting(10.0, RunStatus::Sat);
        let runs = tae
            .evaluate_runs(vec![config_with_cutoff(10.0)], None)
            .unwrap();
        assert_eq!(runs[0].status(), RunStatus::Timeout);
        assert_eq!(runs[0].runtime(), 10.0);
    }

    #[test]
    fn zero_cutoff_is_supported() {
        let tae = evaluator_reporting(0.0, RunStatus::Sat);
        let runs = tae
            .evaluate_runs(vec![config_with_cutoff(0.0)], None)
            .unwrap();
        assert_eq!(runs[0].status(), RunStatus::Timeout);
        assert_eq!(runs[0].runtime(), 0.0);
    }

    #[test]
    fn timeout_runtime_clamped() {
        let tae = evaluator_reporting(13.5, RunStatus::Timeout);
        let runs = tae
            .evaluate_runs(vec![config_with_cutoff(10.0)], None)
            .unwrap();
        assert_eq!(runs[0].status(), RunStatus::Timeout);
        assert_eq!(runs[0].runtime(), 10.0);
    }

    #[test]
    fn well_behaved_runs_pass_through() {
        let tae = evaluator_reporting(3.0, RunStatus::Sat);
        let runs = tae
            .evaluate_runs(vec![config_with_cutoff(10.0)], None)
            .unwrap();
        assert_eq!(runs[0].status(), RunStatus::Sat);
        assert_eq!(runs[0].runtime(), 3.0);
    }
}
