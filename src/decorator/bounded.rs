//! Bounds how many runs are outstanding at once across everything behind it.
//!
//! A batch is handed to the decoratee in permit-sized slices: the dispatcher
//! asks the fair multi-permit semaphore for "up to everything still pending",
//! dispatches whatever it was granted and repeats. Permits flow back as
//! individual runs complete (not at batch end), so adaptive capping gets its
//! slots back early. Runs killed before their slice is dispatched are
//! completed as `KILLED` without ever consuming a permit, and caller kill
//! requests are forwarded to the decoratee's outstanding runs.
//!
//! Dispatching itself applies backpressure: `evaluate_runs_async` blocks the
//! submitting thread until the whole batch has been handed over. Submissions
//! from different threads are serialized, so one batch's slices are never
//! interleaved with another's.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::evaluator::{
    evaluate_sync_via_async, CompletionCallback, EvaluationResult, EvaluatorError, RunObserver,
    TargetAlgorithmEvaluator,
};
use crate::run::{KillHandler, RunConfiguration, RunResult, RunStatus};
use crate::semaphore::FairMultiPermitSemaphore;

const KILLED_BEFORE_DISPATCH: &str = "kill intercepted by decorator before dispatch";

/// Decorator keeping at most `concurrent_runs` runs in flight.
pub struct BoundedEvaluator {
    inner: Arc<dyn TargetAlgorithmEvaluator>,
    permits: Arc<FairMultiPermitSemaphore>,
    enqueue_lock: Mutex<()>,
    bound: usize,
}

struct SnapshotState {
    runs: Vec<RunResult>,
    version: u64,
}

struct TerminalState {
    callback: Option<CompletionCallback>,
    outstanding_sublists: usize,
    dispatch_done: bool,
    failed: bool,
}

struct NotifyState {
    last_version: u64,
    terminal_fired: bool,
}

struct BatchState {
    configs: Vec<RunConfiguration>,
    kill_flags: Vec<Arc<KillHandler>>,
    snapshot: Mutex<SnapshotState>,
    /// whether the permit of a dispatched index has been returned
    released: Mutex<Vec<bool>>,
    terminal: Mutex<TerminalState>,
    notify: Mutex<NotifyState>,
    permits: Arc<FairMultiPermitSemaphore>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl BatchState {
    fn new(
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
        permits: Arc<FairMultiPermitSemaphore>,
    ) -> Arc<Self> {
        let kill_flags: Vec<Arc<KillHandler>> = configs
            .iter()
            .map(|_| Arc::new(KillHandler::new()))
            .collect();
        let placeholders: Vec<RunResult> = configs
            .iter()
            .zip(&kill_flags)
            .map(|(rc, kill)| RunResult::running(rc.clone(), 0.0, Arc::clone(kill)))
            .collect();
        let released = vec![false; configs.len()];
        Arc::new(BatchState {
            configs,
            kill_flags,
            snapshot: Mutex::new(SnapshotState {
                runs: placeholders,
                version: 0,
            }),
            released: Mutex::new(released),
            terminal: Mutex::new(TerminalState {
                callback: Some(callback),
                outstanding_sublists: 0,
                dispatch_done: false,
                failed: false,
            }),
            notify: Mutex::new(NotifyState {
                last_version: 0,
                terminal_fired: false,
            }),
            permits,
            observer,
        })
    }

    fn record_results(&self, indices: &[usize], results: &[RunResult]) {
        let mut snapshot = self.snapshot.lock().expect("poisoned");
        for (j, &idx) in indices.iter().enumerate() {
            if let Some(run) = results.get(j) {
                snapshot.runs[idx] = run.clone();
            }
        }
    }

    /// Returns the permits of every newly-completed run of this slice.
    fn release_completed(&self, indices: &[usize], results: &[RunResult]) {
        let mut released = self.released.lock().expect("poisoned");
        let mut count = 0;
        for (j, &idx) in indices.iter().enumerate() {
            if results.get(j).is_some_and(RunResult::is_completed) && !released[idx] {
                released[idx] = true;
                count += 1;
            }
        }
        drop(released);
        self.permits.release(count);
    }

    /// Returns every not-yet-released permit of this slice, completion or
    /// not. Used on the failure path so permits survive errors.
    fn release_all(&self, indices: &[usize]) {
        let mut released = self.released.lock().expect("poisoned");
        let mut count = 0;
        for &idx in indices {
            if !released[idx] {
                released[idx] = true;
                count += 1;
            }
        }
        drop(released);
        self.permits.release(count);
    }

    fn forward_kills(&self, indices: &[usize], results: &[RunResult]) {
        for (j, &idx) in indices.iter().enumerate() {
            if self.kill_flags[idx].is_killed() {
                if let Some(run) = results.get(j) {
                    if !run.is_completed() {
                        run.kill();
                    }
                }
            }
        }
    }

    /// Completes an index as KILLED without it ever reaching the decoratee.
    fn complete_killed(&self, idx: usize) {
        let config = &self.configs[idx];
        trace!(%config, "run was killed before dispatch");
        let killed = RunResult::new(
            config.clone(),
            RunStatus::Killed,
            0.0,
            0.0,
            0.0,
            config.instance_seed_pair().seed(),
            KILLED_BEFORE_DISPATCH,
            0.0,
        );
        let mut snapshot = self.snapshot.lock().expect("poisoned");
        snapshot.runs[idx] = killed;
        // intercepted runs never held a permit
        self.released.lock().expect("poisoned")[idx] = true;
    }

    fn notify_observer(&self) {
        let Some(observer) = &self.observer else {
            return;
        };
        let (runs, version) = {
            let mut snapshot = self.snapshot.lock().expect("poisoned");
            snapshot.version += 1;
            (snapshot.runs.clone(), snapshot.version)
        };
        let mut notify = self.notify.lock().expect("poisoned");
        if notify.terminal_fired || notify.last_version >= version {
            // a newer snapshot already went out, this one is stale
            return;
        }
        notify.last_version = version;
        observer.current_status(&runs);
    }

    fn sublist_started(&self) {
        self.terminal.lock().expect("poisoned").outstanding_sublists += 1;
    }

    fn try_fire_success(&self) {
        let callback = {
            let mut terminal = self.terminal.lock().expect("poisoned");
            if terminal.failed
                || !terminal.dispatch_done
                || terminal.outstanding_sublists > 0
                || terminal.callback.is_none()
            {
                return;
            }
            terminal.callback.take().expect("just checked")
        };
        let runs = self.snapshot.lock().expect("poisoned").runs.clone();
        debug_assert!(runs.iter().all(RunResult::is_completed));
        self.notify.lock().expect("poisoned").terminal_fired = true;
        callback(Ok(runs));
    }

    fn fire_failure(&self, error: EvaluatorError) {
        let callback = {
            let mut terminal = self.terminal.lock().expect("poisoned");
            terminal.failed = true;
            match terminal.callback.take() {
                Some(callback) => callback,
                None => {
                    debug!("failure after the terminal callback fired, discarding: {error}");
                    return;
                }
            }
        };
        self.notify.lock().expect("poisoned").terminal_fired = true;
        callback(Err(error));
    }

    fn has_failed(&self) -> bool {
        self.terminal.lock().expect("poisoned").failed
    }
}

struct SublistObserver {
    state: Arc<BatchState>,
    indices: Vec<usize>,
}

impl RunObserver for SublistObserver {
    fn current_status(&self, runs: &[RunResult]) {
        self.state.record_results(&self.indices, runs);
        self.state.forward_kills(&self.indices, runs);
        self.state.notify_observer();
        // permits come back as soon as individual runs complete; this happens
        // after the caller observer ran, so kill requests made there are
        // visible before the dispatcher can grab the freed permit
        self.state.release_completed(&self.indices, runs);
    }
}

impl BoundedEvaluator {
    /// # Panics
    /// When `concurrent_runs` is zero: nothing could ever be scheduled.
    pub fn new(inner: Arc<dyn TargetAlgorithmEvaluator>, concurrent_runs: usize) -> Self {
        assert!(
            concurrent_runs > 0,
            "must be able to schedule at least one run"
        );
        BoundedEvaluator {
            inner,
            permits: Arc::new(FairMultiPermitSemaphore::new(concurrent_runs)),
            enqueue_lock: Mutex::new(()),
            bound: concurrent_runs,
        }
    }

    /// Permits currently free; mostly useful in tests and diagnostics.
    pub fn available_permits(&self) -> usize {
        self.permits.available()
    }
}

impl TargetAlgorithmEvaluator for BoundedEvaluator {
    fn evaluate_runs(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        evaluate_sync_via_async(self, configs, observer)
    }

    fn evaluate_runs_async(
        &self,
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
    ) {
        if configs.is_empty() {
            callback(Ok(vec![]));
            return;
        }

        let total = configs.len();
        let state = BatchState::new(configs, callback, observer, Arc::clone(&self.permits));

        {
            let _guard = self.enqueue_lock.lock().expect("poisoned");
            let mut next_index = 0;
            while next_index < total && !state.has_failed() {
                let want = total - next_index;
                trace!("asking for up to {want} permits");
                let granted = self.permits.acquire_up_to(want);
                assert!(
                    granted <= self.bound,
                    "granted {granted} permits with a bound of {}",
                    self.bound
                );

                // pick `granted` live runs; killed ones complete right here
                let mut indices = Vec::with_capacity(granted);
                let mut intercepted = 0;
                while indices.len() < granted && next_index < total {
                    let idx = next_index;
                    next_index += 1;
                    if state.kill_flags[idx].is_killed() {
                        state.complete_killed(idx);
                        intercepted += 1;
                    } else {
                        indices.push(idx);
                    }
                }
                if intercepted > 0 {
                    state.notify_observer();
                }

                let unused = granted - indices.len();
                if unused > 0 {
                    self.permits.release(unused);
                }
                if indices.is_empty() {
                    continue;
                }

                let sub_configs: Vec<RunConfiguration> = indices
                    .iter()
                    .map(|&idx| state.configs[idx].clone())
                    .collect();

                state.sublist_started();
                let callback_state = Arc::clone(&state);
                let callback_indices = indices.clone();
                let sublist_callback: CompletionCallback = Box::new(move |result| {
                    match result {
                        Ok(results) => {
                            callback_state.record_results(&callback_indices, &results);
                            callback_state.release_completed(&callback_indices, &results);
                            callback_state
                                .terminal
                                .lock()
                                .expect("poisoned")
                                .outstanding_sublists -= 1;
                            callback_state.try_fire_success();
                        }
                        Err(e) => {
                            // exception safety: permits outlive the failure
                            callback_state.release_all(&callback_indices);
                            callback_state
                                .terminal
                                .lock()
                                .expect("poisoned")
                                .outstanding_sublists -= 1;
                            callback_state.fire_failure(e);
                        }
                    }
                });
                let sublist_observer: Arc<dyn RunObserver> = Arc::new(SublistObserver {
                    state: Arc::clone(&state),
                    indices,
                });

                self.inner
                    .evaluate_runs_async(sub_configs, sublist_callback, Some(sublist_observer));
            }
            state.terminal.lock().expect("poisoned").dispatch_done = true;
        }
        // outside the enqueue lock: the terminal callback may submit again
        state.try_fire_success();
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
    }
}

#[cfg(test)]
mod bounded_tests {
    use super::*;
    use crate::inprocess::InProcessEvaluator;
    use crate::run::{
        ExecutionContext, InstanceSeedPair, ParameterConfiguration, ParameterSpace,
        ProblemInstance,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn configs(n: usize) -> Vec<RunConfiguration> {
        let space = Arc::new(ParameterSpace::new("s"));
        let ctx = Arc::new(ExecutionContext::new(Arc::clone(&space), 100.0));
        (0..n)
            .map(|i| {
                let pisp =
                    InstanceSeedPair::new(Arc::new(ProblemInstance::new(format!("i{i}"))), i as i64);
                let pc = ParameterConfiguration::new(Arc::clone(&space), BTreeMap::new());
                RunConfiguration::new(pisp, 10.0, pc, Arc::clone(&ctx)).unwrap()
            })
            .collect()
    }

    fn sat(config: &RunConfiguration) -> RunResult {
        RunResult::new(
            config.clone(),
            RunStatus::Sat,
            1.0,
            0.0,
            0.0,
            config.instance_seed_pair().seed(),
            "",
            1.0,
        )
    }

    #[test]
    fn never_more_than_bound_in_flight() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let flight = Arc::clone(&in_flight);
        let seen = Arc::clone(&max_seen);
        let base = Arc::new(InProcessEvaluator::new(move |config: &RunConfiguration| {
            let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
            seen.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            flight.fetch_sub(1, Ordering::SeqCst);
            sat(config)
        }));
        let tae = Arc::new(BoundedEvaluator::new(base, 2));

        // several batches from several threads
        let mut handles = vec![];
        for _ in 0..3 {
            let tae = Arc::clone(&tae);
            handles.push(thread::spawn(move || {
                tae.evaluate_runs(configs(6), None).unwrap()
            }));
        }
        for handle in handles {
            let results = handle.join().unwrap();
            assert_eq!(results.len(), 6);
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(tae.available_permits(), 2);
    }

    #[test]
    fn order_preserved_across_slices() {
        let base = Arc::new(InProcessEvaluator::new(|config: &RunConfiguration| {
            // later runs finish faster, stressing the reordering logic
            let seed = config.instance_seed_pair().seed() as u64;
            thread::sleep(Duration::from_millis(20u64.saturating_sub(2 * seed)));
            sat(config)
        }));
        let tae = BoundedEvaluator::new(base, 3);

        let configs = configs(9);
        let results = tae.evaluate_runs(configs.clone(), None).unwrap();
        assert_eq!(results.len(), configs.len());
        for (config, result) in configs.iter().zip(&results) {
            assert_eq!(result.config(), config);
            assert!(result.is_completed());
        }
    }

    #[test]
    fn failure_releases_permits_and_fires_once() {
        let base = Arc::new(InProcessEvaluator::new(|config: &RunConfiguration| {
            RunResult::new(
                config.clone(),
                RunStatus::Abort,
                0.0,
                0.0,
                0.0,
                0,
                "",
                0.0,
            )
        }));
        let tae = BoundedEvaluator::new(base, 2);

        match tae.evaluate_runs(configs(5), None) {
            Err(EvaluatorError::AlgorithmAbort(_)) => {}
            other => panic!("expected AlgorithmAbort, got {other:?}"),
        }
        // even with the batch aborted, every permit must be back
        for _ in 0..50 {
            if tae.available_permits() == 2 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("permits leaked: {} available", tae.available_permits());
    }

    #[test]
    fn kill_before_dispatch_skips_the_decoratee() {
        struct Killer;
        impl RunObserver for Killer {
            fn current_status(&self, runs: &[RunResult]) {
                // kill everything still outstanding as soon as we see it
                for run in runs {
                    if !run.is_completed() {
                        run.kill();
                    }
                }
            }
        }

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);
        let base = Arc::new(InProcessEvaluator::new(move |config: &RunConfiguration| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            sat(config)
        }));
        let tae = BoundedEvaluator::new(base, 1);

        let results = tae
            .evaluate_runs(configs(6), Some(Arc::new(Killer)))
            .unwrap();

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(RunResult::is_completed));
        let killed = results
            .iter()
            .filter(|r| r.status() == RunStatus::Killed)
            .count();
        // with one permit, at least the tail of the batch is intercepted
        assert!(killed >= 1, "expected kills, statuses: {results:?}");
        assert!(executed.load(Ordering::SeqCst) < 6);
        assert_eq!(tae.available_permits(), 1);
    }
}
