//! Caches batch evaluations against the run history.
//!
//! Configurations already answered by the history are served without touching
//! the decoratee; only the remainder is submitted. Fresh and cached results
//! are merged back into the original input order before the terminal
//! callback, and every observer notification is re-merged so the observer
//! always sees the full original batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::evaluator::{
    evaluate_sync_via_async, CompletionCallback, EvaluationResult, RunObserver,
    TargetAlgorithmEvaluator,
};
use crate::history::ReadOnlyRunHistory;
use crate::run::{KillHandler, RunConfiguration, RunResult};

/// Decorator answering already-known runs from a read-only history view.
pub struct HistoryCachingEvaluator {
    inner: Arc<dyn TargetAlgorithmEvaluator>,
    history: ReadOnlyRunHistory,
    requests: AtomicUsize,
    cache_hits: AtomicUsize,
}

/// Best-known state of one batch, keyed by position in the original input.
struct MergeState {
    configs: Vec<RunConfiguration>,
    current: Mutex<Vec<RunResult>>,
    /// position of each submitted config in `configs`
    submitted_indices: Vec<usize>,
}

impl MergeState {
    fn merge_submitted(&self, runs: &[RunResult]) -> Vec<RunResult> {
        let mut current = self.current.lock().expect("poisoned");
        for (j, run) in runs.iter().enumerate() {
            // the decoratee reports its sub-batch in submission order
            if let Some(&idx) = self.submitted_indices.get(j) {
                current[idx] = run.clone();
            }
        }
        current.clone()
    }
}

impl HistoryCachingEvaluator {
    pub fn new(inner: Arc<dyn TargetAlgorithmEvaluator>, history: ReadOnlyRunHistory) -> Self {
        HistoryCachingEvaluator {
            inner,
            history,
            requests: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        }
    }
}

struct MergingObserver {
    state: Arc<MergeState>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl RunObserver for MergingObserver {
    fn current_status(&self, runs: &[RunResult]) {
        let merged = self.state.merge_submitted(runs);
        if let Some(observer) = &self.observer {
            observer.current_status(&merged);
        }
    }
}

impl TargetAlgorithmEvaluator for HistoryCachingEvaluator {
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
        let mut to_submit: Vec<RunConfiguration> = Vec::new();
        let mut submitted_indices: Vec<usize> = Vec::new();
        let mut current: Vec<RunResult> = Vec::with_capacity(configs.len());
        // serve duplicates within one batch from the first submission
        let mut seen_in_batch: HashMap<RunConfiguration, usize> = HashMap::new();

        for (idx, rc) in configs.iter().enumerate() {
            if let Some(cached) = self.history.result_for(rc) {
                trace!(config = %rc, "cache hit");
                current.push(cached);
                continue;
            }
            current.push(RunResult::running(
                rc.clone(),
                0.0,
                Arc::new(KillHandler::new()),
            ));
            if seen_in_batch.insert(rc.clone(), idx).is_none() {
                to_submit.push(rc.clone());
                submitted_indices.push(idx);
            }
        }

        self.requests.fetch_add(configs.len(), Ordering::Relaxed);
        self.cache_hits
            .fetch_add(configs.len() - to_submit.len(), Ordering::Relaxed);
        debug!(
            "submitting {} of {} requested runs",
            to_submit.len(),
            configs.len()
        );

        let state = Arc::new(MergeState {
            configs,
            current: Mutex::new(current),
            submitted_indices,
        });

        let merging_observer: Arc<dyn RunObserver> = Arc::new(MergingObserver {
            state: Arc::clone(&state),
            observer: observer.clone(),
        });

        let callback_state = Arc::clone(&state);
        let merged_callback: CompletionCallback = Box::new(move |result| match result {
            Ok(runs) => {
                let mut merged = callback_state.merge_submitted(&runs);
                // fill batch-internal duplicates from their first occurrence
                let by_config: HashMap<RunConfiguration, RunResult> = merged
                    .iter()
                    .filter(|r| r.is_completed())
                    .map(|r| (r.config().clone(), r.clone()))
                    .collect();
                for (idx, rc) in callback_state.configs.iter().enumerate() {
                    if !merged[idx].is_completed() {
                        if let Some(done) = by_config.get(rc) {
                            merged[idx] = done.clone();
                        }
                    }
                }
                // final full view strictly before the terminal callback
                if let Some(observer) = &observer {
                    observer.current_status(&merged);
                }
                callback(Ok(merged));
            }
            Err(e) => callback(Err(e)),
        });

        self.inner
            .evaluate_runs_async(to_submit, merged_callback, Some(merging_observer));
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
        let requests = self.requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        if requests > 0 {
            debug!(
                "cache served {hits} of {requests} requests ({:.1}%)",
                100.0 * hits as f64 / requests as f64
            );
        }
    }
}
