//! In-process transport: the target algorithm is a Rust value living in this
//! process instead of a program behind a socket.
//!
//! This is the workhorse for tests and for embedding cheap synthetic targets,
//! and it is the only transport that can honour kill requests between runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::evaluator::{
    CompletionCallback, EvaluationResult, EvaluatorError, RunObserver, TargetAlgorithmEvaluator,
};
use crate::run::{KillHandler, RunConfiguration, RunResult, RunStatus};

/// Something that can execute one run configuration to completion.
///
/// Implemented for plain closures.
pub trait TargetAlgorithm: Send + Sync + 'static {
    fn run(&self, config: &RunConfiguration) -> RunResult;
}

impl<F> TargetAlgorithm for F
where
    F: Fn(&RunConfiguration) -> RunResult + Send + Sync + 'static,
{
    fn run(&self, config: &RunConfiguration) -> RunResult {
        self(config)
    }
}

struct Inner {
    target: Arc<dyn TargetAlgorithm>,
    shutdown: AtomicBool,
}

/// Evaluator that executes runs by calling a [`TargetAlgorithm`] directly.
pub struct InProcessEvaluator {
    inner: Arc<Inner>,
}

impl InProcessEvaluator {
    pub fn new(target: impl TargetAlgorithm) -> Self {
        InProcessEvaluator {
            inner: Arc::new(Inner {
                target: Arc::new(target),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

impl Inner {
    #[instrument(skip_all, fields(batch = configs.len()))]
    fn run_batch(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EvaluatorError::Shutdown);
        }

        let kills: Vec<Arc<KillHandler>> = configs
            .iter()
            .map(|_| Arc::new(KillHandler::new()))
            .collect();
        let mut snapshot: Vec<RunResult> = configs
            .iter()
            .zip(&kills)
            .map(|(rc, kill)| RunResult::running(rc.clone(), 0.0, Arc::clone(kill)))
            .collect();

        for i in 0..configs.len() {
            let config = &configs[i];
            let seed = config.instance_seed_pair().seed();

            let result = if kills[i].is_killed() {
                debug!(%config, "run killed before it started");
                RunResult::new(
                    config.clone(),
                    RunStatus::Killed,
                    0.0,
                    0.0,
                    0.0,
                    seed,
                    "killed before dispatch",
                    0.0,
                )
            } else {
                let started = Instant::now();
                let raw = self.target.run(config);
                let elapsed = started.elapsed().as_secs_f64();
                if kills[i].is_killed() {
                    // the kill signal wins over whatever the target reported
                    RunResult::new(
                        config.clone(),
                        RunStatus::Killed,
                        raw.runtime(),
                        raw.run_length(),
                        raw.quality(),
                        seed,
                        "killed while running",
                        elapsed,
                    )
                } else {
                    RunResult::new(
                        config.clone(),
                        raw.status(),
                        raw.runtime(),
                        raw.run_length(),
                        raw.quality(),
                        raw.result_seed(),
                        raw.additional_data(),
                        elapsed,
                    )
                }
            };

            if result.status() == RunStatus::Abort {
                return Err(EvaluatorError::AlgorithmAbort(format!(
                    "target algorithm aborted on {config}"
                )));
            }

            snapshot[i] = result;
            if let Some(observer) = &observer {
                observer.current_status(&snapshot);
            }
        }

        Ok(snapshot)
    }
}

impl TargetAlgorithmEvaluator for InProcessEvaluator {
    fn evaluate_runs(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        self.inner.run_batch(configs, observer)
    }

    fn evaluate_runs_async(
        &self,
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
    ) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            callback(Err(EvaluatorError::Shutdown));
            return;
        }
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let result = inner.run_batch(configs, observer);
            callback(result);
        });
    }

    fn is_run_final(&self) -> bool {
        true
    }

    fn are_runs_persisted(&self) -> bool {
        false
    }

    fn are_runs_observable(&self) -> bool {
        true
    }

    fn notify_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }
}
