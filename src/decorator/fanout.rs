//! Fans observer notifications out to any number of registered observers.
//!
//! The per-call observer keeps working as usual; observers registered on the
//! decorator additionally see every partial snapshot of every batch, plus one
//! final complete snapshot emitted strictly before the terminal callback,
//! so an observer-driven consumer (e.g. a history appender) is guaranteed to
//! have seen the completed state by the time the callback fires.

use std::sync::{Arc, Mutex};

use crate::evaluator::{
    evaluate_sync_via_async, CompletionCallback, EvaluationResult, RunObserver,
    TargetAlgorithmEvaluator,
};
use crate::run::{RunConfiguration, RunResult};

/// Decorator multiplexing observer notifications.
pub struct ObserverFanoutEvaluator {
    inner: Arc<dyn TargetAlgorithmEvaluator>,
    observers: Mutex<Vec<Arc<dyn RunObserver>>>,
}

struct FanoutObserver {
    caller: Option<Arc<dyn RunObserver>>,
    registered: Vec<Arc<dyn RunObserver>>,
}

impl FanoutObserver {
    fn notify(&self, runs: &[RunResult]) {
        if let Some(caller) = &self.caller {
            caller.current_status(runs);
        }
        for observer in &self.registered {
            observer.current_status(runs);
        }
    }
}

impl RunObserver for FanoutObserver {
    fn current_status(&self, runs: &[RunResult]) {
        self.notify(runs);
    }
}

impl ObserverFanoutEvaluator {
    pub fn new(inner: Arc<dyn TargetAlgorithmEvaluator>) -> Self {
        ObserverFanoutEvaluator {
            inner,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers an observer for all future batches. Batches already in
    /// flight keep the observer set they started with.
    pub fn register_observer(&self, observer: Arc<dyn RunObserver>) {
        self.observers.lock().expect("poisoned").push(observer);
    }

    fn fanout(&self, caller: Option<Arc<dyn RunObserver>>) -> Arc<FanoutObserver> {
        Arc::new(FanoutObserver {
            caller,
            registered: self.observers.lock().expect("poisoned").clone(),
        })
    }
}

impl TargetAlgorithmEvaluator for ObserverFanoutEvaluator {
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
        let fanout = self.fanout(observer);
        let final_notification = Arc::clone(&fanout);
        self.inner.evaluate_runs_async(
            configs,
            Box::new(move |result| {
                if let Ok(runs) = &result {
                    final_notification.notify(runs);
                }
                callback(result);
            }),
            Some(fanout as Arc<dyn RunObserver>),
        );
    }

    fn is_run_final(&self) -> bool {
        self.inner.is_run_final()
    }

    fn are_runs_persisted(&self) -> bool {
        self.inner.are_runs_persisted()
    }

    fn are_runs_observable(&self) -> bool {
        true
    }

    fn notify_shutdown(&self) {
        self.inner.notify_shutdown();
    }
}

#[cfg(test)]
mod fanout_tests {
    use super::*;
    use crate::inprocess::InProcessEvaluator;
    use crate::run::{
        ExecutionContext, InstanceSeedPair, ParameterConfiguration, ParameterSpace,
        ProblemInstance, RunStatus,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        calls: AtomicUsize,
        saw_all_completed: AtomicUsize,
    }

    impl RunObserver for CountingObserver {
        fn current_status(&self, runs: &[RunResult]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if runs.iter().all(RunResult::is_completed) {
                self.saw_all_completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

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

    #[test]
    fn registered_observer_sees_final_snapshot_before_callback() {
        let base = Arc::new(InProcessEvaluator::new(|config: &RunConfiguration| {
            RunResult::new(config.clone(), RunStatus::Sat, 1.0, 0.0, 0.0, 0, "", 1.0)
        }));
        let tae = ObserverFanoutEvaluator::new(base);
        let observer = Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            saw_all_completed: AtomicUsize::new(0),
        });
        tae.register_observer(observer.clone());

        let results = tae.evaluate_runs(configs(3), None).unwrap();
        assert_eq!(results.len(), 3);
        assert!(observer.calls.load(Ordering::SeqCst) >= 1);
        // the guaranteed complete snapshot arrived before evaluate_runs returned
        assert!(observer.saw_all_completed.load(Ordering::SeqCst) >= 1);
    }
}
