//! Thread-safe ledger of every run executed in a configuration session.
//!
//! The history is the single structure mutated from many threads: decorators
//! append results as they stream in, the racing engine and caching layer read
//! concurrently. All mutation goes through [`ThreadSafeRunHistory::append`];
//! components that must never write get a [`ReadOnlyRunHistory`] view, whose
//! lack of mutating methods is enforced by the type system.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::evaluator::EvaluatorError;
use crate::objective::{ObjectiveHelper, OverallObjective, RunObjective};
use crate::run::{
    ExecutionContext, InstanceSeedPair, ParameterConfiguration, ProblemInstance, RunConfiguration,
    RunResult,
};

/// Per-parameter-configuration record.
///
/// `runs` keeps insertion order and holds the best-known (non-redundant)
/// result per instance-seed pair; a re-run of a known pair replaces its entry
/// in place so the position never changes. The superseded results live on in
/// the session-wide ledger.
#[derive(Debug, Default)]
struct ConfigRecord {
    runs: Vec<RunResult>,
    index_of_pair: HashMap<InstanceSeedPair, usize>,
    run_count_including_redundant: usize,
}

/// The run ledger, single-threaded flavour. Wrap in [`ThreadSafeRunHistory`]
/// before sharing.
#[derive(Debug)]
pub struct RunHistory {
    run_objective: RunObjective,
    intra_objective: OverallObjective,
    inter_objective: OverallObjective,
    result_by_config: HashMap<RunConfiguration, RunResult>,
    records: HashMap<ParameterConfiguration, ConfigRecord>,
    all_runs: Vec<RunResult>,
    total_runtime_sum: f64,
    context: Option<Arc<ExecutionContext>>,
}

impl RunHistory {
    pub fn new(
        run_objective: RunObjective,
        intra_objective: OverallObjective,
        inter_objective: OverallObjective,
    ) -> Self {
        RunHistory {
            run_objective,
            intra_objective,
            inter_objective,
            result_by_config: HashMap::new(),
            records: HashMap::new(),
            all_runs: Vec::new(),
            total_runtime_sum: 0.0,
            context: None,
        }
    }

    /// Appends one completed run.
    ///
    /// An exact duplicate (same run configuration, cutoff included) is
    /// rejected with [`EvaluatorError::DuplicateRun`] carrying the stored
    /// result. A re-run of a known (configuration, instance-seed pair) under a
    /// different cutoff is accepted as a redundant re-run: it replaces the
    /// best-known entry in place and the old result stays in the full ledger.
    ///
    /// # Panics
    /// On attempts to append an outstanding (`RUNNING`) run or a run from a
    /// different execution context than the session's first run: both are
    /// caller bugs, not recoverable conditions.
    pub fn append(&mut self, run: RunResult) -> Result<(), EvaluatorError> {
        assert!(
            run.is_completed(),
            "only completed runs may enter the history"
        );

        let context = run.config().execution_context();
        match &self.context {
            None => self.context = Some(Arc::clone(context)),
            Some(first) => assert!(
                first == context,
                "history cannot mix runs from different execution contexts"
            ),
        }

        if let Some(existing) = self.result_by_config.get(run.config()) {
            return Err(EvaluatorError::DuplicateRun {
                existing: Box::new(existing.clone()),
            });
        }

        let param = run.config().parameter_configuration().clone();
        let pair = run.config().instance_seed_pair().clone();

        let record = self.records.entry(param).or_default();
        record.run_count_including_redundant += 1;
        match record.index_of_pair.get(&pair) {
            Some(&idx) => {
                trace!(%pair, "redundant re-run replaces best-known result");
                record.runs[idx] = run.clone();
            }
            None => {
                record.index_of_pair.insert(pair, record.runs.len());
                record.runs.push(run.clone());
            }
        }

        self.total_runtime_sum += run.runtime().max(0.0);
        self.result_by_config.insert(run.config().clone(), run.clone());
        self.all_runs.push(run);
        Ok(())
    }

    /// Result previously stored for exactly this run configuration.
    pub fn result_for(&self, config: &RunConfiguration) -> Option<&RunResult> {
        self.result_by_config.get(config)
    }

    /// Best-known runs of a configuration, one per instance-seed pair, in
    /// first-execution order.
    pub fn runs_excluding_redundant(&self, param: &ParameterConfiguration) -> &[RunResult] {
        self.records
            .get(param)
            .map(|r| r.runs.as_slice())
            .unwrap_or(&[])
    }

    /// Every run ever appended, superseded re-runs included.
    pub fn all_runs(&self) -> &[RunResult] {
        &self.all_runs
    }

    pub fn instances_ran(&self, param: &ParameterConfiguration) -> HashSet<Arc<ProblemInstance>> {
        self.runs_excluding_redundant(param)
            .iter()
            .map(|r| Arc::clone(r.config().instance_seed_pair().instance()))
            .collect()
    }

    pub fn instance_seed_pairs_ran(
        &self,
        param: &ParameterConfiguration,
    ) -> HashSet<InstanceSeedPair> {
        self.runs_excluding_redundant(param)
            .iter()
            .map(|r| r.config().instance_seed_pair().clone())
            .collect()
    }

    pub fn run_count(&self, param: &ParameterConfiguration) -> usize {
        self.records
            .get(param)
            .map(|r| r.run_count_including_redundant)
            .unwrap_or(0)
    }

    pub fn run_count_excluding_redundant(&self, param: &ParameterConfiguration) -> usize {
        self.runs_excluding_redundant(param).len()
    }

    /// Sum of all reported runtimes, redundant runs included.
    pub fn total_runtime_sum(&self) -> f64 {
        self.total_runtime_sum
    }

    /// Empirical cost of a configuration over an instance set: intra-instance
    /// aggregation over seeds, inter-instance aggregation over instances,
    /// under the given cutoff. `f64::MAX` when nothing relevant was run.
    pub fn empirical_cost(
        &self,
        param: &ParameterConfiguration,
        instances: &HashSet<Arc<ProblemInstance>>,
        cutoff_time: f64,
    ) -> f64 {
        let relevant: Vec<RunResult> = self
            .runs_excluding_redundant(param)
            .iter()
            .filter(|r| instances.contains(r.config().instance_seed_pair().instance()))
            .cloned()
            .collect();
        if relevant.is_empty() {
            return f64::MAX;
        }
        ObjectiveHelper::new(
            self.run_objective,
            self.intra_objective,
            self.inter_objective,
            cutoff_time,
        )
        .compute_objective(&relevant)
    }

    pub fn run_objective(&self) -> RunObjective {
        self.run_objective
    }

    pub fn intra_objective(&self) -> OverallObjective {
        self.intra_objective
    }

    pub fn inter_objective(&self) -> OverallObjective {
        self.inter_objective
    }
}

/// [`RunHistory`] behind a read/write lock: one writer, any number of
/// concurrent readers, no dirty reads of a half-inserted run.
#[derive(Debug)]
pub struct ThreadSafeRunHistory {
    inner: RwLock<RunHistory>,
}

impl ThreadSafeRunHistory {
    pub fn new(history: RunHistory) -> Self {
        ThreadSafeRunHistory {
            inner: RwLock::new(history),
        }
    }

    /// Atomic append of one run.
    pub fn append(&self, run: RunResult) -> Result<(), EvaluatorError> {
        self.inner.write().expect("poisoned").append(run)
    }

    /// Appends a batch atomically: readers see all of it or none of it.
    /// Stops at the first duplicate.
    pub fn append_all(
        &self,
        runs: impl IntoIterator<Item = RunResult>,
    ) -> Result<(), EvaluatorError> {
        let mut inner = self.inner.write().expect("poisoned");
        for run in runs {
            inner.append(run)?;
        }
        Ok(())
    }

    pub fn result_for(&self, config: &RunConfiguration) -> Option<RunResult> {
        self.inner
            .read()
            .expect("poisoned")
            .result_for(config)
            .cloned()
    }

    pub fn runs_excluding_redundant(&self, param: &ParameterConfiguration) -> Vec<RunResult> {
        self.inner
            .read()
            .expect("poisoned")
            .runs_excluding_redundant(param)
            .to_vec()
    }

    pub fn instances_ran(&self, param: &ParameterConfiguration) -> HashSet<Arc<ProblemInstance>> {
        self.inner.read().expect("poisoned").instances_ran(param)
    }

    pub fn instance_seed_pairs_ran(
        &self,
        param: &ParameterConfiguration,
    ) -> HashSet<InstanceSeedPair> {
        self.inner
            .read()
            .expect("poisoned")
            .instance_seed_pairs_ran(param)
    }

    pub fn run_count(&self, param: &ParameterConfiguration) -> usize {
        self.inner.read().expect("poisoned").run_count(param)
    }

    pub fn run_count_excluding_redundant(&self, param: &ParameterConfiguration) -> usize {
        self.inner
            .read()
            .expect("poisoned")
            .run_count_excluding_redundant(param)
    }

    pub fn total_runtime_sum(&self) -> f64 {
        self.inner.read().expect("poisoned").total_runtime_sum()
    }

    pub fn empirical_cost(
        &self,
        param: &ParameterConfiguration,
        instances: &HashSet<Arc<ProblemInstance>>,
        cutoff_time: f64,
    ) -> f64 {
        self.inner
            .read()
            .expect("poisoned")
            .empirical_cost(param, instances, cutoff_time)
    }

    /// A sharable view that cannot write.
    pub fn read_only(self: &Arc<Self>) -> ReadOnlyRunHistory {
        ReadOnlyRunHistory {
            inner: Arc::clone(self),
        }
    }
}

/// Query-only view of a [`ThreadSafeRunHistory`]. Handed to components (e.g.
/// the caching decorator) that must never mutate the ledger.
#[derive(Clone, Debug)]
pub struct ReadOnlyRunHistory {
    inner: Arc<ThreadSafeRunHistory>,
}

impl ReadOnlyRunHistory {
    pub fn result_for(&self, config: &RunConfiguration) -> Option<RunResult> {
        self.inner.result_for(config)
    }

    pub fn runs_excluding_redundant(&self, param: &ParameterConfiguration) -> Vec<RunResult> {
        self.inner.runs_excluding_redundant(param)
    }

    pub fn instances_ran(&self, param: &ParameterConfiguration) -> HashSet<Arc<ProblemInstance>> {
        self.inner.instances_ran(param)
    }

    pub fn instance_seed_pairs_ran(
        &self,
        param: &ParameterConfiguration,
    ) -> HashSet<InstanceSeedPair> {
        self.inner.instance_seed_pairs_ran(param)
    }

    pub fn run_count(&self, param: &ParameterConfiguration) -> usize {
        self.inner.run_count(param)
    }

    pub fn empirical_cost(
        &self,
        param: &ParameterConfiguration,
        instances: &HashSet<Arc<ProblemInstance>>,
        cutoff_time: f64,
    ) -> f64 {
        self.inner.empirical_cost(param, instances, cutoff_time)
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;
    use crate::run::{ParameterSpace, RunStatus};
    use std::collections::BTreeMap;
    use std::thread;

    fn space_and_context() -> (Arc<ParameterSpace>, Arc<ExecutionContext>) {
        let space = Arc::new(ParameterSpace::new("s"));
        let ctx = Arc::new(ExecutionContext::new(Arc::clone(&space), 100.0));
        (space, ctx)
    }

    fn param(space: &Arc<ParameterSpace>, name: &str) -> ParameterConfiguration {
        let mut values = BTreeMap::new();
        values.insert("p".to_string(), name.to_string());
        ParameterConfiguration::new(Arc::clone(space), values)
    }

    fn completed_run(
        param: &ParameterConfiguration,
        ctx: &Arc<ExecutionContext>,
        instance: &str,
        seed: i64,
        cutoff: f64,
        runtime: f64,
    ) -> RunResult {
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new(instance)), seed);
        let rc = RunConfiguration::new(pisp, cutoff, param.clone(), Arc::clone(ctx)).unwrap();
        RunResult::new(rc, RunStatus::Sat, runtime, 0.0, 0.0, seed, "", runtime)
    }

    fn new_history() -> RunHistory {
        RunHistory::new(
            RunObjective::Runtime,
            OverallObjective::Mean,
            OverallObjective::Mean,
        )
    }

    #[test]
    fn exact_duplicate_is_rejected_with_existing_result() {
        let (space, ctx) = space_and_context();
        let p = param(&space, "a");
        let mut history = new_history();

        let run = completed_run(&p, &ctx, "i1", 1, 10.0, 2.0);
        history.append(run.clone()).unwrap();

        match history.append(run.clone()) {
            Err(EvaluatorError::DuplicateRun { existing }) => assert_eq!(*existing, run),
            other => panic!("expected DuplicateRun, got {other:?}"),
        }
        assert_eq!(history.runs_excluding_redundant(&p).len(), 1);
    }

    #[test]
    fn rerun_under_different_cutoff_is_redundant_and_replaces_in_place() {
        let (space, ctx) = space_and_context();
        let p = param(&space, "a");
        let mut history = new_history();

        history
            .append(completed_run(&p, &ctx, "i1", 1, 5.0, 5.0))
            .unwrap();
        history
            .append(completed_run(&p, &ctx, "i2", 1, 5.0, 1.0))
            .unwrap();
        // adaptive capping re-ran i1 with a larger cutoff
        history
            .append(completed_run(&p, &ctx, "i1", 1, 20.0, 7.0))
            .unwrap();

        let runs = history.runs_excluding_redundant(&p);
        assert_eq!(runs.len(), 2);
        // in-place replacement keeps i1 first
        assert_eq!(runs[0].config().instance_seed_pair().instance().name(), "i1");
        assert_eq!(runs[0].runtime(), 7.0);
        assert_eq!(history.run_count(&p), 3);
        assert_eq!(history.run_count_excluding_redundant(&p), 2);
        assert_eq!(history.all_runs().len(), 3);
    }

    #[test]
    fn empirical_cost_restricted_to_instance_set() {
        let (space, ctx) = space_and_context();
        let p = param(&space, "a");
        let mut history = new_history();

        history
            .append(completed_run(&p, &ctx, "i1", 1, 10.0, 2.0))
            .unwrap();
        history
            .append(completed_run(&p, &ctx, "i2", 1, 10.0, 4.0))
            .unwrap();

        let all = history.instances_ran(&p);
        assert_eq!(history.empirical_cost(&p, &all, 10.0), 3.0);

        let only_i1: HashSet<_> = all
            .iter()
            .filter(|i| i.name() == "i1")
            .cloned()
            .collect();
        assert_eq!(history.empirical_cost(&p, &only_i1, 10.0), 2.0);

        let unknown = param(&space, "never-run");
        assert_eq!(history.empirical_cost(&unknown, &all, 10.0), f64::MAX);
    }

    #[test]
    fn concurrent_append_and_read() {
        let (space, ctx) = space_and_context();
        let history = Arc::new(ThreadSafeRunHistory::new(new_history()));

        let mut writers = vec![];
        for t in 0..4 {
            let history = Arc::clone(&history);
            let space = Arc::clone(&space);
            let ctx = Arc::clone(&ctx);
            writers.push(thread::spawn(move || {
                let p = param(&space, &format!("cfg{t}"));
                for seed in 0..25 {
                    let run = completed_run(&p, &ctx, "i1", seed, 10.0, 1.0);
                    history.append(run).unwrap();
                }
            }));
        }

        let reader = {
            let history = Arc::clone(&history);
            let space = Arc::clone(&space);
            thread::spawn(move || {
                for _ in 0..200 {
                    let p = param(&space, "cfg0");
                    // any consistent snapshot is fine, just must not tear
                    let runs = history.runs_excluding_redundant(&p);
                    assert!(runs.len() <= 25);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();

        for t in 0..4 {
            let p = param(&space, &format!("cfg{t}"));
            assert_eq!(history.run_count_excluding_redundant(&p), 25);
        }
        assert_eq!(history.total_runtime_sum(), 100.0);
    }

    #[test]
    fn read_only_view_sees_appends() {
        let (space, ctx) = space_and_context();
        let p = param(&space, "a");
        let history = Arc::new(ThreadSafeRunHistory::new(new_history()));
        let view = history.read_only();

        let run = completed_run(&p, &ctx, "i1", 1, 10.0, 2.0);
        assert!(view.result_for(run.config()).is_none());
        history.append(run.clone()).unwrap();
        assert_eq!(view.result_for(run.config()), Some(run));
    }
}
