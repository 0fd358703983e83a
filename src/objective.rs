//! Pluggable objective strategies: how one run becomes a number and how sets
//! of runs collapse into one scalar per configuration.

use crate::run::{RunResult, RunStatus};
use std::sync::Arc;

use crate::run::ProblemInstance;

/// Converts a single [`RunResult`] into a response value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunObjective {
    /// Reported runtime; timeouts count as the requested cutoff and
    /// crashed/aborted runs as the scenario maximum cutoff.
    Runtime,
    /// Reported solution quality.
    Quality,
}

impl RunObjective {
    pub fn objective_of(self, run: &RunResult) -> f64 {
        match self {
            RunObjective::Runtime => match run.status() {
                RunStatus::Timeout => run.config().cutoff_time(),
                RunStatus::Killed | RunStatus::Running | RunStatus::Sat | RunStatus::Unsat => {
                    run.runtime()
                }
                RunStatus::Abort | RunStatus::Crashed => {
                    run.config().execution_context().max_cutoff_time()
                }
            },
            RunObjective::Quality => run.quality(),
        }
    }
}

/// Aggregates a collection of response values into one scalar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverallObjective {
    /// Plain mean.
    Mean,
    /// Penalized mean: values at or above the cutoff are multiplied by 10
    /// before averaging (PAR10).
    Mean10,
    /// Penalized mean with factor 1000 (PAR1000).
    Mean1000,
}

impl OverallObjective {
    pub fn aggregate(self, values: &[f64], cutoff_time: f64) -> f64 {
        if values.is_empty() {
            return f64::MAX;
        }
        let factor = self.penalty_factor();
        let sum: f64 = values
            .iter()
            .map(|&v| if v >= cutoff_time { v * factor } else { v })
            .sum();
        sum / values.len() as f64
    }

    pub fn penalty_factor(self) -> f64 {
        match self {
            OverallObjective::Mean => 1.0,
            OverallObjective::Mean10 => 10.0,
            OverallObjective::Mean1000 => 1000.0,
        }
    }
}

/// Stateless strategy bundle shared by the run history, the racing engine and
/// anything else that needs to price a set of runs.
///
/// Aggregation is two-level: seeds of one instance collapse under the intra
/// objective, instances collapse under the inter objective.
#[derive(Clone, Debug)]
pub struct ObjectiveHelper {
    run_objective: RunObjective,
    intra_objective: OverallObjective,
    inter_objective: OverallObjective,
    cutoff_time: f64,
}

impl ObjectiveHelper {
    pub fn new(
        run_objective: RunObjective,
        intra_objective: OverallObjective,
        inter_objective: OverallObjective,
        cutoff_time: f64,
    ) -> Self {
        ObjectiveHelper {
            run_objective,
            intra_objective,
            inter_objective,
            cutoff_time,
        }
    }

    pub fn run_objective(&self) -> RunObjective {
        self.run_objective
    }

    pub fn cutoff_time(&self) -> f64 {
        self.cutoff_time
    }

    /// Objective over a set of runs that all share one configuration.
    pub fn compute_objective(&self, runs: &[RunResult]) -> f64 {
        self.compute_objective_with_slack(runs, 0.0)
    }

    /// Like [`compute_objective`](Self::compute_objective), but forgives up to
    /// `cap_slack` of accumulated cost before counting, used by adaptive
    /// capping to truncate the cost of partially-run configurations.
    pub fn compute_objective_with_slack(&self, runs: &[RunResult], cap_slack: f64) -> f64 {
        // group by instance, preserving first-seen order for determinism
        let mut instances: Vec<Arc<ProblemInstance>> = Vec::new();
        let mut per_instance: Vec<Vec<f64>> = Vec::new();

        let mut remaining_slack = cap_slack;
        for run in runs {
            let instance = run.config().instance_seed_pair().instance();
            let idx = match instances.iter().position(|i| i == instance) {
                Some(idx) => idx,
                None => {
                    instances.push(Arc::clone(instance));
                    per_instance.push(Vec::new());
                    instances.len() - 1
                }
            };

            let mut value = self.run_objective.objective_of(run);
            value -= remaining_slack;
            if value < 0.0 {
                remaining_slack = -value;
                value = 0.0;
            } else {
                remaining_slack = 0.0;
            }
            per_instance[idx].push(value);
        }

        let intra: Vec<f64> = per_instance
            .iter()
            .map(|values| self.intra_objective.aggregate(values, self.cutoff_time))
            .collect();

        self.inter_objective.aggregate(&intra, self.cutoff_time)
    }
}

#[cfg(test)]
mod objective_tests {
    use super::*;
    use crate::run::{
        ExecutionContext, InstanceSeedPair, ParameterConfiguration, ParameterSpace,
        RunConfiguration,
    };
    use std::collections::BTreeMap;

    fn run_on(instance: &str, seed: i64, status: RunStatus, runtime: f64) -> RunResult {
        let space = Arc::new(ParameterSpace::new("s"));
        let ctx = Arc::new(ExecutionContext::new(Arc::clone(&space), 100.0));
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new(instance)), seed);
        let pc = ParameterConfiguration::new(space, BTreeMap::new());
        let rc = RunConfiguration::new(pisp, 10.0, pc, ctx).unwrap();
        RunResult::new(rc, status, runtime, 0.0, 0.5, seed, "", runtime)
    }

    #[test]
    fn runtime_objective_maps_statuses() {
        assert_eq!(
            RunObjective::Runtime.objective_of(&run_on("i", 1, RunStatus::Sat, 3.0)),
            3.0
        );
        // timeout counts as the requested cutoff, not the reported runtime
        assert_eq!(
            RunObjective::Runtime.objective_of(&run_on("i", 1, RunStatus::Timeout, 12.0)),
            10.0
        );
        // crashes are priced at the scenario maximum
        assert_eq!(
            RunObjective::Runtime.objective_of(&run_on("i", 1, RunStatus::Crashed, 0.0)),
            100.0
        );
    }

    #[test]
    fn penalized_mean_multiplies_capped_values() {
        let values = [10.0, 2.0];
        assert_eq!(OverallObjective::Mean.aggregate(&values, 10.0), 6.0);
        assert_eq!(OverallObjective::Mean10.aggregate(&values, 10.0), 51.0);
        assert_eq!(OverallObjective::Mean1000.aggregate(&values, 10.0), 5001.0);
    }

    #[test]
    fn empty_aggregation_is_worst_case() {
        assert_eq!(OverallObjective::Mean.aggregate(&[], 10.0), f64::MAX);
    }

    #[test]
    fn two_level_aggregation() {
        let helper = ObjectiveHelper::new(
            RunObjective::Runtime,
            OverallObjective::Mean,
            OverallObjective::Mean,
            10.0,
        );
        // i1 has two seeds (1.0, 3.0) -> 2.0; i2 has one seed -> 4.0
        let runs = vec![
            run_on("i1", 1, RunStatus::Sat, 1.0),
            run_on("i1", 2, RunStatus::Sat, 3.0),
            run_on("i2", 1, RunStatus::Sat, 4.0),
        ];
        assert_eq!(helper.compute_objective(&runs), 3.0);
    }

    #[test]
    fn cap_slack_truncates_leading_cost() {
        let helper = ObjectiveHelper::new(
            RunObjective::Runtime,
            OverallObjective::Mean,
            OverallObjective::Mean,
            10.0,
        );
        let runs = vec![
            run_on("i1", 1, RunStatus::Sat, 2.0),
            run_on("i2", 1, RunStatus::Sat, 4.0),
        ];
        // 5.0 of slack swallows the first run entirely and 3.0 of the second
        let cost = helper.compute_objective_with_slack(&runs, 5.0);
        assert_eq!(cost, 0.5);
    }
}
