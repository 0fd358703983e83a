//! Statistical racing between the incumbent and a challenger configuration.
//!
//! The decision works on whatever partial evidence the run history holds: an
//! early-reject short-circuit prices both configurations on their common
//! instances, and only if the challenger survives that does the bootstrap
//! over the common instance-seed pairs run. Everything iterates in a stable
//! order, so a fixed RNG stream gives bit-reproducible verdicts.

use std::collections::HashMap;

use rand::Rng;
use tracing::debug;

use crate::history::ThreadSafeRunHistory;
use crate::objective::ObjectiveHelper;
use crate::run::{InstanceSeedPair, ParameterConfiguration, RunResult};

/// Outcome of one challenger-versus-incumbent comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeVerdict {
    /// Not enough evidence either way; run more and ask again.
    Continue,
    /// The challenger is clearly worse, stop spending runs on it.
    RejectChallenger,
    /// The challenger dominated in at least 95% of resamples.
    AcceptChallenger,
}

const BOOTSTRAP_SAMPLES: usize = 1000;
const REJECT_TOLERANCE: f64 = 1e-6;

/// Compares a challenger against the incumbent on the shared evidence in
/// `history`.
///
/// 1. Prices both on the instances they have in common; if the incumbent is
///    cheaper by more than a tolerance, the challenger is rejected outright
///    (the adaptive-capping short-circuit, no statistics needed).
/// 2. Otherwise draws `|common|` instance-seed pairs with replacement, 1000
///    times, and records the difference of the two objectives per draw. A
///    95th percentile below zero accepts the challenger; anything else asks
///    for more runs.
pub fn compare_challenger_with_incumbent<R: Rng>(
    history: &ThreadSafeRunHistory,
    challenger: &ParameterConfiguration,
    incumbent: &ParameterConfiguration,
    rng: &mut R,
    objectives: &ObjectiveHelper,
    cutoff_time: f64,
) -> ChallengeVerdict {
    let challenger_instances = history.instances_ran(challenger);
    let mut common_instances = history.instances_ran(incumbent);
    common_instances.retain(|i| challenger_instances.contains(i));

    let incumbent_cost = history.empirical_cost(incumbent, &common_instances, cutoff_time);
    let challenger_cost = history.empirical_cost(challenger, &common_instances, cutoff_time);
    debug!(incumbent_cost, challenger_cost, "challenge costs over common instances");

    if incumbent_cost + REJECT_TOLERANCE < challenger_cost {
        return ChallengeVerdict::RejectChallenger;
    }

    let challenger_pairs = history.instance_seed_pairs_ran(challenger);
    let mut common_pairs = history.instance_seed_pairs_ran(incumbent);
    common_pairs.retain(|p| challenger_pairs.contains(p));

    // run lists are insertion-ordered, so building the lookup tables from
    // them keeps the draw order deterministic for a fixed RNG stream
    let incumbent_runs = history.runs_excluding_redundant(incumbent);
    let challenger_runs = history.runs_excluding_redundant(challenger);

    let mut ordered_pairs: Vec<InstanceSeedPair> = Vec::new();
    let mut challenger_by_pair: HashMap<InstanceSeedPair, RunResult> = HashMap::new();
    let mut incumbent_by_pair: HashMap<InstanceSeedPair, RunResult> = HashMap::new();

    for run in &incumbent_runs {
        let pair = run.config().instance_seed_pair();
        if common_pairs.contains(pair) {
            incumbent_by_pair.insert(pair.clone(), run.clone());
        }
    }
    for run in &challenger_runs {
        let pair = run.config().instance_seed_pair();
        if common_pairs.contains(pair) {
            if !challenger_by_pair.contains_key(pair) {
                ordered_pairs.push(pair.clone());
            }
            challenger_by_pair.insert(pair.clone(), run.clone());
        }
    }

    if ordered_pairs.is_empty() {
        return ChallengeVerdict::Continue;
    }

    let mut differences = [0.0f64; BOOTSTRAP_SAMPLES];
    for difference in differences.iter_mut() {
        let mut challenger_sample: Vec<RunResult> = Vec::with_capacity(ordered_pairs.len());
        let mut incumbent_sample: Vec<RunResult> = Vec::with_capacity(ordered_pairs.len());
        for _ in 0..ordered_pairs.len() {
            let pair = &ordered_pairs[rng.gen_range(0..ordered_pairs.len())];
            challenger_sample.push(
                challenger_by_pair
                    .get(pair)
                    .expect("pair drawn from the common set has a challenger run")
                    .clone(),
            );
            incumbent_sample.push(
                incumbent_by_pair
                    .get(pair)
                    .expect("pair drawn from the common set has an incumbent run")
                    .clone(),
            );
        }
        *difference = objectives.compute_objective(&challenger_sample)
            - objectives.compute_objective(&incumbent_sample);
    }

    let significance = percentile(&mut differences, 95.0);
    debug!(significance, "95th percentile of bootstrap differences");

    if significance < 0.0 {
        ChallengeVerdict::AcceptChallenger
    } else {
        ChallengeVerdict::Continue
    }
}

/// Cutoff to request for the challenger's next runs under adaptive capping:
/// the incumbent's total cost over the already-common instances (stretched by
/// a multiplicative and an additive slack) minus what the challenger has
/// spent there, clamped into `[0, scenario_cutoff]`.
pub fn adaptive_cap_cutoff(
    history: &ThreadSafeRunHistory,
    challenger: &ParameterConfiguration,
    incumbent: &ParameterConfiguration,
    objectives: &ObjectiveHelper,
    scenario_cutoff: f64,
    cap_slack: f64,
    cap_add_slack: f64,
) -> f64 {
    let challenger_runs = history.runs_excluding_redundant(challenger);
    let challenger_spent: f64 = challenger_runs
        .iter()
        .map(|r| objectives.run_objective().objective_of(r))
        .sum();

    let challenger_instances = history.instances_ran(challenger);
    let incumbent_runs = history.runs_excluding_redundant(incumbent);
    let incumbent_total: f64 = incumbent_runs
        .iter()
        .filter(|r| challenger_instances.contains(r.config().instance_seed_pair().instance()))
        .map(|r| objectives.run_objective().objective_of(r))
        .sum();

    let bound = incumbent_total * cap_slack + cap_add_slack - challenger_spent;
    bound.clamp(0.0, scenario_cutoff)
}

/// Percentile with the classic `p (n + 1) / 100` position estimate
/// (interpolated between the neighbouring order statistics).
fn percentile(values: &mut [f64], p: f64) -> f64 {
    assert!(!values.is_empty(), "percentile of nothing");
    values.sort_by(|a, b| a.partial_cmp(b).expect("NaN in bootstrap differences"));
    let n = values.len();
    let pos = p / 100.0 * (n as f64 + 1.0);
    if pos < 1.0 {
        return values[0];
    }
    if pos >= n as f64 {
        return values[n - 1];
    }
    let lower = pos.floor() as usize; // 1-based
    let fraction = pos - pos.floor();
    values[lower - 1] + fraction * (values[lower] - values[lower - 1])
}
