//! Immutable value objects describing a single run of the target algorithm.
//!
//! A [`RunConfiguration`] is the request ("run this parameter configuration on
//! this instance/seed, for at most this long"), a [`RunResult`] is the outcome.
//! Both are immutable once constructed: cancellation is expressed by signalling
//! the [`KillHandler`] attached to an outstanding `RUNNING` placeholder, never
//! by mutating a returned result.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;

/// A problem instance the target algorithm can be run on.
///
/// Identity is the instance name plus its instance-specific information
/// (an opaque string handed to the target algorithm, `"0"` when unused).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProblemInstance {
    name: String,
    instance_specific_information: String,
}

impl ProblemInstance {
    /// Creates an instance with no instance-specific information.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_information(name, "0")
    }

    /// Creates an instance carrying instance-specific information.
    pub fn with_information(name: impl Into<String>, info: impl Into<String>) -> Self {
        ProblemInstance {
            name: name.into(),
            instance_specific_information: info.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_specific_information(&self) -> &str {
        &self.instance_specific_information
    }
}

impl fmt::Display for ProblemInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One concrete run identity: a problem instance plus the seed handed to the
/// target algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceSeedPair {
    instance: Arc<ProblemInstance>,
    seed: i64,
}

impl InstanceSeedPair {
    pub fn new(instance: Arc<ProblemInstance>, seed: i64) -> Self {
        InstanceSeedPair { instance, seed }
    }

    pub fn instance(&self) -> &Arc<ProblemInstance> {
        &self.instance
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }
}

impl fmt::Display for InstanceSeedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.instance.name(), self.seed)
    }
}

/// Identity of a parameter configuration space.
///
/// The engine never interprets the space itself; it only enforces that a
/// configuration and the execution context it runs under agree on the space.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterSpace {
    name: String,
}

impl ParameterSpace {
    pub fn new(name: impl Into<String>) -> Self {
        ParameterSpace { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A locked parameter configuration: name → value pairs tied to a space.
///
/// Values are stored sorted by parameter name so every traversal (wire
/// encoding, hashing, logging) sees the same deterministic order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterConfiguration {
    space: Arc<ParameterSpace>,
    values: BTreeMap<String, String>,
}

impl ParameterConfiguration {
    pub fn new(space: Arc<ParameterSpace>, values: BTreeMap<String, String>) -> Self {
        ParameterConfiguration { space, values }
    }

    pub fn space(&self) -> &Arc<ParameterSpace> {
        &self.space
    }

    /// Active parameters in deterministic (sorted) order.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Execution context shared by every run of one configuration session: the
/// parameter space runs must belong to and the scenario-wide maximum cutoff.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    space: Arc<ParameterSpace>,
    max_cutoff_time: f64,
}

impl ExecutionContext {
    pub fn new(space: Arc<ParameterSpace>, max_cutoff_time: f64) -> Self {
        ExecutionContext {
            space,
            max_cutoff_time,
        }
    }

    pub fn space(&self) -> &Arc<ParameterSpace> {
        &self.space
    }

    /// Largest cutoff any run of this session may request.
    pub fn max_cutoff_time(&self) -> f64 {
        self.max_cutoff_time
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.space == other.space
            && self.max_cutoff_time.to_bits() == other.max_cutoff_time.to_bits()
    }
}

impl Eq for ExecutionContext {}

impl Hash for ExecutionContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.space.hash(state);
        self.max_cutoff_time.to_bits().hash(state);
    }
}

/// One request to run the target algorithm.
///
/// Equality covers all four fields. The hash deliberately excludes
/// `cutoff_time`: adaptive capping re-requests the same run identity under a
/// shrinking cutoff, and those retries must land in the same bucket of any
/// fingerprint-keyed cache. Do not "fix" this without also removing adaptive
/// capping.
#[derive(Clone, Debug)]
pub struct RunConfiguration {
    instance_seed_pair: InstanceSeedPair,
    cutoff_time: f64,
    parameter_configuration: ParameterConfiguration,
    execution_context: Arc<ExecutionContext>,
}

impl RunConfiguration {
    /// Builds a run configuration.
    ///
    /// # Errors
    /// Returned when the cutoff is negative or not finite, or when the
    /// configuration belongs to a different parameter space than the context.
    pub fn new(
        instance_seed_pair: InstanceSeedPair,
        cutoff_time: f64,
        parameter_configuration: ParameterConfiguration,
        execution_context: Arc<ExecutionContext>,
    ) -> anyhow::Result<Self> {
        if !cutoff_time.is_finite() || cutoff_time < 0.0 {
            bail!("cutoff time must be finite and non-negative, got {cutoff_time}");
        }
        if parameter_configuration.space() != execution_context.space() {
            bail!(
                "parameter configuration belongs to space '{}' but execution context expects '{}'",
                parameter_configuration.space().name(),
                execution_context.space().name()
            );
        }
        Ok(RunConfiguration {
            instance_seed_pair,
            cutoff_time,
            parameter_configuration,
            execution_context,
        })
    }

    /// Same run identity with a different requested cutoff (adaptive capping).
    pub fn with_cutoff(&self, cutoff_time: f64) -> anyhow::Result<Self> {
        RunConfiguration::new(
            self.instance_seed_pair.clone(),
            cutoff_time,
            self.parameter_configuration.clone(),
            Arc::clone(&self.execution_context),
        )
    }

    pub fn instance_seed_pair(&self) -> &InstanceSeedPair {
        &self.instance_seed_pair
    }

    pub fn cutoff_time(&self) -> f64 {
        self.cutoff_time
    }

    pub fn parameter_configuration(&self) -> &ParameterConfiguration {
        &self.parameter_configuration
    }

    pub fn execution_context(&self) -> &Arc<ExecutionContext> {
        &self.execution_context
    }
}

impl PartialEq for RunConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.instance_seed_pair == other.instance_seed_pair
            && self.cutoff_time.to_bits() == other.cutoff_time.to_bits()
            && self.parameter_configuration == other.parameter_configuration
            && self.execution_context == other.execution_context
    }
}

impl Eq for RunConfiguration {}

impl Hash for RunConfiguration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // cutoff_time intentionally left out, see type-level docs
        self.instance_seed_pair.hash(state);
        self.parameter_configuration.hash(state);
        self.execution_context.hash(state);
    }
}

impl fmt::Display for RunConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (cutoff {}s)",
            self.instance_seed_pair, self.cutoff_time
        )
    }
}

/// Outcome category of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// Still outstanding; only appears in observer snapshots.
    Running,
    Sat,
    Unsat,
    Timeout,
    /// Cancelled before completion (by a kill handler or a decorator).
    Killed,
    /// The target algorithm asked the whole experiment to stop.
    Abort,
    Crashed,
}

impl RunStatus {
    /// True once the run has a definitive outcome.
    pub fn is_completed(self) -> bool {
        self != RunStatus::Running
    }

    /// Statuses a wrapper script is allowed to report. `RUNNING` and `KILLED`
    /// are internal to the engine.
    pub fn permitted_by_wrappers(self) -> bool {
        matches!(
            self,
            RunStatus::Sat
                | RunStatus::Unsat
                | RunStatus::Timeout
                | RunStatus::Abort
                | RunStatus::Crashed
        )
    }

    /// Parses a status token from a wrapper response line (case-insensitive,
    /// with the historical aliases).
    pub fn from_wrapper_key(key: &str) -> Option<RunStatus> {
        match key.trim().to_ascii_uppercase().as_str() {
            "SAT" | "SATISFIABLE" | "SUCCESS" => Some(RunStatus::Sat),
            "UNSAT" | "UNSATISFIABLE" => Some(RunStatus::Unsat),
            "TIMEOUT" => Some(RunStatus::Timeout),
            "ABORT" => Some(RunStatus::Abort),
            "CRASHED" => Some(RunStatus::Crashed),
            _ => None,
        }
    }

    /// Tokens accepted by [`RunStatus::from_wrapper_key`], for diagnostics.
    pub fn wrapper_aliases() -> &'static [&'static str] {
        &[
            "ABORT",
            "CRASHED",
            "SAT",
            "SATISFIABLE",
            "SUCCESS",
            "TIMEOUT",
            "UNSAT",
            "UNSATISFIABLE",
        ]
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Sat => "SAT",
            RunStatus::Unsat => "UNSAT",
            RunStatus::Timeout => "TIMEOUT",
            RunStatus::Killed => "KILLED",
            RunStatus::Abort => "ABORT",
            RunStatus::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

/// Shared cancellation flag for one outstanding run.
///
/// Signalling is one-way: once killed, a run must surface `KILLED`, never a
/// later SAT/UNSAT.
#[derive(Debug, Default)]
pub struct KillHandler(AtomicBool);

impl KillHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of executing exactly one [`RunConfiguration`].
///
/// Immutable once completed. A `RUNNING` placeholder additionally carries a
/// [`KillHandler`] through which the caller may request cancellation.
#[derive(Clone, Debug)]
pub struct RunResult {
    config: RunConfiguration,
    status: RunStatus,
    runtime: f64,
    run_length: f64,
    quality: f64,
    result_seed: i64,
    wallclock_time: f64,
    additional_data: String,
    censored_early: bool,
    kill: Option<Arc<KillHandler>>,
}

impl RunResult {
    /// Completed run. `censored_early` is derived: a killed run, or a timeout
    /// whose requested cutoff was below the scenario maximum, only bounds the
    /// true performance from below.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RunConfiguration,
        status: RunStatus,
        runtime: f64,
        run_length: f64,
        quality: f64,
        result_seed: i64,
        additional_data: impl Into<String>,
        wallclock_time: f64,
    ) -> Self {
        let censored_early = match status {
            RunStatus::Killed => true,
            RunStatus::Timeout => {
                config.cutoff_time() < config.execution_context().max_cutoff_time()
            }
            _ => false,
        };
        RunResult {
            config,
            status,
            runtime,
            run_length,
            quality,
            result_seed,
            wallclock_time,
            additional_data: additional_data.into(),
            censored_early,
            kill: None,
        }
    }

    /// `RUNNING` placeholder shown to observers while the run is outstanding.
    pub fn running(config: RunConfiguration, wallclock_time: f64, kill: Arc<KillHandler>) -> Self {
        let result_seed = config.instance_seed_pair().seed();
        RunResult {
            config,
            status: RunStatus::Running,
            runtime: 0.0,
            run_length: 0.0,
            quality: 0.0,
            result_seed,
            wallclock_time,
            additional_data: String::new(),
            censored_early: false,
            kill: Some(kill),
        }
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn runtime(&self) -> f64 {
        self.runtime
    }

    pub fn run_length(&self) -> f64 {
        self.run_length
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }

    pub fn result_seed(&self) -> i64 {
        self.result_seed
    }

    pub fn wallclock_time(&self) -> f64 {
        self.wallclock_time
    }

    pub fn additional_data(&self) -> &str {
        &self.additional_data
    }

    pub fn censored_early(&self) -> bool {
        self.censored_early
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Requests cancellation of this outstanding run. No-op on completed runs.
    pub fn kill(&self) {
        if let Some(kill) = &self.kill {
            kill.kill();
        }
    }

    /// True if someone asked for this run to be killed.
    pub fn kill_requested(&self) -> bool {
        self.kill.as_ref().is_some_and(|k| k.is_killed())
    }
}

impl PartialEq for RunResult {
    fn eq(&self, other: &Self) -> bool {
        // the kill flag is control state, not part of the outcome
        self.config == other.config
            && self.status == other.status
            && self.runtime.to_bits() == other.runtime.to_bits()
            && self.run_length.to_bits() == other.run_length.to_bits()
            && self.quality.to_bits() == other.quality.to_bits()
            && self.result_seed == other.result_seed
            && self.wallclock_time.to_bits() == other.wallclock_time.to_bits()
            && self.additional_data == other.additional_data
            && self.censored_early == other.censored_early
    }
}

impl Eq for RunResult {}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} in {:.4}s",
            self.config.instance_seed_pair(),
            self.status,
            self.runtime
        )
    }
}

#[cfg(test)]
mod run_model_tests {
    use super::*;

    fn context() -> Arc<ExecutionContext> {
        let space = Arc::new(ParameterSpace::new("space"));
        Arc::new(ExecutionContext::new(space, 300.0))
    }

    fn config_with_cutoff(cutoff: f64) -> RunConfiguration {
        let ctx = context();
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new("i1")), 42);
        let pc = ParameterConfiguration::new(Arc::clone(ctx.space()), BTreeMap::new());
        RunConfiguration::new(pisp, cutoff, pc, ctx).unwrap()
    }

    #[test]
    fn cutoff_excluded_from_hash_but_not_equality() {
        use std::collections::hash_map::DefaultHasher;

        let a = config_with_cutoff(10.0);
        let b = a.with_cutoff(5.0).unwrap();
        assert_ne!(a, b);

        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn space_mismatch_rejected() {
        let ctx = context();
        let other_space = Arc::new(ParameterSpace::new("other"));
        let pc = ParameterConfiguration::new(other_space, BTreeMap::new());
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new("i1")), 1);
        assert!(RunConfiguration::new(pisp, 10.0, pc, ctx).is_err());
    }

    #[test]
    fn negative_cutoff_rejected() {
        let ctx = context();
        let pc = ParameterConfiguration::new(Arc::clone(ctx.space()), BTreeMap::new());
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new("i1")), 1);
        assert!(RunConfiguration::new(pisp, -1.0, pc, ctx).is_err());
    }

    #[test]
    fn censored_early_derivation() {
        let capped = RunResult::new(
            config_with_cutoff(10.0),
            RunStatus::Timeout,
            10.0,
            0.0,
            0.0,
            42,
            "",
            10.0,
        );
        assert!(capped.censored_early());

        let full = RunResult::new(
            config_with_cutoff(300.0),
            RunStatus::Timeout,
            300.0,
            0.0,
            0.0,
            42,
            "",
            300.0,
        );
        assert!(!full.censored_early());

        let solved = RunResult::new(
            config_with_cutoff(10.0),
            RunStatus::Sat,
            1.0,
            0.0,
            0.0,
            42,
            "",
            1.0,
        );
        assert!(!solved.censored_early());
    }

    #[test]
    fn kill_flag_shared_across_clones() {
        let kill = Arc::new(KillHandler::new());
        let running = RunResult::running(config_with_cutoff(10.0), 0.5, kill);
        let clone = running.clone();
        assert!(!clone.kill_requested());
        running.kill();
        assert!(clone.kill_requested());
    }

    #[test]
    fn wrapper_key_aliases() {
        assert_eq!(
            RunStatus::from_wrapper_key("satisfiable"),
            Some(RunStatus::Sat)
        );
        assert_eq!(RunStatus::from_wrapper_key("UNSAT"), Some(RunStatus::Unsat));
        assert_eq!(RunStatus::from_wrapper_key("nonsense"), None);
        assert!(RunStatus::from_wrapper_key("TIMEOUT")
            .unwrap()
            .permitted_by_wrappers());
        assert!(!RunStatus::Killed.permitted_by_wrappers());
    }
}
