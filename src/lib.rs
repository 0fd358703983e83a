//! # Paramrace
//!
//! Run-execution and statistical-racing engine for automatic algorithm
//! configuration: launch a black-box target algorithm under many parameter
//! configurations, record what happened, and decide under a time budget which
//! configuration to keep.
//!
//! It provides:
//! - The synchronous/asynchronous evaluation contract
//!   ([`TargetAlgorithmEvaluator`](crate::evaluator::TargetAlgorithmEvaluator))
//!   with order-preserving batches and partial-status observers
//! - IPC transports (TCP, UDP, reverse TCP) with pluggable wire encodings,
//!   plus an in-process transport for embedded targets and tests
//! - A decorator chain: caching against the run history, pre/post command
//!   hooks, timing-invariant correction, observer fan-out and resource
//!   bounding via a fair multi-permit semaphore
//! - A thread-safe [`RunHistory`](crate::history::RunHistory) serving
//!   concurrent readers and writers
//! - Bootstrap racing between incumbent and challenger with adaptive capping
//!   ([`race`])
//!
//! # Usage Example
//!
//! Evaluate a batch against an in-process target behind the full decorator
//! chain, then race a challenger against the incumbent:
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! use paramrace::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let space = Arc::new(ParameterSpace::new("sat-solver"));
//!     let context = Arc::new(ExecutionContext::new(Arc::clone(&space), 300.0));
//!
//!     let history = Arc::new(ThreadSafeRunHistory::new(RunHistory::new(
//!         RunObjective::Runtime,
//!         OverallObjective::Mean,
//!         OverallObjective::Mean10,
//!     )));
//!
//!     // the target algorithm: here a closure, usually an IpcEvaluator
//!     let base = Arc::new(InProcessEvaluator::new(|rc: &RunConfiguration| {
//!         let seed = rc.instance_seed_pair().seed();
//!         RunResult::new(rc.clone(), RunStatus::Sat, 1.0, 0.0, 0.0, seed, "", 1.0)
//!     }));
//!
//!     let configuration = Configuration::from_env().with_concurrent_runs(4);
//!     let tae = EvaluatorBuilder::new(configuration)
//!         .with_history(Arc::clone(&history))
//!         .build(base)?;
//!
//!     let incumbent = ParameterConfiguration::new(Arc::clone(&space), BTreeMap::new());
//!     let instance = Arc::new(ProblemInstance::new("queens8"));
//!     let run = RunConfiguration::new(
//!         InstanceSeedPair::new(instance, 42),
//!         300.0,
//!         incumbent.clone(),
//!         Arc::clone(&context),
//!     )?;
//!
//!     for result in tae.evaluate_runs(vec![run], None)? {
//!         history.append(result)?;
//!     }
//!
//!     let challenger = incumbent.clone(); // usually proposed by a model
//!     let objectives = ObjectiveHelper::new(
//!         RunObjective::Runtime,
//!         OverallObjective::Mean,
//!         OverallObjective::Mean10,
//!         300.0,
//!     );
//!     let mut rng = SmallRng::seed_from_u64(0xbeef);
//!     let verdict = compare_challenger_with_incumbent(
//!         &history,
//!         &challenger,
//!         &incumbent,
//!         &mut rng,
//!         &objectives,
//!         300.0,
//!     );
//!     println!("{verdict:?}");
//!
//!     tae.notify_shutdown();
//!     Ok(())
//! }
//! ```

pub use anyhow;

pub mod builder;
pub mod configuration;
pub mod decorator;
pub mod evaluator;
pub mod history;
pub mod inprocess;
pub mod ipc;
mod logger;
pub mod objective;
pub mod race;
pub mod registry;
pub mod run;
pub mod semaphore;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use paramrace::prelude::*;
/// ```
pub mod prelude {
    pub use crate::builder::EvaluatorBuilder;
    pub use crate::configuration::Configuration;
    pub use crate::decorator::{
        BoundedEvaluator, HistoryCachingEvaluator, ObserverFanoutEvaluator,
        PrePostCommandEvaluator, PrePostCommandOptions, TimingInvariantEvaluator,
    };
    pub use crate::evaluator::{
        evaluate_sync_via_async, EvaluationResult, EvaluatorError, RunObserver,
        TargetAlgorithmEvaluator,
    };
    pub use crate::history::{ReadOnlyRunHistory, RunHistory, ThreadSafeRunHistory};
    pub use crate::inprocess::{InProcessEvaluator, TargetAlgorithm};
    pub use crate::ipc::encoding::{CallStringEncoding, EncodingMechanism, JsonEncoding};
    pub use crate::ipc::{IpcEvaluator, IpcMechanism, IpcOptions};
    pub use crate::objective::{ObjectiveHelper, OverallObjective, RunObjective};
    pub use crate::race::{
        adaptive_cap_cutoff, compare_challenger_with_incumbent, ChallengeVerdict,
    };
    pub use crate::registry::EvaluatorRegistry;
    pub use crate::run::{
        ExecutionContext, InstanceSeedPair, KillHandler, ParameterConfiguration, ParameterSpace,
        ProblemInstance, RunConfiguration, RunResult, RunStatus,
    };
    pub use crate::semaphore::{FairMultiPermitSemaphore, ReducibleSemaphore};
}
