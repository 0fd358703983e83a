//! The target algorithm evaluator (TAE) contract.
//!
//! Every evaluator (a real transport, the in-process runner, or any decorator
//! wrapping one) implements [`TargetAlgorithmEvaluator`]. The contract is
//! asynchronous at heart: a batch of run configurations goes in, exactly one
//! terminal callback comes back with a result list in input order, and an
//! optional [`RunObserver`] sees best-known partial snapshots strictly before
//! the terminal callback.

use std::sync::mpsc;
use std::sync::Arc;

use thiserror::Error;

use crate::run::{RunConfiguration, RunResult};

/// Failure taxonomy of the engine. Callers pattern-match on the kind instead
/// of catching exception classes.
#[derive(Clone, Debug, Error)]
pub enum EvaluatorError {
    /// A transport hiccup (connection refused, interrupted read). Retried
    /// internally with backoff; surfaces only from components that cannot
    /// retry.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The wire protocol was violated: malformed response line, oversized UDP
    /// payload, or a mismatched run identity in object-graph mode. Fatal for
    /// the evaluator.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The target algorithm reported ABORT: the experiment setup itself is
    /// broken and the whole batch must stop.
    #[error("target algorithm abort: {0}")]
    AlgorithmAbort(String),

    /// The evaluator was shut down; no further batches are accepted.
    #[error("evaluator has been shut down")]
    Shutdown,

    /// An identical run already exists; carries the pre-existing result so
    /// the caller can use it instead of re-running.
    #[error("duplicate run for {}", existing.config())]
    DuplicateRun { existing: Box<RunResult> },
}

impl EvaluatorError {
    /// Process exit code for unrecoverable failures, one per kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            EvaluatorError::Transient(_) => 64,
            EvaluatorError::ProtocolViolation(_) => 65,
            EvaluatorError::AlgorithmAbort(_) => 66,
            EvaluatorError::Shutdown => 67,
            EvaluatorError::DuplicateRun { .. } => 68,
        }
    }
}

/// Outcome of one batch evaluation.
pub type EvaluationResult = Result<Vec<RunResult>, EvaluatorError>;

/// The single terminal callback of an asynchronous evaluation.
pub type CompletionCallback = Box<dyn FnOnce(EvaluationResult) + Send + 'static>;

/// Receives best-known partial snapshots of a batch while it is in flight.
///
/// Snapshots always cover the full batch in input order, with `RUNNING`
/// placeholders for outstanding runs. Implementations must tolerate repeated
/// and reordered notifications for the same configuration.
pub trait RunObserver: Send + Sync {
    fn current_status(&self, runs: &[RunResult]);
}

/// The synchronous/asynchronous execution contract.
pub trait TargetAlgorithmEvaluator: Send + Sync {
    /// Evaluates a batch, blocking until every configuration has a result.
    /// The returned list preserves the input order.
    fn evaluate_runs(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult;

    /// Evaluates a batch without blocking the caller.
    ///
    /// `callback` is invoked exactly once: with `Ok(results)` (same length and
    /// order as `configs`) after all runs complete, or with `Err(_)` if an
    /// unrecoverable error stops the batch. Observer notifications all happen
    /// strictly before the terminal callback.
    fn evaluate_runs_async(
        &self,
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
    );

    /// Whether a result from this evaluator is the definitive outcome of the
    /// run, as opposed to an estimate that may later be refined.
    fn is_run_final(&self) -> bool;

    /// Whether runs survive this process (a caching layer may skip re-running
    /// them).
    fn are_runs_persisted(&self) -> bool;

    /// Whether this evaluator produces meaningful partial observer updates.
    fn are_runs_observable(&self) -> bool;

    /// Shuts the evaluator down. Idempotent; afterwards every `evaluate_*`
    /// call fails with [`EvaluatorError::Shutdown`], but callbacks already
    /// queued still fire.
    fn notify_shutdown(&self);
}

/// Implements the blocking call on top of [`evaluate_runs_async`]
/// (`TargetAlgorithmEvaluator::evaluate_runs_async`) with a channel
/// rendezvous. Decorators whose logic lives in the async path use this for
/// their sync path.
pub fn evaluate_sync_via_async(
    tae: &dyn TargetAlgorithmEvaluator,
    configs: Vec<RunConfiguration>,
    observer: Option<Arc<dyn RunObserver>>,
) -> EvaluationResult {
    let (tx, rx) = mpsc::channel();
    tae.evaluate_runs_async(
        configs,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        observer,
    );
    // a dropped callback without a send means the evaluator died mid-flight
    rx.recv().unwrap_or(Err(EvaluatorError::Shutdown))
}

#[cfg(test)]
mod contract_tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_non_zero() {
        let errors = [
            EvaluatorError::Transient("x".into()),
            EvaluatorError::ProtocolViolation("x".into()),
            EvaluatorError::AlgorithmAbort("x".into()),
            EvaluatorError::Shutdown,
        ];
        let mut codes: Vec<i32> = errors.iter().map(EvaluatorError::exit_code).collect();
        codes.push(68); // DuplicateRun, constructed in history tests
        let unique: std::collections::HashSet<i32> = codes.iter().copied().collect();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|&c| c != 0));
    }
}
