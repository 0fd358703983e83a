//! Assembles the standard decorator chain around a base evaluator.
//!
//! The stack, outermost first: pre/post command hooks, caching against the
//! run history, timing-invariant correction, observer fan-out, resource
//! bounding, and finally the base transport. Every layer implements the same
//! contract, so callers only ever see one `Arc<dyn TargetAlgorithmEvaluator>`.

use std::sync::Arc;

use tracing::Level;

use crate::configuration::Configuration;
use crate::decorator::{
    BoundedEvaluator, HistoryCachingEvaluator, ObserverFanoutEvaluator, PrePostCommandEvaluator,
    PrePostCommandOptions, TimingInvariantEvaluator,
};
use crate::evaluator::{EvaluatorError, RunObserver, TargetAlgorithmEvaluator};
use crate::history::ThreadSafeRunHistory;
use crate::logger::init_logger;

/// Builds the decorated evaluator stack for one configuration session.
pub struct EvaluatorBuilder {
    configuration: Configuration,
    history: Option<Arc<ThreadSafeRunHistory>>,
    prepost: Option<PrePostCommandOptions>,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl EvaluatorBuilder {
    pub fn new(configuration: Configuration) -> Self {
        EvaluatorBuilder {
            configuration,
            history: None,
            prepost: None,
            observers: Vec::new(),
        }
    }

    /// Enables caching against (a read-only view of) this history.
    pub fn with_history(mut self, history: Arc<ThreadSafeRunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Adds pre/post command hooks; the pre command runs during `build`.
    pub fn with_prepost(mut self, options: PrePostCommandOptions) -> Self {
        self.prepost = Some(options);
        self
    }

    /// Registers an observer that sees every batch of the session.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Wraps `base` into the full chain.
    ///
    /// # Errors
    /// When the configured pre command cannot be run (see
    /// [`PrePostCommandEvaluator::new`]).
    pub fn build(
        self,
        base: Arc<dyn TargetAlgorithmEvaluator>,
    ) -> Result<Arc<dyn TargetAlgorithmEvaluator>, EvaluatorError> {
        if self.configuration.log {
            init_logger(Level::TRACE);
        }

        let mut tae: Arc<dyn TargetAlgorithmEvaluator> = Arc::new(BoundedEvaluator::new(
            base,
            self.configuration.concurrent_runs,
        ));

        let fanout = ObserverFanoutEvaluator::new(tae);
        for observer in self.observers {
            fanout.register_observer(observer);
        }
        tae = Arc::new(fanout);

        tae = Arc::new(TimingInvariantEvaluator::new(tae));

        if self.configuration.cache_runs {
            if let Some(history) = &self.history {
                tae = Arc::new(HistoryCachingEvaluator::new(tae, history.read_only()));
            }
        }

        if let Some(options) = self.prepost {
            tae = Arc::new(PrePostCommandEvaluator::new(tae, options)?);
        }

        Ok(tae)
    }
}
