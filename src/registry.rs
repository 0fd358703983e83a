//! Explicit evaluator registry: a name → constructor map populated at
//! startup, replacing any notion of reflective plugin discovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tracing::warn;

use crate::evaluator::TargetAlgorithmEvaluator;

/// Builds a ready-to-use evaluator. Options are captured in the closure at
/// registration time.
pub type EvaluatorFactory =
    Box<dyn Fn() -> anyhow::Result<Arc<dyn TargetAlgorithmEvaluator>> + Send + Sync>;

/// Maps evaluator names to their constructors.
#[derive(Default)]
pub struct EvaluatorRegistry {
    factories: Mutex<HashMap<String, EvaluatorFactory>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, replacing (with a warning) any
    /// previous registration.
    pub fn register(&self, name: impl Into<String>, factory: EvaluatorFactory) {
        let name = name.into();
        let mut factories = self.factories.lock().expect("poisoned");
        if factories.insert(name.clone(), factory).is_some() {
            warn!("evaluator '{name}' registered twice, keeping the newer factory");
        }
    }

    /// Constructs the evaluator registered under `name`.
    ///
    /// # Errors
    /// When no factory is registered under that name, or the factory itself
    /// fails.
    pub fn create(&self, name: &str) -> anyhow::Result<Arc<dyn TargetAlgorithmEvaluator>> {
        let factories = self.factories.lock().expect("poisoned");
        match factories.get(name) {
            Some(factory) => factory(),
            None => {
                let mut known: Vec<String> = factories.keys().cloned().collect();
                known.sort();
                bail!("no evaluator registered under '{name}' (known: {known:?})")
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .lock()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
