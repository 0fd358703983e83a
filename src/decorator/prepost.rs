//! Runs a shell command before the first evaluation and another at shutdown.
//!
//! Scenarios use these hooks to set up and tear down the environment the
//! target algorithm runs in (start a license server, mount a scratch
//! directory, ...). Both stdout and stderr of the command are drained
//! concurrently so a chatty command cannot deadlock on a full pipe buffer;
//! the call waits for both drain threads plus process exit.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::evaluator::{
    CompletionCallback, EvaluationResult, EvaluatorError, RunObserver, TargetAlgorithmEvaluator,
};
use crate::run::RunConfiguration;

/// Options of the [`PrePostCommandEvaluator`].
#[derive(Clone, Debug, Default)]
pub struct PrePostCommandOptions {
    pub pre_command: Option<String>,
    pub post_command: Option<String>,
    /// Working directory for both commands; inherited when unset.
    pub directory: Option<PathBuf>,
    /// Escalate a failing command to a fatal error instead of a warning.
    pub exception_on_error: bool,
    /// Log the command's stdout (stderr is always logged).
    pub log_output: bool,
}

impl PrePostCommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_command(mut self, command: impl Into<String>) -> Self {
        self.pre_command = Some(command.into());
        self
    }

    pub fn with_post_command(mut self, command: impl Into<String>) -> Self {
        self.post_command = Some(command.into());
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_exception_on_error(mut self, value: bool) -> Self {
        self.exception_on_error = value;
        self
    }

    pub fn with_log_output(mut self, value: bool) -> Self {
        self.log_output = value;
        self
    }
}

/// Decorator executing a pre command at construction and a post command at
/// shutdown.
pub struct PrePostCommandEvaluator {
    inner: Arc<dyn TargetAlgorithmEvaluator>,
    options: PrePostCommandOptions,
}

impl PrePostCommandEvaluator {
    /// Runs the pre command synchronously before returning the decorator.
    ///
    /// # Errors
    /// When the command cannot be started, or exits non-zero while
    /// `exception_on_error` is set.
    pub fn new(
        inner: Arc<dyn TargetAlgorithmEvaluator>,
        options: PrePostCommandOptions,
    ) -> Result<Self, EvaluatorError> {
        let tae = PrePostCommandEvaluator { inner, options };
        tae.run_command(tae.options.pre_command.as_deref())?;
        Ok(tae)
    }

    fn run_command(&self, command: Option<&str>) -> Result<(), EvaluatorError> {
        let command = match command {
            Some(c) if !c.trim().is_empty() => c,
            _ => return Ok(()),
        };

        info!(
            "running scenario command: cd {:?} ; {command}",
            self.options
                .directory
                .clone()
                .unwrap_or_else(|| PathBuf::from("."))
        );

        match self.spawn_and_drain(command) {
            Ok(0) => Ok(()),
            Ok(code) => {
                if self.options.exception_on_error {
                    Err(EvaluatorError::AlgorithmAbort(format!(
                        "scenario command '{command}' exited with code {code}"
                    )))
                } else {
                    warn!("got a non-zero return code from scenario command: {code}");
                    Ok(())
                }
            }
            Err(e) => Err(EvaluatorError::AlgorithmAbort(format!(
                "could not run scenario command '{command}': {e:#}"
            ))),
        }
    }

    /// Starts the command and blocks until both output drains finished and
    /// the process exited. Returns the exit code.
    fn spawn_and_drain(&self, command: &str) -> anyhow::Result<i32> {
        let mut tokens = command.split_whitespace();
        let program = tokens.next().context("empty command")?;

        let mut cmd = Command::new(program);
        cmd.args(tokens)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(directory) = &self.options.directory {
            cmd.current_dir(directory);
        }
        let mut child = cmd.spawn().context("could not start process")?;

        let stderr = child.stderr.take().context("no stderr pipe")?;
        let stderr_drain = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                warn!("[process] {line}");
            }
        });

        let stdout = child.stdout.take().context("no stdout pipe")?;
        let log_output = self.options.log_output;
        let stdout_drain = thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if log_output {
                    info!("[process] {line}");
                }
            }
        });

        // drains must finish before waiting, or a full pipe wedges the child
        stderr_drain.join().expect("stderr drain panicked");
        stdout_drain.join().expect("stdout drain panicked");
        let status = child.wait().context("could not wait for process")?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl TargetAlgorithmEvaluator for PrePostCommandEvaluator {
    fn evaluate_runs(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        self.inner.evaluate_runs(configs, observer)
    }

    fn evaluate_runs_async(
        &self,
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
    ) {
        self.inner.evaluate_runs_async(configs, callback, observer)
    }

    fn is_run_final(&self) -> bool {
        self.inner.is_run_final()
    }

    fn are_runs_persisted(&self) -> bool {
        self.inner.are_runs_persisted()
    }

    fn are_runs_observable(&self) -> bool {
        self.inner.are_runs_observable()
    }

    fn notify_shutdown(&self) {
        self.inner.notify_shutdown();
        if let Err(e) = self.run_command(self.options.post_command.as_deref()) {
            // notify_shutdown has no error channel; the taxonomy-specific
            // exit is the documented escalation path for post failures
            error!("post command failed: {e}");
            if self.options.exception_on_error {
                std::process::exit(e.exit_code());
            }
        }
    }
}

#[cfg(test)]
mod prepost_tests {
    use super::*;
    use crate::inprocess::InProcessEvaluator;
    use crate::run::{RunResult, RunStatus};

    fn base() -> Arc<dyn TargetAlgorithmEvaluator> {
        Arc::new(InProcessEvaluator::new(|config: &RunConfiguration| {
            RunResult::new(config.clone(), RunStatus::Sat, 1.0, 0.0, 0.0, 0, "", 1.0)
        }))
    }

    #[test]
    fn successful_pre_command() {
        let options = PrePostCommandOptions::new()
            .with_pre_command("true")
            .with_exception_on_error(true);
        assert!(PrePostCommandEvaluator::new(base(), options).is_ok());
    }

    #[test]
    fn failing_pre_command_warns_by_default() {
        let options = PrePostCommandOptions::new().with_pre_command("false");
        assert!(PrePostCommandEvaluator::new(base(), options).is_ok());
    }

    #[test]
    fn failing_pre_command_escalates_when_configured() {
        let options = PrePostCommandOptions::new()
            .with_pre_command("false")
            .with_exception_on_error(true);
        match PrePostCommandEvaluator::new(base(), options) {
            Err(EvaluatorError::AlgorithmAbort(msg)) => assert!(msg.contains("exited"), "{msg}"),
            other => panic!("expected AlgorithmAbort, got {:?}", other.err()),
        }
    }

    #[test]
    fn unstartable_command_is_always_fatal() {
        let options =
            PrePostCommandOptions::new().with_pre_command("definitely-not-a-real-binary-xyz");
        assert!(PrePostCommandEvaluator::new(base(), options).is_err());
    }

    #[test]
    fn post_command_runs_at_shutdown() {
        let dir = std::env::temp_dir();
        let marker = dir.join(format!("paramrace-post-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);

        let options = PrePostCommandOptions::new()
            .with_post_command(format!("touch {}", marker.display()))
            .with_directory(&dir);
        let tae = PrePostCommandEvaluator::new(base(), options).unwrap();
        tae.notify_shutdown();

        assert!(marker.exists());
        let _ = std::fs::remove_file(&marker);
    }
}
