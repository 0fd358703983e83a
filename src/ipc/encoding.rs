//! Wire encodings, independent of the transport that moves the bytes.
//!
//! An [`EncodingMechanism`] turns a [`RunConfiguration`] into request bytes
//! and a response byte stream back into a [`RunResult`]. The transports only
//! shuttle bytes; the elapsed wall-clock time of the exchange is handed to
//! `decode` so encodings without explicit timing can fall back to it.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::evaluator::EvaluatorError;
use crate::ipc::response;
use crate::run::{RunConfiguration, RunResult, RunStatus};

/// Pluggable wire format.
pub trait EncodingMechanism: Send + Sync {
    /// Request bytes for one run.
    fn encode(&self, config: &RunConfiguration) -> Result<Vec<u8>, EvaluatorError>;

    /// Reads and parses one response. `started` was taken just before the
    /// request bytes went out and provides the wall-clock turnaround.
    fn decode(
        &self,
        config: &RunConfiguration,
        reader: &mut dyn BufRead,
        started: Instant,
    ) -> Result<RunResult, EvaluatorError>;
}

impl<T: EncodingMechanism + ?Sized> EncodingMechanism for std::sync::Arc<T> {
    fn encode(&self, config: &RunConfiguration) -> Result<Vec<u8>, EvaluatorError> {
        (**self).encode(config)
    }

    fn decode(
        &self,
        config: &RunConfiguration,
        reader: &mut dyn BufRead,
        started: Instant,
    ) -> Result<RunResult, EvaluatorError> {
        (**self).decode(config, reader, started)
    }
}

/// The classic call-string protocol: one space-joined request line
/// `<instance> <instance-info> <cutoff> <i32::MAX> <seed> (-name 'value')*`,
/// answered by a single result line (see [`response`]).
#[derive(Debug, Default)]
pub struct CallStringEncoding;

impl CallStringEncoding {
    pub fn new() -> Self {
        CallStringEncoding
    }
}

impl EncodingMechanism for CallStringEncoding {
    fn encode(&self, config: &RunConfiguration) -> Result<Vec<u8>, EvaluatorError> {
        let pisp = config.instance_seed_pair();
        let mut tokens: Vec<String> = vec![
            pisp.instance().name().to_string(),
            pisp.instance().instance_specific_information().to_string(),
            config.cutoff_time().to_string(),
            i32::MAX.to_string(),
            pisp.seed().to_string(),
        ];
        for (name, value) in config.parameter_configuration().values() {
            tokens.push(format!("-{name}"));
            tokens.push(format!("'{value}'"));
        }

        let mut line = String::new();
        for token in tokens {
            if token.chars().any(char::is_whitespace) {
                line.push('"');
                line.push_str(&token);
                line.push('"');
            } else {
                line.push_str(&token);
            }
            line.push(' ');
        }
        line.push('\n');
        Ok(line.into_bytes())
    }

    fn decode(
        &self,
        config: &RunConfiguration,
        reader: &mut dyn BufRead,
        started: Instant,
    ) -> Result<RunResult, EvaluatorError> {
        // wrappers may chatter before announcing the result; skip until the
        // result line, fail if the stream ends without one
        for line in reader.lines() {
            let line = line.map_err(|e| EvaluatorError::Transient(format!("read failed: {e}")))?;
            if response::is_result_line(&line) {
                return response::parse_result_line(&line, config, started.elapsed().as_secs_f64());
            }
            trace!("ignoring non-result line: {line}");
        }
        Err(EvaluatorError::ProtocolViolation(
            "response stream ended without a result line".to_string(),
        ))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct WireRunConfiguration {
    instance: String,
    instance_info: String,
    seed: i64,
    cutoff_time: f64,
    space: String,
    max_cutoff_time: f64,
    params: BTreeMap<String, String>,
}

impl WireRunConfiguration {
    fn from_config(config: &RunConfiguration) -> Self {
        let pisp = config.instance_seed_pair();
        WireRunConfiguration {
            instance: pisp.instance().name().to_string(),
            instance_info: pisp.instance().instance_specific_information().to_string(),
            seed: pisp.seed(),
            cutoff_time: config.cutoff_time(),
            space: config.parameter_configuration().space().name().to_string(),
            max_cutoff_time: config.execution_context().max_cutoff_time(),
            params: config.parameter_configuration().values().clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRunResult {
    config: WireRunConfiguration,
    status: String,
    runtime: f64,
    run_length: f64,
    quality: f64,
    result_seed: i64,
    #[serde(default)]
    additional_data: String,
}

/// Object-graph encoding: the run configuration is serialized wholesale as
/// one line of JSON, and the response echoes it back alongside the outcome.
///
/// Decode verifies the echoed configuration matches the request and fails
/// fatally on mismatch, which protects against transport cross-talk.
#[derive(Debug, Default)]
pub struct JsonEncoding;

impl JsonEncoding {
    pub fn new() -> Self {
        JsonEncoding
    }
}

impl EncodingMechanism for JsonEncoding {
    fn encode(&self, config: &RunConfiguration) -> Result<Vec<u8>, EvaluatorError> {
        let mut bytes = serde_json::to_vec(&WireRunConfiguration::from_config(config))
            .map_err(|e| EvaluatorError::ProtocolViolation(format!("encode failed: {e}")))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode(
        &self,
        config: &RunConfiguration,
        reader: &mut dyn BufRead,
        started: Instant,
    ) -> Result<RunResult, EvaluatorError> {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| EvaluatorError::Transient(format!("read failed: {e}")))?;
        if line.trim().is_empty() {
            return Err(EvaluatorError::ProtocolViolation(
                "response stream ended without a result object".to_string(),
            ));
        }

        let wire: WireRunResult = serde_json::from_str(&line).map_err(|e| {
            EvaluatorError::ProtocolViolation(format!("unparseable result object: {e}"))
        })?;

        if wire.config != WireRunConfiguration::from_config(config) {
            return Err(EvaluatorError::ProtocolViolation(format!(
                "response for {}#{} does not match request {}",
                wire.config.instance, wire.config.seed, config
            )));
        }

        let status = RunStatus::from_wrapper_key(&wire.status)
            .filter(|s| s.permitted_by_wrappers())
            .ok_or_else(|| {
                EvaluatorError::ProtocolViolation(format!(
                    "status '{}' is not one of {:?}",
                    wire.status,
                    RunStatus::wrapper_aliases()
                ))
            })?;

        Ok(RunResult::new(
            config.clone(),
            status,
            wire.runtime,
            wire.run_length,
            wire.quality,
            wire.result_seed,
            wire.additional_data,
            started.elapsed().as_secs_f64(),
        ))
    }
}
