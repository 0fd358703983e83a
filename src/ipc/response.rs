//! Response-line grammar shared by the line-oriented wire encodings.
//!
//! A wrapper reports one line of the form
//! `Result for <anything>: <status>, <runtime>, <runlength>, <quality>, <seed>[, <additional data>]`
//! (an optional leading `Final`, and `of` instead of `for`, are accepted for
//! historical reasons).

use tracing::warn;

use crate::evaluator::EvaluatorError;
use crate::run::{RunConfiguration, RunResult, RunStatus};

/// True if `line` starts with a recognized result announcement. The matching
/// prefix ends at the first `:`.
pub fn is_result_line(line: &str) -> bool {
    let head = match line.split_once(':') {
        Some((head, _)) => head,
        None => return false,
    };
    let mut tokens = head.split_whitespace();
    let first = match tokens.next() {
        Some(t) => t.to_ascii_lowercase(),
        None => return false,
    };
    let second = if first == "final" {
        match tokens.next() {
            Some(t) => t.to_ascii_lowercase(),
            None => return false,
        }
    } else {
        first
    };
    if second != "result" {
        return false;
    }
    matches!(
        tokens.next().map(|t| t.to_ascii_lowercase()).as_deref(),
        Some("for") | Some("of")
    )
}

/// Parses a result line into a [`RunResult`] for the given request.
///
/// Unlike older engines that counted an unparseable line as CRASHED, a
/// malformed response here is a fatal [`EvaluatorError::ProtocolViolation`]:
/// the wrapper, not the run, is broken.
pub fn parse_result_line(
    line: &str,
    config: &RunConfiguration,
    walltime: f64,
) -> Result<RunResult, EvaluatorError> {
    let body = match line.split_once(':') {
        Some((_, body)) if is_result_line(line) => body.trim(),
        _ => {
            return Err(EvaluatorError::ProtocolViolation(format!(
                "not a result line: '{}'",
                line.trim()
            )))
        }
    };

    let fields: Vec<&str> = body.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return Err(EvaluatorError::ProtocolViolation(format!(
            "expected <status>, <runtime>, <runlength>, <quality>, <seed> but got {} field(s) in '{}'",
            fields.len(),
            line.trim()
        )));
    }
    if fields.len() > 6 {
        // additional run data must not contain commas; keep the first chunk
        warn!(
            "too many fields ({}) in result line, additional run data cannot contain commas: '{}'",
            fields.len(),
            line.trim()
        );
    }

    let status = RunStatus::from_wrapper_key(fields[0])
        .filter(|s| s.permitted_by_wrappers())
        .ok_or_else(|| {
            EvaluatorError::ProtocolViolation(format!(
                "status '{}' is not one of {:?}",
                fields[0],
                RunStatus::wrapper_aliases()
            ))
        })?;

    let runtime = parse_f64(fields[1], "runtime", line)?;
    let run_length = parse_f64(fields[2], "runlength", line)?;
    let quality = parse_f64(fields[3], "quality", line)?;
    let result_seed: i64 = fields[4].parse().map_err(|_| {
        EvaluatorError::ProtocolViolation(format!(
            "seed '{}' is not an integer in '{}'",
            fields[4],
            line.trim()
        ))
    })?;
    let additional_data = fields.get(5).copied().unwrap_or("");

    Ok(RunResult::new(
        config.clone(),
        status,
        runtime,
        run_length,
        quality,
        result_seed,
        additional_data,
        walltime,
    ))
}

fn parse_f64(field: &str, name: &str, line: &str) -> Result<f64, EvaluatorError> {
    field.parse().map_err(|_| {
        EvaluatorError::ProtocolViolation(format!(
            "{name} '{field}' is not a number in '{}'",
            line.trim()
        ))
    })
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use crate::run::{
        ExecutionContext, InstanceSeedPair, ParameterConfiguration, ParameterSpace,
        ProblemInstance,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn config() -> RunConfiguration {
        let space = Arc::new(ParameterSpace::new("s"));
        let ctx = Arc::new(ExecutionContext::new(Arc::clone(&space), 100.0));
        let pisp = InstanceSeedPair::new(Arc::new(ProblemInstance::new("i1")), 7);
        let pc = ParameterConfiguration::new(space, BTreeMap::new());
        RunConfiguration::new(pisp, 10.0, pc, ctx).unwrap()
    }

    #[test]
    fn recognizes_result_prefixes() {
        assert!(is_result_line("Result for tuner: SAT, 1, 2, 3, 4"));
        assert!(is_result_line("Final Result for tuner: SAT, 1, 2, 3, 4"));
        assert!(is_result_line("result of this wrapper: SAT, 1, 2, 3, 4"));
        assert!(!is_result_line("solving instance i1..."));
        assert!(!is_result_line("Result without colon"));
    }

    #[test]
    fn parses_all_fields() {
        let run =
            parse_result_line("Result for tuner: SAT, 1.5, 42, 0.25, 7, extra info", &config(), 2.0)
                .unwrap();
        assert_eq!(run.status(), RunStatus::Sat);
        assert_eq!(run.runtime(), 1.5);
        assert_eq!(run.run_length(), 42.0);
        assert_eq!(run.quality(), 0.25);
        assert_eq!(run.result_seed(), 7);
        assert_eq!(run.additional_data(), "extra info");
        assert_eq!(run.wallclock_time(), 2.0);
    }

    #[test]
    fn malformed_lines_are_protocol_violations() {
        for line in [
            "Result for tuner: SAT, not-a-number, 2, 3, 4",
            "Result for tuner: SAT, 1, 2, 3",
            "Result for tuner: RUNNING, 1, 2, 3, 4", // internal status not permitted
            "garbage",
        ] {
            match parse_result_line(line, &config(), 0.0) {
                Err(EvaluatorError::ProtocolViolation(_)) => {}
                other => panic!("expected ProtocolViolation for '{line}', got {other:?}"),
            }
        }
    }
}
