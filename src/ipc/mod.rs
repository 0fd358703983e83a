//! IPC-based target algorithm evaluator.
//!
//! Another process answers our run requests. The wire format is pluggable
//! through [`encoding::EncodingMechanism`]; the bytes travel over one of
//! three transports (TCP, UDP, reverse TCP), see [`transport`].

pub mod encoding;
pub mod response;
pub mod transport;

use std::io::{BufReader, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument};

use crate::evaluator::{
    CompletionCallback, EvaluationResult, EvaluatorError, RunObserver, TargetAlgorithmEvaluator,
};
use crate::ipc::encoding::EncodingMechanism;
use crate::ipc::transport::{ReverseTcpTransport, TcpTransport, UdpTransport};
use crate::run::{KillHandler, RunConfiguration, RunResult, RunStatus};

/// How to reach the answering process.
pub enum IpcMechanism {
    /// Connect out to a server for every run.
    Tcp { host: String, port: u16 },
    /// Single datagram exchange per run.
    Udp {
        host: String,
        port: u16,
        packet_size: usize,
    },
    /// The answering process connects to us; every accepted connection
    /// serves one batch.
    ReverseTcp { listener: TcpListener },
}

/// Options of the [`IpcEvaluator`].
pub struct IpcOptions {
    pub mechanism: IpcMechanism,
    pub encoding: Arc<dyn EncodingMechanism>,
    /// Whether the answering side persists results across sessions (lets a
    /// caching layer trust old runs).
    pub persistent: bool,
}

struct IpcInner {
    options: IpcOptions,
    shutdown: AtomicBool,
}

/// Evaluator that dispatches every run to an external process over IPC.
///
/// Runs of one batch are executed in order, one at a time; concurrency comes
/// from issuing multiple batches, which the resource-bounding decorator keeps
/// within the permitted limit.
pub struct IpcEvaluator {
    inner: Arc<IpcInner>,
}

impl IpcEvaluator {
    pub fn new(options: IpcOptions) -> Self {
        match &options.mechanism {
            IpcMechanism::Tcp { host, port } => {
                info!("IPC evaluator making TCP connections to {host}:{port}");
            }
            IpcMechanism::Udp { host, port, .. } => {
                info!("IPC evaluator making UDP connections to {host}:{port}");
            }
            IpcMechanism::ReverseTcp { listener } => {
                // the accept loop polls, so it must not block forever
                listener
                    .set_nonblocking(true)
                    .expect("could not set listener non-blocking");
                if let Ok(addr) = listener.local_addr() {
                    info!("IPC evaluator listening on port {}", addr.port());
                }
            }
        }
        IpcEvaluator {
            inner: Arc::new(IpcInner {
                options,
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

impl IpcInner {
    #[instrument(skip_all, fields(batch = configs.len()))]
    fn run_batch(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(EvaluatorError::Shutdown);
        }
        if configs.is_empty() {
            return Ok(vec![]);
        }

        match &self.options.mechanism {
            IpcMechanism::Tcp { host, port } => {
                let transport =
                    TcpTransport::new(host.clone(), *port, Arc::clone(&self.options.encoding));
                self.run_sequentially(configs, observer, |rc| transport.evaluate_run(rc))
            }
            IpcMechanism::Udp {
                host,
                port,
                packet_size,
            } => {
                let transport = UdpTransport::new(
                    host.clone(),
                    *port,
                    *packet_size,
                    Arc::clone(&self.options.encoding),
                );
                self.run_sequentially(configs, observer, |rc| transport.evaluate_run(rc))
            }
            IpcMechanism::ReverseTcp { listener } => {
                self.run_reverse_tcp(listener, configs, observer)
            }
        }
    }

    /// Drives one batch through a per-run transport call, publishing a
    /// snapshot after each completion.
    fn run_sequentially(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
        evaluate: impl Fn(&RunConfiguration) -> Result<RunResult, EvaluatorError>,
    ) -> EvaluationResult {
        let mut snapshot = running_placeholders(&configs);
        for (i, config) in configs.iter().enumerate() {
            let run = evaluate(config)?;
            check_abort(&run)?;
            snapshot[i] = run;
            if let Some(observer) = &observer {
                observer.current_status(&snapshot);
            }
        }
        Ok(snapshot)
    }

    /// Serves the whole batch over one accepted connection; a broken
    /// connection restarts the batch on a fresh one with an escalating delay.
    fn run_reverse_tcp(
        &self,
        listener: &TcpListener,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        let transport = ReverseTcpTransport::new(Arc::clone(&self.options.encoding));
        let mut delay_secs = 1u64;
        loop {
            let stream = self.accept_connection(listener)?;
            stream.set_nodelay(true).ok();

            let attempt = (|| -> Result<Vec<RunResult>, EvaluatorError> {
                let mut reader = BufReader::new(stream.try_clone().map_err(|e| {
                    EvaluatorError::Transient(format!("could not clone stream: {e}"))
                })?);
                let mut writer = &stream;

                let mut snapshot = running_placeholders(&configs);
                for (i, config) in configs.iter().enumerate() {
                    let run = transport.evaluate_run(&mut reader, &mut writer as &mut dyn Write, config)?;
                    check_abort(&run)?;
                    snapshot[i] = run;
                    if let Some(observer) = &observer {
                        observer.current_status(&snapshot);
                    }
                }
                Ok(snapshot)
            })();

            match attempt {
                Err(EvaluatorError::Transient(msg)) => {
                    error!("IPC batch failed ({msg}), trying again in {delay_secs}s");
                    thread::sleep(Duration::from_secs(delay_secs));
                    delay_secs = (delay_secs + 1).min(10);
                }
                other => return other,
            }
        }
    }

    /// Polls the non-blocking listener until a client connects or the
    /// evaluator shuts down.
    fn accept_connection(
        &self,
        listener: &TcpListener,
    ) -> Result<std::net::TcpStream, EvaluatorError> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(EvaluatorError::Shutdown);
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {addr}");
                    return Ok(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(EvaluatorError::ProtocolViolation(format!(
                        "listener failed: {e}"
                    )))
                }
            }
        }
    }
}

fn running_placeholders(configs: &[RunConfiguration]) -> Vec<RunResult> {
    configs
        .iter()
        .map(|rc| RunResult::running(rc.clone(), 0.0, Arc::new(KillHandler::new())))
        .collect()
}

fn check_abort(run: &RunResult) -> Result<(), EvaluatorError> {
    if run.status() == RunStatus::Abort {
        // misconfiguration signalled by the target algorithm, not transient
        return Err(EvaluatorError::AlgorithmAbort(format!(
            "target algorithm aborted on {}",
            run.config()
        )));
    }
    Ok(())
}

impl TargetAlgorithmEvaluator for IpcEvaluator {
    fn evaluate_runs(
        &self,
        configs: Vec<RunConfiguration>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> EvaluationResult {
        self.inner.run_batch(configs, observer)
    }

    fn evaluate_runs_async(
        &self,
        configs: Vec<RunConfiguration>,
        callback: CompletionCallback,
        observer: Option<Arc<dyn RunObserver>>,
    ) {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            callback(Err(EvaluatorError::Shutdown));
            return;
        }
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            let result = inner.run_batch(configs, observer);
            callback(result);
        });
    }

    fn is_run_final(&self) -> bool {
        false
    }

    fn are_runs_persisted(&self) -> bool {
        self.inner.options.persistent
    }

    fn are_runs_observable(&self) -> bool {
        true
    }

    fn notify_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod ipc_tests {
    use super::*;
    use crate::ipc::encoding::CallStringEncoding;
    use crate::run::{
        ExecutionContext, InstanceSeedPair, ParameterConfiguration, ParameterSpace,
        ProblemInstance,
    };
    use std::collections::BTreeMap;
    use std::io::BufRead;
    use std::net::TcpStream;

    fn configs(n: usize) -> Vec<RunConfiguration> {
        let space = Arc::new(ParameterSpace::new("s"));
        let ctx = Arc::new(ExecutionContext::new(Arc::clone(&space), 100.0));
        (0..n)
            .map(|i| {
                let pisp =
                    InstanceSeedPair::new(Arc::new(ProblemInstance::new(format!("i{i}"))), i as i64);
                let pc = ParameterConfiguration::new(Arc::clone(&space), BTreeMap::new());
                RunConfiguration::new(pisp, 10.0, pc, Arc::clone(&ctx)).unwrap()
            })
            .collect()
    }

    #[test]
    fn reverse_tcp_serves_a_whole_batch_per_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let tae = IpcEvaluator::new(IpcOptions {
            mechanism: IpcMechanism::ReverseTcp { listener },
            encoding: Arc::new(CallStringEncoding::new()),
            persistent: false,
        });

        // the "target algorithm" process dials in and answers three requests
        let client = thread::spawn(move || {
            let stream = loop {
                match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(s) => break s,
                    Err(_) => thread::sleep(Duration::from_millis(10)),
                }
            };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for _ in 0..3 {
                let mut request = String::new();
                reader.read_line(&mut request).unwrap();
                let seed: i64 = request.split_whitespace().nth(4).unwrap().parse().unwrap();
                writer
                    .write_all(format!("Result for tuner: SAT, {}.5, 0, 0, {seed}\n", seed).as_bytes())
                    .unwrap();
            }
        });

        let results = tae.evaluate_runs(configs(3), None).unwrap();
        client.join().unwrap();

        assert_eq!(results.len(), 3);
        for (i, run) in results.iter().enumerate() {
            assert_eq!(run.status(), RunStatus::Sat);
            assert_eq!(run.runtime(), i as f64 + 0.5);
            assert_eq!(run.result_seed(), i as i64);
        }
    }

    #[test]
    fn shutdown_unblocks_reverse_tcp_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let tae = Arc::new(IpcEvaluator::new(IpcOptions {
            mechanism: IpcMechanism::ReverseTcp { listener },
            encoding: Arc::new(CallStringEncoding::new()),
            persistent: false,
        }));

        let tae2 = Arc::clone(&tae);
        let handle = thread::spawn(move || tae2.evaluate_runs(configs(1), None));
        thread::sleep(Duration::from_millis(50));
        tae.notify_shutdown();

        match handle.join().unwrap() {
            Err(EvaluatorError::Shutdown) => {}
            other => panic!("expected Shutdown, got {other:?}"),
        }
    }
}
