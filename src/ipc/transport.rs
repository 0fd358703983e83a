//! The transports that move encoded requests to the target-algorithm side:
//! plain TCP, UDP datagrams, and reverse TCP over a caller-supplied stream
//! pair.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::evaluator::EvaluatorError;
use crate::ipc::encoding::EncodingMechanism;
use crate::run::{RunConfiguration, RunResult};

/// Connect, send one request, read one response, close.
///
/// Connection failures are transient by definition: they are retried forever
/// with a fixed backoff and never surface to the caller. Protocol violations
/// and abort signals pass straight through.
pub struct TcpTransport<E: EncodingMechanism> {
    host: String,
    port: u16,
    encoding: E,
    retry_backoff: Duration,
}

impl<E: EncodingMechanism> TcpTransport<E> {
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

    pub fn new(host: impl Into<String>, port: u16, encoding: E) -> Self {
        TcpTransport {
            host: host.into(),
            port,
            encoding,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Overrides the fixed retry delay (tests use a short one).
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn evaluate_run(&self, config: &RunConfiguration) -> Result<RunResult, EvaluatorError> {
        loop {
            match self.try_once(config) {
                Err(EvaluatorError::Transient(msg)) => {
                    error!(
                        "error talking to {}:{} ({msg}), trying again in {:?}",
                        self.host, self.port, self.retry_backoff
                    );
                    thread::sleep(self.retry_backoff);
                }
                other => return other,
            }
        }
    }

    fn try_once(&self, config: &RunConfiguration) -> Result<RunResult, EvaluatorError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| EvaluatorError::Transient(format!("connect failed: {e}")))?;
        stream.set_nodelay(true).ok();

        let bytes = self.encoding.encode(config)?;
        let started = Instant::now();
        let mut writer = &stream;
        writer
            .write_all(&bytes)
            .and_then(|()| writer.flush())
            .map_err(|e| EvaluatorError::Transient(format!("send failed: {e}")))?;

        let mut reader = BufReader::new(&stream);
        self.encoding.decode(config, &mut reader, started)
    }
}

/// One datagram out, one datagram back.
///
/// UDP has no recovery story: an oversized payload or a socket error is fatal
/// for the evaluator, not retried.
pub struct UdpTransport<E: EncodingMechanism> {
    host: String,
    port: u16,
    packet_size: usize,
    encoding: E,
}

impl<E: EncodingMechanism> UdpTransport<E> {
    pub fn new(host: impl Into<String>, port: u16, packet_size: usize, encoding: E) -> Self {
        UdpTransport {
            host: host.into(),
            port,
            packet_size,
            encoding,
        }
    }

    pub fn evaluate_run(&self, config: &RunConfiguration) -> Result<RunResult, EvaluatorError> {
        let bytes = self.encoding.encode(config)?;
        if bytes.len() > self.packet_size {
            return Err(EvaluatorError::ProtocolViolation(format!(
                "request of {} bytes exceeds the configured packet size {}, adjust it on both sides",
                bytes.len(),
                self.packet_size
            )));
        }

        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| EvaluatorError::ProtocolViolation(format!("socket failed: {e}")))?;
        socket
            .connect((self.host.as_str(), self.port))
            .map_err(|e| EvaluatorError::ProtocolViolation(format!("connect failed: {e}")))?;

        let started = Instant::now();
        socket
            .send(&bytes)
            .map_err(|e| EvaluatorError::ProtocolViolation(format!("send failed: {e}")))?;

        let mut buf = vec![0u8; self.packet_size];
        let n = socket
            .recv(&mut buf)
            .map_err(|e| EvaluatorError::ProtocolViolation(format!("receive failed: {e}")))?;

        let mut reader = BufReader::new(&buf[..n]);
        self.encoding.decode(config, &mut reader, started)
    }
}

/// The encoding over an externally supplied stream pair. The caller owns the
/// streams; this transport manages no socket lifecycle at all.
pub struct ReverseTcpTransport<E: EncodingMechanism> {
    encoding: E,
}

impl<E: EncodingMechanism> ReverseTcpTransport<E> {
    pub fn new(encoding: E) -> Self {
        ReverseTcpTransport { encoding }
    }

    pub fn evaluate_run(
        &self,
        reader: &mut dyn BufRead,
        writer: &mut dyn Write,
        config: &RunConfiguration,
    ) -> Result<RunResult, EvaluatorError> {
        let bytes = self.encoding.encode(config)?;
        let started = Instant::now();
        writer
            .write_all(&bytes)
            .and_then(|()| writer.flush())
            .map_err(|e| EvaluatorError::Transient(format!("send failed: {e}")))?;
        let result = self.encoding.decode(config, reader, started);
        if let Err(EvaluatorError::Transient(msg)) = &result {
            warn!("reverse-TCP exchange failed ({msg}), the connection will be dropped");
        }
        result
    }
}
