//! Slow consumers: raw sockets that drain `HGETALL large-hash` at a throttled
//! byte rate so the store has to buffer the reply.
//!
//! This path deliberately bypasses the pooled client. It writes one literal
//! command line and reads fixed-size chunks, sleeping between reads. The only
//! protocol awareness is [`ReplyScanner`], which tracks RESP framing as bytes
//! go by so a worker knows when the single reply has been fully drained; the
//! store keeps the socket open after replying, so EOF alone never arrives.

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::PressureError;

/// The one command slow consumers send, byte for byte.
pub const HGETALL_COMMAND: &[u8] = b"HGETALL large-hash\r\n";

/// Longest RESP header line accepted by the scanner.
const MAX_HEADER_LEN: usize = 64;

/// Receive chunk size for slow worker `index` of `workers`, interpolated
/// linearly between `min` and `max` so concurrent readers apply different
/// backpressure.
pub fn chunk_size(index: usize, workers: usize, min: usize, max: usize) -> usize {
    let step = max.saturating_sub(min) / workers.max(1);
    (min + index * step).max(1)
}

/// How a slow consumer stopped reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The full RESP reply was received.
    ReplyComplete,
    /// The store closed the connection.
    Eof,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlowConsumerReport {
    pub index: usize,
    pub chunk_size: usize,
    pub bytes_read: u64,
    pub reads: u64,
    pub outcome: DrainOutcome,
}

/// Spawn `config.slow_connections` slow consumers. Each failure is logged
/// and returned for its own worker only.
pub fn spawn_slow_consumers(
    config: &RunConfig,
    cancel: CancellationToken,
) -> JoinSet<Result<SlowConsumerReport, PressureError>> {
    let mut set = JoinSet::new();
    let workers = config.slow_connections;
    for index in 0..workers {
        let addr = config.addr();
        let chunk = chunk_size(
            index,
            workers,
            config.recv_chunk_size_min,
            config.recv_chunk_size_max,
        );
        let pause = config.recv_sleep_time;
        let cancel = cancel.clone();
        set.spawn(async move {
            let result = run_slow_consumer(index, &addr, chunk, pause, cancel)
                .await
                .map_err(|source| PressureError::SlowConsumer { index, source });
            match &result {
                Ok(report) => tracing::info!(
                    slow_client = index,
                    chunk_size = report.chunk_size,
                    bytes = report.bytes_read,
                    reads = report.reads,
                    outcome = ?report.outcome,
                    "slow client finished"
                ),
                Err(err) => tracing::warn!(slow_client = index, error = ?err, "slow client encountered an error"),
            }
            result
        });
    }
    set
}

async fn run_slow_consumer(
    index: usize,
    addr: &str,
    chunk_size: usize,
    pause: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<SlowConsumerReport> {
    let mut report = SlowConsumerReport {
        index,
        chunk_size,
        bytes_read: 0,
        reads: 0,
        outcome: DrainOutcome::Cancelled,
    };

    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(report),
        stream = TcpStream::connect(addr) => stream.with_context(|| format!("connect to {addr}"))?,
    };
    stream
        .write_all(HGETALL_COMMAND)
        .await
        .context("send HGETALL")?;
    tracing::debug!(slow_client = index, chunk_size, "slow client sent HGETALL");

    let mut scanner = ReplyScanner::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(report),
            n = stream.read(&mut buf) => n.context("read reply chunk")?,
        };
        if n == 0 {
            report.outcome = DrainOutcome::Eof;
            return Ok(report);
        }
        report.bytes_read += n as u64;
        report.reads += 1;
        if scanner.feed(&buf[..n])? {
            report.outcome = DrainOutcome::ReplyComplete;
            return Ok(report);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(report),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Incremental RESP reply boundary tracker.
///
/// Consumes the reply bytes in any chunking and reports when exactly one
/// top-level reply has been seen. It never buffers payloads: bulk bodies
/// are skipped by length and only header lines are held.
#[derive(Debug)]
pub struct ReplyScanner {
    /// Values still expected before the top-level reply is complete.
    pending: u64,
    state: ScanState,
}

#[derive(Debug)]
enum ScanState {
    Header(Vec<u8>),
    /// Remaining body bytes, including the trailing CRLF.
    Body(u64),
}

impl Default for ReplyScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyScanner {
    pub fn new() -> Self {
        Self {
            pending: 1,
            state: ScanState::Header(Vec::new()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Feed the next chunk; returns `true` once the reply is complete.
    /// Bytes after the end of the reply are ignored.
    pub fn feed(&mut self, mut data: &[u8]) -> anyhow::Result<bool> {
        while !data.is_empty() && self.pending > 0 {
            match &mut self.state {
                ScanState::Body(remaining) => {
                    let take = (*remaining).min(data.len() as u64);
                    *remaining -= take;
                    data = &data[take as usize..];
                    if *remaining == 0 {
                        self.pending -= 1;
                        self.state = ScanState::Header(Vec::new());
                    }
                }
                ScanState::Header(line) => match data.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        line.extend_from_slice(&data[..pos]);
                        data = &data[pos + 1..];
                        let header = std::mem::take(line);
                        self.on_header(&header)?;
                    }
                    None => {
                        line.extend_from_slice(data);
                        data = &[];
                        anyhow::ensure!(
                            line.len() <= MAX_HEADER_LEN,
                            "RESP header longer than {MAX_HEADER_LEN} bytes"
                        );
                    }
                },
            }
        }
        Ok(self.is_complete())
    }

    fn on_header(&mut self, line: &[u8]) -> anyhow::Result<()> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let (&kind, rest) = line
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty RESP header"))?;
        match kind {
            // Simple values complete on their header line.
            b'+' | b'-' | b':' | b'_' | b'#' | b',' | b'(' => {
                self.pending -= 1;
            }
            // Length-prefixed bodies: bulk, blob error, verbatim string.
            b'$' | b'!' | b'=' => {
                let len = parse_len(rest)?;
                if len < 0 {
                    self.pending -= 1;
                } else {
                    self.state = ScanState::Body(len as u64 + 2);
                }
            }
            // Aggregates: array, set, push.
            b'*' | b'~' | b'>' => {
                let len = parse_len(rest)?;
                self.pending -= 1;
                self.expect_more(len, 1)?;
            }
            b'%' => {
                let len = parse_len(rest)?;
                self.pending -= 1;
                self.expect_more(len, 2)?;
            }
            // Attributes precede the value they annotate.
            b'|' => {
                let len = parse_len(rest)?;
                self.expect_more(len, 2)?;
            }
            other => anyhow::bail!("unexpected RESP type byte {:?}", other as char),
        }
        Ok(())
    }

    /// Add `len * per_entry` nested values; negative lengths add nothing.
    fn expect_more(&mut self, len: i64, per_entry: u64) -> anyhow::Result<()> {
        if len <= 0 {
            return Ok(());
        }
        self.pending = (len as u64)
            .checked_mul(per_entry)
            .and_then(|extra| self.pending.checked_add(extra))
            .ok_or_else(|| anyhow::anyhow!("RESP aggregate length {len} overflows"))?;
        Ok(())
    }
}

fn parse_len(raw: &[u8]) -> anyhow::Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid RESP length {:?}", String::from_utf8_lossy(raw)))
}
