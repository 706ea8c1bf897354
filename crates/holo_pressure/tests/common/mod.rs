//! Shared helpers for integration tests.
//!
//! `TestStore` is an in-process RESP server backed by an in-memory map. It
//! speaks RESP2 arrays and inline commands (the slow-consumer path sends
//! `HGETALL large-hash\r\n` as a bare line) and implements only what the
//! harness uses: PING, FLUSHDB, SET, GET, HSET, HGETALL.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::error::RedisProtocolError;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, Encoder, Framed};

use holo_pressure::RunConfig;

/// Timeout for individual test round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct StoreData {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    hashes: HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[derive(Default)]
struct Shared {
    data: Mutex<StoreData>,
    failing: Mutex<HashSet<String>>,
    accepted: AtomicUsize,
    open: AtomicUsize,
    commands: AtomicUsize,
}

/// In-process RESP store, shut down on drop.
pub struct TestStore {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    task: tokio::task::JoinHandle<()>,
}

impl TestStore {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test store");
        let addr = listener.local_addr().expect("test store addr");
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(accept_loop(listener, shared.clone()));
        Self { addr, shared, task }
    }

    /// Run config pointed at this store with a small dataset.
    pub fn config(&self, keys_count: usize) -> RunConfig {
        let mut config = RunConfig::new(self.addr.ip().to_string(), self.addr.port(), keys_count);
        config.data_size = 32;
        config.connections = 4;
        config.hash_fields = 50;
        config.hash_field_size = 16;
        config.recv_sleep_time = Duration::from_millis(10);
        config.op_timeout = IO_TIMEOUT;
        config
    }

    /// Make every subsequent `cmd` (upper-case) fail with an error reply.
    pub fn fail_command(&self, cmd: &str) {
        self.shared
            .failing
            .lock()
            .unwrap()
            .insert(cmd.to_ascii_uppercase());
    }

    pub fn insert_string(&self, key: &str, value: &str) {
        self.shared
            .data
            .lock()
            .unwrap()
            .strings
            .insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
    }

    pub fn string(&self, key: &str) -> Option<Vec<u8>> {
        self.shared
            .data
            .lock()
            .unwrap()
            .strings
            .get(key.as_bytes())
            .cloned()
    }

    pub fn string_count(&self) -> usize {
        self.shared.data.lock().unwrap().strings.len()
    }

    pub fn hash(&self, key: &str) -> Option<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.shared
            .data
            .lock()
            .unwrap()
            .hashes
            .get(key.as_bytes())
            .cloned()
    }

    pub fn accepted_connections(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn commands_served(&self) -> usize {
        self.shared.commands.load(Ordering::SeqCst)
    }
}

impl Drop for TestStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// An address nothing listens on (bound once, then released).
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    listener.local_addr().expect("ephemeral addr")
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Exact byte length of the RESP2 `HGETALL` reply for `hash`.
pub fn hgetall_reply_len(hash: &BTreeMap<Vec<u8>, Vec<u8>>) -> u64 {
    fn bulk_len(bytes: &[u8]) -> u64 {
        (format!("${}\r\n", bytes.len()).len() + bytes.len() + 2) as u64
    }
    let header = format!("*{}\r\n", hash.len() * 2).len() as u64;
    header
        + hash
            .iter()
            .map(|(field, value)| bulk_len(field) + bulk_len(value))
            .sum::<u64>()
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    // Owned here so aborting the accept task also tears down connections.
    let mut conns = JoinSet::new();
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        shared.accepted.fetch_add(1, Ordering::SeqCst);
        shared.open.fetch_add(1, Ordering::SeqCst);
        let shared = shared.clone();
        conns.spawn(async move {
            let _ = handle_conn(socket, &shared).await;
            shared.open.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn handle_conn(socket: TcpStream, shared: &Shared) -> Result<(), RedisProtocolError> {
    let mut framed = Framed::new(socket, ServerCodec::default());
    while let Some(frame) = framed.next().await {
        let resp = execute(shared, frame?);
        shared.commands.fetch_add(1, Ordering::SeqCst);
        framed.send(resp).await?;
    }
    Ok(())
}

fn execute(shared: &Shared, frame: BytesFrame) -> BytesFrame {
    let BytesFrame::Array(parts) = frame else {
        return error("expected array frame");
    };
    let args: Vec<Vec<u8>> = parts
        .into_iter()
        .filter_map(|part| match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
            _ => None,
        })
        .collect();
    let Some(cmd) = args.first() else {
        return error("empty command");
    };
    let cmd = String::from_utf8_lossy(cmd).to_ascii_uppercase();
    if shared.failing.lock().unwrap().contains(&cmd) {
        return error(&format!("injected failure for {cmd}"));
    }

    let mut data = shared.data.lock().unwrap();
    match (cmd.as_str(), args.len()) {
        ("PING", 1) => simple("PONG"),
        ("FLUSHDB", 1) => {
            data.strings.clear();
            data.hashes.clear();
            simple("OK")
        }
        ("SET", 3) => {
            data.strings.insert(args[1].clone(), args[2].clone());
            simple("OK")
        }
        ("GET", 2) => match data.strings.get(&args[1]) {
            Some(value) => BytesFrame::BulkString(Bytes::from(value.clone())),
            None => BytesFrame::Null,
        },
        ("HSET", n) if n >= 4 && n % 2 == 0 => {
            let hash = data.hashes.entry(args[1].clone()).or_default();
            let mut added = 0;
            for pair in args[2..].chunks(2) {
                if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            BytesFrame::Integer(added)
        }
        ("HGETALL", 2) => {
            let items = data
                .hashes
                .get(&args[1])
                .map(|hash| {
                    hash.iter()
                        .flat_map(|(f, v)| {
                            [
                                BytesFrame::BulkString(Bytes::from(f.clone())),
                                BytesFrame::BulkString(Bytes::from(v.clone())),
                            ]
                        })
                        .collect()
                })
                .unwrap_or_default();
            BytesFrame::Array(items)
        }
        (other, _) => error(&format!("unknown command or wrong arity '{other}'")),
    }
}

fn simple(s: &'static str) -> BytesFrame {
    BytesFrame::SimpleString(Bytes::from_static(s.as_bytes()))
}

fn error(msg: &str) -> BytesFrame {
    BytesFrame::Error(format!("ERR {msg}").into())
}

/// RESP2 codec that also accepts inline commands.
#[derive(Default)]
struct ServerCodec {
    inner: Resp2,
}

impl Decoder for ServerCodec {
    type Item = BytesFrame;
    type Error = RedisProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesFrame>, RedisProtocolError> {
        match src.first() {
            None => Ok(None),
            Some(b'*') => self.inner.decode(src),
            Some(_) => {
                let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                    return Ok(None);
                };
                let line = src.split_to(pos + 1);
                let parts = line[..]
                    .split(|b: &u8| b.is_ascii_whitespace())
                    .filter(|part| !part.is_empty())
                    .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part)))
                    .collect();
                Ok(Some(BytesFrame::Array(parts)))
            }
        }
    }
}

impl Encoder<BytesFrame> for ServerCodec {
    type Error = RedisProtocolError;

    fn encode(&mut self, item: BytesFrame, dst: &mut BytesMut) -> Result<(), RedisProtocolError> {
        self.inner.encode(item, dst)
    }
}
