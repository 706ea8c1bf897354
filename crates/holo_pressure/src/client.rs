//! Minimal RESP2 client used by pooled connections.
//!
//! Only the commands the workload needs are modelled: `PING` for pool
//! validation, `FLUSHDB`, `SET`, `HSET`, and `GET`. Every request is a RESP
//! array of bulk strings and every round-trip is bounded by the per-op timeout.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::error::PressureError;
use crate::pool::ManageConnection;

/// One live RESP session to the store.
pub struct StoreConnection {
    addr: String,
    framed: Framed<TcpStream, Resp2>,
    op_timeout: Duration,
}

impl StoreConnection {
    pub async fn connect(addr: &str, op_timeout: Duration) -> anyhow::Result<Self> {
        let socket = time::timeout(op_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {addr} timed out"))?
            .with_context(|| format!("connect to {addr}"))?;
        socket.set_nodelay(true).ok();
        Ok(Self {
            addr: addr.to_string(),
            framed: Framed::new(socket, Resp2::default()),
            op_timeout,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Round-trip probe used by the pool on borrow and return.
    pub async fn ping(&mut self) -> anyhow::Result<()> {
        match self.request(&[b"PING"]).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
            other => anyhow::bail!("unexpected PING response: {other:?}"),
        }
    }

    pub async fn flushdb(&mut self) -> anyhow::Result<()> {
        let resp = self.request(&[b"FLUSHDB"]).await?;
        expect_ok("FLUSHDB", resp)
    }

    pub async fn set(&mut self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let resp = self.request(&[b"SET", key.as_bytes(), value]).await?;
        expect_ok("SET", resp)
    }

    /// Returns the number of newly created fields (0 when overwritten).
    pub async fn hset(&mut self, key: &str, field: &str, value: &[u8]) -> anyhow::Result<i64> {
        match self
            .request(&[b"HSET", key.as_bytes(), field.as_bytes(), value])
            .await?
        {
            BytesFrame::Integer(added) => Ok(added),
            other => anyhow::bail!("unexpected HSET response: {other:?}"),
        }
    }

    pub async fn get(&mut self, key: &str) -> anyhow::Result<Option<Bytes>> {
        match self.request(&[b"GET", key.as_bytes()]).await? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => Ok(Some(bytes)),
            other => anyhow::bail!("unexpected GET response: {other:?}"),
        }
    }

    async fn request(&mut self, parts: &[&[u8]]) -> anyhow::Result<BytesFrame> {
        let req = make_command(parts);
        time::timeout(self.op_timeout, self.framed.send(req))
            .await
            .map_err(|_| anyhow::anyhow!("send to {} timed out", self.addr))?
            .with_context(|| format!("send to {}", self.addr))?;

        let resp = match time::timeout(self.op_timeout, self.framed.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => anyhow::bail!("recv from {} failed: {err}", self.addr),
            Ok(None) => anyhow::bail!("connection to {} closed", self.addr),
            Err(_) => anyhow::bail!("recv from {} timed out", self.addr),
        };
        if let BytesFrame::Error(err) = &resp {
            anyhow::bail!("{}", err.to_string());
        }
        Ok(resp)
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("addr", &self.addr)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

/// Build a RESP command as an array of bulk strings.
fn make_command(parts: &[&[u8]]) -> BytesFrame {
    BytesFrame::Array(
        parts
            .iter()
            .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part)))
            .collect(),
    )
}

fn expect_ok(cmd: &str, resp: BytesFrame) -> anyhow::Result<()> {
    match resp {
        BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        other => anyhow::bail!("unexpected {cmd} response: {other:?}"),
    }
}

/// Opens and validates [`StoreConnection`]s for the pool.
#[derive(Clone, Debug)]
pub struct StoreManager {
    addr: String,
    op_timeout: Duration,
}

impl StoreManager {
    pub fn new(addr: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            op_timeout,
        }
    }
}

#[async_trait]
impl ManageConnection for StoreManager {
    type Connection = StoreConnection;

    async fn connect(&self) -> Result<StoreConnection, PressureError> {
        StoreConnection::connect(&self.addr, self.op_timeout)
            .await
            .map_err(|source| PressureError::Connection {
                addr: self.addr.clone(),
                source,
            })
    }

    async fn is_valid(&self, conn: &mut StoreConnection) -> bool {
        match conn.ping().await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(addr = %conn.addr(), error = ?err, "pooled connection failed PING");
                false
            }
        }
    }
}
