//! Bounded connection pool with validation on borrow and return.
//!
//! Capacity is enforced by a semaphore: every checkout holds one permit for
//! its whole lifetime, so borrowed connections can never exceed `max_size`.
//! Idle connections sit in a short-lived mutex-protected list; probes and
//! connects always run outside that lock.
//!
//! Policies:
//! - `acquire` validates an idle connection before handing it out and
//!   destroys it on failure, then tries the next idle one or opens a new one.
//! - `release(conn, true)` validates before returning to the idle list;
//!   `release(conn, false)` destroys.
//! - A checkout dropped without `release` is destroyed: a cancelled command
//!   may have left an unread reply on the socket.
//! - Waiting for a slot is unbounded unless `acquire_timeout` is set.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PressureError;

/// Creates and health-checks pooled connections.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, PressureError>;

    /// Cheap round-trip probe; `false` means the connection must be dropped.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Upper bound on simultaneously borrowed connections.
    pub max_size: usize,
    /// Connections kept for reuse; extras are closed on release.
    pub max_idle: usize,
    /// Connections opened eagerly when the pool is built.
    pub min_idle: usize,
    pub acquire_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            max_idle: max_size,
            min_idle: 1,
            acquire_timeout: None,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolState {
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub live: usize,
    pub closed: bool,
}

pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<M::Connection>>,
    live: AtomicUsize,
    closed: AtomicBool,
}

impl<M: ManageConnection> PoolInner<M> {
    fn pop_idle(&self) -> Option<M::Connection> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Return a validated connection to the idle list, or hand it back when
    /// the pool is closed or already holds `max_idle` connections.
    fn push_idle(&self, conn: M::Connection) -> Option<M::Connection> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so `close` cannot miss this connection.
        if self.closed.load(Ordering::Acquire) || idle.len() >= self.config.max_idle {
            return Some(conn);
        }
        idle.push_back(conn);
        None
    }

    fn destroy(&self, conn: M::Connection) {
        drop(conn);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Probe a counted connection. Returns it when healthy; otherwise, or
    /// when the caller is cancelled mid-probe, it is destroyed.
    async fn validate(&self, conn: M::Connection) -> Option<M::Connection> {
        let mut probing = Probing {
            conn: Some(conn),
            pool: self,
        };
        let healthy = match probing.conn.as_mut() {
            Some(conn) => self.manager.is_valid(conn).await,
            None => false,
        };
        if healthy {
            probing.conn.take()
        } else {
            None
        }
    }
}

/// A counted connection outside both the idle list and any checkout.
struct Probing<'a, M: ManageConnection> {
    conn: Option<M::Connection>,
    pool: &'a PoolInner<M>,
}

impl<M: ManageConnection> Drop for Probing<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.destroy(conn);
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Build the pool and open `min_idle` connections up front, so an
    /// unreachable store fails here rather than inside the workers.
    pub async fn build(manager: M, config: PoolConfig) -> Result<Self, PressureError> {
        let max_size = config.max_size.max(1);
        let config = PoolConfig {
            max_size,
            max_idle: config.max_idle.clamp(1, max_size),
            min_idle: config.min_idle.min(max_size),
            acquire_timeout: config.acquire_timeout,
        };

        let mut idle = VecDeque::with_capacity(config.max_idle);
        for _ in 0..config.min_idle {
            idle.push_back(manager.connect().await?);
        }
        let live = idle.len();

        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                slots: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(idle),
                live: AtomicUsize::new(live),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Borrow a connection, waiting for a free slot.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PressureError> {
        if self.is_closed() {
            return Err(PressureError::PoolClosed);
        }

        let slots = self.inner.slots.clone();
        let permit = match self.inner.config.acquire_timeout {
            Some(waited) => tokio::time::timeout(waited, slots.acquire_owned())
                .await
                .map_err(|_| PressureError::PoolExhausted { waited })?,
            None => slots.acquire_owned().await,
        }
        .map_err(|_| PressureError::PoolClosed)?;

        while let Some(conn) = self.inner.pop_idle() {
            if let Some(conn) = self.inner.validate(conn).await {
                return Ok(self.checkout(conn, permit));
            }
            tracing::debug!("dropped idle connection that failed validation");
        }

        if self.is_closed() {
            return Err(PressureError::PoolClosed);
        }
        let conn = self.inner.manager.connect().await?;
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        Ok(self.checkout(conn, permit))
    }

    /// Give a borrowed connection back. Unhealthy or failed-probe connections
    /// are destroyed; the pool opens a replacement on a later `acquire`.
    pub async fn release(&self, mut pooled: PooledConnection<M>, healthy: bool) {
        let Some(conn) = pooled.conn.take() else {
            return;
        };
        if !healthy || self.is_closed() {
            self.inner.destroy(conn);
            return;
        }
        let Some(conn) = self.inner.validate(conn).await else {
            tracing::debug!("dropped returned connection that failed validation");
            return;
        };
        if let Some(extra) = self.inner.push_idle(conn) {
            self.inner.destroy(extra);
        }
        // `pooled` still owns the permit; the slot frees only after the
        // connection is back on the idle list.
        drop(pooled);
    }

    /// Stop handing out connections and close every idle one. Pending and
    /// future `acquire` calls fail with `PoolClosed`; borrowed connections
    /// are destroyed when released. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.slots.close();
        let drained: Vec<M::Connection> = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = drained.len();
        for conn in drained {
            self.inner.destroy(conn);
        }
        tracing::debug!(idle_closed = count, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PoolState {
        let max_size = self.inner.config.max_size;
        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolState {
            max_size,
            in_use: max_size.saturating_sub(self.inner.slots.available_permits()),
            idle,
            live: self.inner.live.load(Ordering::Acquire),
            closed: self.is_closed(),
        }
    }

    fn checkout(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }
}

/// A borrowed connection. Holds one capacity slot until released or dropped.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection used after release")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection used after release")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.destroy(conn);
        }
    }
}
