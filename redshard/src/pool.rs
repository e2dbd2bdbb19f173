//! Sized connection pool with a sticky I/O-error gate.
//!
//! A [`Pool`] keeps a fixed working set of connections hot in a bounded
//! channel, with an optional bounded overflow. Checkout and check-in move
//! whole [`IoErrConn`] values through the channels, so at any instant a
//! connection is either pooled or owned by exactly one caller.
//!
//! [`IoErrConn`] is the reusability gate: it latches the first
//! transport-level failure and the pool refuses to re-admit a latched
//! connection. Server error replies and decode type mismatches leave the
//! byte stream aligned and do not latch.

use crate::cmd::{Cmd, Pipeline};
use crate::conn::{dial, reply_to_result, Conn, DialConfig};
use crate::trace::{
    self, ConnClosedReason, PoolConnClosed, PoolConnCreated, PoolDoCompleted, PoolInitCompleted,
    PoolTrace,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use redshard_core::{Error, OnEmpty, OnFull, PoolConfig, RespValue, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How many dials the initial fill runs concurrently.
const FILL_CONCURRENCY: usize = 4;

/// A connection wrapper that latches the first transport-level failure.
///
/// Once latched, every call short-circuits with the stored error without
/// touching the socket, and [`IoErrConn::is_broken`] tells the pool to
/// discard instead of re-admitting.
#[derive(Debug)]
pub struct IoErrConn {
    conn: Conn,
    last_io_err: Option<Error>,
}

impl IoErrConn {
    /// Wrap a fresh connection.
    #[must_use]
    pub fn new(conn: Conn) -> Self {
        Self {
            conn,
            last_io_err: None,
        }
    }

    /// Whether a transport failure has been latched.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.last_io_err.is_some()
    }

    /// See [`Conn::encode_decode`]. Errors that are not connection-usable
    /// latch; later calls replay the latched error.
    pub async fn encode_decode(
        &mut self,
        deadline: Option<Instant>,
        frame: Option<Bytes>,
        replies: usize,
    ) -> Result<Vec<RespValue>> {
        if let Some(err) = &self.last_io_err {
            return Err(err.clone());
        }
        match self.conn.encode_decode(deadline, frame, replies).await {
            Err(err) => {
                if !err.is_connection_usable() {
                    self.last_io_err = Some(err.clone());
                }
                Err(err)
            }
            ok => ok,
        }
    }

    /// One command round trip. Error replies are parsed after the latch
    /// step, so a server error or redirect never poisons the connection.
    pub async fn run_command(&mut self, deadline: Option<Instant>, cmd: &Cmd) -> Result<RespValue> {
        let mut replies = self.encode_decode(deadline, Some(cmd.encode()), 1).await?;
        match replies.pop() {
            Some(value) => reply_to_result(value),
            None => Err(Error::Protocol("reply missing from exchange".into())),
        }
    }

    /// See [`Conn::run_pipeline`].
    pub async fn run_pipeline(
        &mut self,
        deadline: Option<Instant>,
        pipe: &Pipeline,
    ) -> Result<Vec<RespValue>> {
        if pipe.is_empty() {
            return Ok(Vec::new());
        }
        self.encode_decode(deadline, Some(pipe.encode()), pipe.len())
            .await
    }

    /// Close the wrapped connection.
    pub fn close(&self) {
        self.conn.close();
    }
}

/// Dials connections for pools and the cluster router. The trait is the
/// seam test suites use to point pools at in-process servers.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Return an established, handshaken connection to `addr`.
    async fn connect(&self, addr: &str) -> Result<Conn>;
}

/// The default connector: TCP (or TLS) via [`dial`].
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    cfg: DialConfig,
}

impl TcpConnector {
    /// Build a connector applying the given dial options to every connect.
    #[must_use]
    pub fn new(cfg: DialConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> Result<Conn> {
        dial(addr, &self.cfg).await
    }
}

struct OverflowBuf {
    tx: mpsc::Sender<IoErrConn>,
    rx: Mutex<mpsc::Receiver<IoErrConn>>,
}

struct PoolShared {
    addr: String,
    cfg: PoolConfig,
    connector: Arc<dyn Connector>,
    main_tx: mpsc::Sender<IoErrConn>,
    main_rx: Mutex<mpsc::Receiver<IoErrConn>>,
    overflow: Option<OverflowBuf>,
    trace: PoolTrace,
    closed: watch::Sender<bool>,
}

impl PoolShared {
    fn discard(&self, conn: IoErrConn, reason: ConnClosedReason) {
        conn.close();
        trace::fire(
            &self.trace.conn_closed,
            &PoolConnClosed {
                addr: self.addr.clone(),
                reason,
            },
        );
    }

    /// Best-effort sweep for a check-in that raced `close`.
    fn reap_after_close(&self) {
        if let Ok(mut rx) = self.main_rx.try_lock() {
            while let Ok(conn) = rx.try_recv() {
                self.discard(conn, ConnClosedReason::PoolClosed);
            }
        }
        if let Some(of) = &self.overflow {
            if let Ok(mut rx) = of.rx.try_lock() {
                while let Ok(conn) = rx.try_recv() {
                    self.discard(conn, ConnClosedReason::PoolClosed);
                }
            }
        }
    }

    fn main_is_full(&self) -> bool {
        self.cfg.size == 0 || self.main_tx.capacity() == 0
    }
}

/// A pool of connections to one address.
///
/// Cloning is cheap; clones share the same working set.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Open a pool and eagerly fill it to its configured size. The first
    /// dial failure fails construction; later fill failures are logged and
    /// reflected in the `InitCompleted` hook's count.
    pub async fn new(
        addr: impl Into<String>,
        connector: Arc<dyn Connector>,
        cfg: PoolConfig,
    ) -> Result<Self> {
        Self::with_trace(addr, connector, cfg, PoolTrace::default()).await
    }

    /// Like [`Pool::new`] with lifecycle trace hooks installed.
    pub async fn with_trace(
        addr: impl Into<String>,
        connector: Arc<dyn Connector>,
        cfg: PoolConfig,
        trace: PoolTrace,
    ) -> Result<Self> {
        let addr = addr.into();
        let (main_tx, main_rx) = mpsc::channel(cfg.size.max(1));
        let overflow = match cfg.on_full {
            OnFull::Buffer { size, .. } if size > 0 => {
                let (tx, rx) = mpsc::channel(size);
                Some(OverflowBuf {
                    tx,
                    rx: Mutex::new(rx),
                })
            }
            _ => None,
        };
        let (closed, _) = watch::channel(false);
        let pool = Self {
            shared: Arc::new(PoolShared {
                addr,
                cfg,
                connector,
                main_tx,
                main_rx: Mutex::new(main_rx),
                overflow,
                trace,
                closed,
            }),
        };

        if cfg.size > 0 {
            let first = pool.new_conn().await?;
            pool.put(first);
            let rest = stream::iter((1..cfg.size).map(|_| pool.new_conn()))
                .buffer_unordered(FILL_CONCURRENCY)
                .collect::<Vec<_>>()
                .await;
            for res in rest {
                match res {
                    Ok(conn) => pool.put(conn),
                    Err(err) => {
                        warn!(addr = %pool.shared.addr, %err, "initial pool fill connect failed");
                    }
                }
            }
        }
        trace::fire(
            &pool.shared.trace.init_completed,
            &PoolInitCompleted {
                avail_count: pool.num_avail_conns(),
            },
        );
        debug!(addr = %pool.shared.addr, avail = pool.num_avail_conns(), "pool initialized");

        if let OnFull::Buffer { drain_interval, .. } = cfg.on_full {
            spawn_drainer(Arc::clone(&pool.shared), drain_interval);
        }
        Ok(pool)
    }

    /// Address this pool connects to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Check a connection out. An empty pool behaves per the configured
    /// [`OnEmpty`] policy.
    pub async fn get(&self) -> Result<IoErrConn> {
        if *self.shared.closed.borrow() {
            return Err(Error::Closed);
        }
        if let Some(conn) = self.try_checkout().await {
            return Ok(conn);
        }
        match self.shared.cfg.on_empty {
            OnEmpty::Wait => self.wait_checkout(None).await,
            OnEmpty::CreateAfter(window) => match self.wait_checkout(Some(window)).await {
                Err(Error::PoolEmpty) => self.new_conn().await,
                other => other,
            },
            OnEmpty::ErrAfter(window) => self.wait_checkout(Some(window)).await,
        }
    }

    async fn try_checkout(&self) -> Option<IoErrConn> {
        if let Ok(conn) = self.shared.main_rx.lock().await.try_recv() {
            return Some(conn);
        }
        if let Some(of) = &self.shared.overflow {
            if let Ok(conn) = of.rx.lock().await.try_recv() {
                return Some(conn);
            }
        }
        None
    }

    async fn wait_checkout(&self, window: Option<Duration>) -> Result<IoErrConn> {
        let mut closed = self.shared.closed.subscribe();
        let mut rx = self.shared.main_rx.lock().await;
        let recv = async { rx.recv().await.ok_or(Error::Closed) };
        match window {
            Some(window) => tokio::select! {
                _ = closed.changed() => Err(Error::Closed),
                res = tokio::time::timeout(window, recv) => match res {
                    Ok(res) => res,
                    Err(_) => Err(Error::PoolEmpty),
                },
            },
            None => tokio::select! {
                _ = closed.changed() => Err(Error::Closed),
                res = recv => res,
            },
        }
    }

    async fn new_conn(&self) -> Result<IoErrConn> {
        let conn = self.shared.connector.connect(&self.shared.addr).await?;
        trace::fire(
            &self.shared.trace.conn_created,
            &PoolConnCreated {
                addr: self.shared.addr.clone(),
            },
        );
        Ok(IoErrConn::new(conn))
    }

    /// Check a connection back in. Broken connections are closed and
    /// dropped; a full main buffer falls through to the [`OnFull`] policy.
    pub fn put(&self, conn: IoErrConn) {
        let sh = &self.shared;
        if conn.is_broken() {
            sh.discard(conn, ConnClosedReason::ConnError);
            return;
        }
        if *sh.closed.borrow() {
            sh.discard(conn, ConnClosedReason::PoolClosed);
            return;
        }

        let conn = if sh.cfg.size > 0 {
            match sh.main_tx.try_send(conn) {
                Ok(()) => {
                    if *sh.closed.borrow() {
                        sh.reap_after_close();
                    }
                    return;
                }
                Err(TrySendError::Full(conn)) => conn,
                Err(TrySendError::Closed(conn)) => {
                    sh.discard(conn, ConnClosedReason::PoolClosed);
                    return;
                }
            }
        } else {
            conn
        };

        match &sh.overflow {
            Some(of) => match of.tx.try_send(conn) {
                Ok(()) => {
                    if *sh.closed.borrow() {
                        sh.reap_after_close();
                    }
                }
                Err(TrySendError::Full(conn)) | Err(TrySendError::Closed(conn)) => {
                    sh.discard(conn, ConnClosedReason::PoolFull);
                }
            },
            None => sh.discard(conn, ConnClosedReason::PoolFull),
        }
    }

    /// Checkout, one round trip, check-in.
    pub async fn run_command(&self, deadline: Option<Instant>, cmd: &Cmd) -> Result<RespValue> {
        let started = std::time::Instant::now();
        let mut conn = self.get().await?;
        let res = conn.run_command(deadline, cmd).await;
        self.put(conn);
        trace::fire(
            &self.shared.trace.do_completed,
            &PoolDoCompleted {
                elapsed: started.elapsed(),
            },
        );
        res
    }

    /// Connections currently resident in the pool (main plus overflow).
    #[must_use]
    pub fn num_avail_conns(&self) -> usize {
        let sh = &self.shared;
        let main = if sh.cfg.size == 0 {
            0
        } else {
            sh.main_tx.max_capacity() - sh.main_tx.capacity()
        };
        let overflow = sh
            .overflow
            .as_ref()
            .map_or(0, |of| of.tx.max_capacity() - of.tx.capacity());
        main + overflow
    }

    /// Close the pool: resident connections are closed now, checked-out
    /// connections when they come back. Subsequent operations fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        if self.shared.closed.send_replace(true) {
            return;
        }
        let mut rx = self.shared.main_rx.lock().await;
        while let Ok(conn) = rx.try_recv() {
            self.shared.discard(conn, ConnClosedReason::PoolClosed);
        }
        drop(rx);
        if let Some(of) = &self.shared.overflow {
            let mut rx = of.rx.lock().await;
            while let Ok(conn) = rx.try_recv() {
                self.shared.discard(conn, ConnClosedReason::PoolClosed);
            }
        }
        debug!(addr = %self.shared.addr, "pool closed");
    }
}

fn spawn_drainer(shared: Arc<PoolShared>, interval: Duration) {
    tokio::spawn(async move {
        let mut closed = shared.closed.subscribe();
        let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = closed.changed() => return,
                _ = tick.tick() => {
                    // Only shed overflow while the main buffer is also
                    // full; otherwise the overflow conn may still be the
                    // next one handed out.
                    if !shared.main_is_full() {
                        continue;
                    }
                    let conn = match &shared.overflow {
                        Some(of) => of.rx.try_lock().ok().and_then(|mut rx| rx.try_recv().ok()),
                        None => None,
                    };
                    if let Some(conn) = conn {
                        shared.discard(conn, ConnClosedReason::Stale);
                    }
                }
            }
        }
    });
}
