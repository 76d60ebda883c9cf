//! Connection pool: dial, lease, return, health-check, retry, drain (§4.2).
//!
//! Generalizes the grounding repo's `perf::connection_pool::ConnectionPool`
//! (a WebSocket pool that multiplexes many logical streams per physical
//! connection) down to this spec's simpler exclusive-lease model: a
//! connection is handed to exactly one caller at a time and returned (or
//! destroyed) when that caller is done with it. There is no multiplexing
//! here — per §9's open question, this spec's client is single-owner per
//! call, so the pool does not need to be either.

use crate::arena::{BufferPool, PooledBuffer, DEFAULT_BUFFER_CAPACITY};
use crate::error::Error;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Network family. Only `"tcp"` is supported by this core.
    pub network: String,
    /// Dial target, e.g. `"127.0.0.1:9000"`.
    pub address: String,
    /// Maximum number of idle connections retained. Default 10.
    pub max_idle: usize,
    /// Maximum number of active (leased + idle) connections. 0 = unbounded.
    pub max_active: usize,
    /// Timeout applied to each dial attempt. Default 5s.
    pub dial_timeout: Duration,
    /// How long an idle connection may sit before the sweeper destroys it.
    /// Default 5 minutes.
    pub idle_timeout: Duration,
    /// Run a health check before handing out an idle connection.
    pub health_check_on_acquire: bool,
}

impl PoolConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            network: "tcp".to_string(),
            address: address.into(),
            max_idle: 10,
            max_active: 0,
            dial_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5 * 60),
            health_check_on_acquire: false,
        }
    }

    pub fn with_max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    pub fn with_max_active(mut self, n: usize) -> Self {
        self.max_active = n;
        self
    }

    pub fn with_dial_timeout(mut self, d: Duration) -> Self {
        self.dial_timeout = d;
        self
    }

    pub fn with_health_check_on_acquire(mut self, on: bool) -> Self {
        self.health_check_on_acquire = on;
        self
    }
}

/// A leased connection, attached read/write buffers per §3.
///
/// `read_buf` is drawn from the pool's shared [`BufferPool`] on dial and
/// returned to it on `put`/`destroy` — the same acquire/release discipline
/// `BufferPool` documents, applied to the per-call line buffer instead of
/// reallocating a fresh `Vec` on every round trip.
pub struct PooledConn {
    io: BufStream<TcpStream>,
    read_buf: PooledBuffer,
}

impl PooledConn {
    pub fn io_mut(&mut self) -> &mut BufStream<TcpStream> {
        &mut self.io
    }

    /// Disjoint mutable access to the connection's I/O half and its
    /// pooled read buffer, for callers that read a line into the latter
    /// while writing through the former.
    pub fn io_and_read_buf_mut(&mut self) -> (&mut BufStream<TcpStream>, &mut Vec<u8>) {
        (&mut self.io, self.read_buf.as_mut_vec())
    }

    pub fn into_io(self) -> BufStream<TcpStream> {
        self.io
    }

    /// A cheap liveness probe: wait briefly for the socket to become
    /// readable, then `try_read` without consuming data meaningfully — an
    /// idle, healthy connection should see no readable bytes within the
    /// probe window; a closed one reports EOF (`Ok(0)`) or an I/O error.
    async fn is_healthy(&self) -> bool {
        let stream = self.io.get_ref();
        let probe = tokio::time::timeout(Duration::from_millis(5), stream.readable()).await;
        match probe {
            Err(_) => true, // no readability observed within the window: healthy
            Ok(Err(_)) => false,
            Ok(Ok(())) => {
                let mut buf = [0u8; 1];
                match stream.try_read(&mut buf) {
                    Ok(0) => false, // peer closed
                    Ok(_) => true,  // unexpected data, but socket alive
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
        }
    }
}

struct IdleConn {
    conn: PooledConn,
    last_used: Instant,
}

/// Snapshot of pool counters (§4.2 "Observables").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub closed: bool,
}

struct Inner {
    config: PoolConfig,
    active: AtomicUsize,
    idle: Mutex<VecDeque<IdleConn>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    buffers: Arc<BufferPool>,
}

/// A bounded pool of TCP connections to a single address.
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        let max_retained = config.max_idle.max(1);
        let inner = Arc::new(Inner {
            config,
            active: AtomicUsize::new(0),
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            buffers: Arc::new(BufferPool::new(max_retained)),
        });
        Self::spawn_idle_sweeper(&inner);
        Self { inner }
    }

    fn spawn_idle_sweeper(inner: &Arc<Inner>) {
        let weak = Arc::downgrade(inner);
        let period = inner.config.idle_timeout.max(Duration::from_secs(1)) / 2;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                sweep_idle(&inner).await;
            }
        });
        // `try_lock` is safe here: nothing else can be holding this lock
        // during construction, and we never deadlock by awaiting on the
        // sweeper handle from inside spawn_idle_sweeper itself.
        if let Ok(mut guard) = inner.sweeper.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Lease a connection: reuse an idle one if available, otherwise dial a
    /// fresh one subject to `max_active` and `dial_timeout` (§4.2 "Lease").
    pub async fn get(&self) -> Result<PooledConn, Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        loop {
            let idle_candidate = {
                let mut idle = self.inner.idle.lock().await;
                idle.pop_front()
            };
            if let Some(IdleConn { conn, .. }) = idle_candidate {
                if self.inner.config.health_check_on_acquire && !conn.is_healthy().await {
                    self.inner.active.fetch_sub(1, Ordering::SeqCst);
                    warn!("discarding unhealthy idle connection on acquire");
                    self.inner.buffers.release(conn.read_buf).await;
                    continue;
                }
                debug!("leased idle connection");
                return Ok(conn);
            }
            break;
        }

        let max_active = self.inner.config.max_active;
        if max_active > 0 && self.inner.active.load(Ordering::SeqCst) >= max_active {
            return Err(Error::PoolExhausted);
        }

        let conn = self.dial().await?;
        if self.inner.closed.load(Ordering::SeqCst) {
            // The pool was closed while this dial was in flight: don't
            // hand out a connection from a closed pool, and don't leak
            // it into the idle set either — destroy it outright.
            self.inner.buffers.release(conn.read_buf).await;
            return Err(Error::PoolClosed);
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        debug!(address = %self.inner.config.address, "dialed new connection");
        Ok(conn)
    }

    /// Lease with exponential-backoff retry (§4.2 "Retrying lease").
    /// `PoolClosed` and `PoolExhausted` are terminal and returned
    /// immediately; any other error is retried up to `max_retries` times.
    pub async fn get_with_retry(
        &self,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<PooledConn, Error> {
        let mut attempt = 0;
        loop {
            match self.get().await {
                Ok(conn) => return Ok(conn),
                Err(Error::PoolClosed) => return Err(Error::PoolClosed),
                Err(Error::PoolExhausted) => return Err(Error::PoolExhausted),
                Err(err) => {
                    if attempt >= max_retries {
                        return Err(err);
                    }
                    let delay = base_delay * 2u32.saturating_pow(attempt);
                    warn!(attempt, ?delay, %err, "retrying connection lease");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn dial(&self) -> Result<PooledConn, Error> {
        if self.inner.config.network != "tcp" {
            return Err(Error::InvalidConn(format!(
                "unsupported network family {:?}",
                self.inner.config.network
            )));
        }
        let stream = tokio::time::timeout(
            self.inner.config.dial_timeout,
            TcpStream::connect(&self.inner.config.address),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true).ok();
        let read_buf = self.inner.buffers.acquire().await;
        Ok(PooledConn {
            io: BufStream::with_capacity(DEFAULT_BUFFER_CAPACITY, DEFAULT_BUFFER_CAPACITY, stream),
            read_buf,
        })
    }

    /// Return a connection to the idle set, or destroy it if the pool is
    /// closed or the idle set is full (§4.2 "Return"). Never blocks the
    /// returner.
    pub async fn put(&self, conn: PooledConn) {
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            debug!("pool closed; destroying returned connection");
            self.inner.buffers.release(conn.read_buf).await;
            return;
        }
        let mut idle = self.inner.idle.lock().await;
        if idle.len() >= self.inner.config.max_idle {
            drop(idle);
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
            debug!("idle set full; destroying returned connection");
            self.inner.buffers.release(conn.read_buf).await;
            return;
        }
        idle.push_back(IdleConn {
            conn,
            last_used: Instant::now(),
        });
    }

    /// Destroy a connection outright instead of returning it — used after
    /// a partial write or any read/write error (§9 "Retry after partial
    /// write": such a connection is never safe to reuse). The connection's
    /// read buffer is still worth reclaiming, so it goes back to the
    /// shared `BufferPool` even though the socket is dropped.
    pub async fn destroy(&self, conn: PooledConn) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.buffers.release(conn.read_buf).await;
    }

    /// Close the pool: drain and destroy every idle connection. Active
    /// (leased) connections are destroyed when their holder calls `put` or
    /// `destroy`. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut idle = self.inner.idle.lock().await;
        let drained = idle.len();
        idle.clear();
        drop(idle);
        self.inner.active.fetch_sub(drained, Ordering::SeqCst);
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            handle.abort();
        }
        debug!(drained, "pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.inner.active.load(Ordering::SeqCst),
            idle: self.inner.idle.lock().await.len(),
            closed: self.inner.closed.load(Ordering::SeqCst),
        }
    }
}

/// Scan the idle set and destroy any connection whose health check fails
/// or whose `idle_timeout` has elapsed (§4.2 "Idle sweeper").
async fn sweep_idle(inner: &Arc<Inner>) {
    let mut keep = VecDeque::new();
    let mut discarded = Vec::new();
    let mut idle = inner.idle.lock().await;
    while let Some(entry) = idle.pop_front() {
        let expired = entry.last_used.elapsed() >= inner.config.idle_timeout;
        let healthy = !expired && entry.conn.is_healthy().await;
        if healthy {
            keep.push_back(entry);
        } else {
            discarded.push(entry.conn);
        }
    }
    *idle = keep;
    drop(idle);
    let destroyed = discarded.len();
    for conn in discarded {
        inner.buffers.release(conn.read_buf).await;
    }
    if destroyed > 0 {
        inner.active.fetch_sub(destroyed, Ordering::SeqCst);
        debug!(destroyed, "idle sweeper destroyed stale connections");
    }
}
