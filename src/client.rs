//! Call multiplexer: sync/async/batch client API (§4.6).
//!
//! Grounded on the grounding repo's `perf::connection_pool` stream-ID →
//! response-channel bookkeeping (here: sequence number → pending-call
//! entry) and its `retry::retry_with_backoff` for the client-side retry
//! policy.
//!
//! Per §9's open question on multiplexing: a leased connection is owned
//! exclusively by one `call` for the full request/response round trip.
//! Nothing here pipelines multiple requests onto one connection at a
//! time — that is a deliberate restriction, not an oversight.

use crate::codec::{decode_response, encode_request, to_raw_value};
use crate::ctx::Ctx;
use crate::error::Error;
use crate::pool::{Pool, PoolConfig, PoolStats};
use crate::protocol::{Id, Request};
use crate::server::PING_METHOD;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Configuration for a [`Client`] (§6 "Client public API").
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub network: String,
    pub address: String,
    pub max_idle: usize,
    pub max_active: usize,
    pub dial_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            network: "tcp".to_string(),
            address: address.into(),
            max_idle: 10,
            max_active: 100,
            dial_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

struct PendingCall {
    method: String,
}

/// The result of an asynchronous (`go`) or batch call, observed by the
/// issuer once `done` fires or `batch` returns (§3 "Call record").
pub struct Call {
    pub method: String,
    pub error: Option<Error>,
}

/// Aggregate client observables (§6 "Client public API", §4.6 "Stats").
#[derive(Debug, Clone, Copy)]
pub struct ClientStats {
    pub pending: usize,
    pub pool: PoolStats,
    pub closed: bool,
}

/// A JSON-RPC client: pool + sequence counter + pending-call map.
pub struct Client {
    pool: Pool,
    config: ClientConfig,
    seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let pool_config = PoolConfig::new(config.address.clone())
            .with_max_idle(config.max_idle)
            .with_max_active(config.max_active)
            .with_dial_timeout(config.dial_timeout);
        Self {
            pool: Pool::new(pool_config),
            config,
            seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Synchronous call with the client's default retry policy (§4.6).
    pub async fn call<A, R>(&self, ctx: Ctx, method: &str, args: &A) -> Result<R, Error>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            match self.call_once(ctx, method, args).await {
                Ok(reply) => return Ok(reply),
                Err(err) if err.should_retry() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.saturating_pow(attempt);
                    warn!(attempt, method, %err, ?delay, "retrying call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once<A, R>(&self, ctx: Ctx, method: &str, args: &A) -> Result<R, Error>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        if ctx.is_expired() {
            // §8 scenario 4: an already-elapsed deadline must not dispatch
            // a request at all, and must leave no trace in the pending map.
            return Err(Error::Timeout);
        }

        let seq = self.next_seq();
        self.pending.lock().await.insert(
            seq,
            PendingCall {
                method: method.to_string(),
            },
        );

        let result = self.call_once_leased(ctx, seq, method, args).await;
        self.pending.lock().await.remove(&seq);
        result
    }

    /// The leased-connection half of [`Client::call_once`], split out so
    /// every exit — success, error, or an early `?` — funnels back through
    /// a single pending-map removal in the caller.
    async fn call_once_leased<A, R>(
        &self,
        ctx: Ctx,
        seq: u64,
        method: &str,
        args: &A,
    ) -> Result<R, Error>
    where
        A: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        // `Pool::get()` already returns the crate's own `Error` — propagate
        // it as-is so `PoolExhausted`/`PoolClosed` stay distinguishable
        // from a transient `NoConnection` and `should_retry()` can treat
        // them as terminal (§4.6 "do not retry on ... PoolExhausted").
        let mut conn = self.pool.get().await?;

        let params = to_raw_value(args)?;
        let request = Request::new(method, Id::Number(seq as i64), Some(params));
        let bytes = encode_request(request)?;

        let roundtrip = async {
            conn.io_mut().write_all(&bytes).await?;
            conn.io_mut().flush().await?;

            // Read into the connection's pooled line buffer rather than
            // allocating a fresh `Vec` per call (§3 "Pooled connection").
            let (io, line) = conn.io_and_read_buf_mut();
            line.clear();
            io.read_until(b'\n', line).await?;
            if line.is_empty() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before response",
                )));
            }
            let content = if line.last() == Some(&b'\n') {
                &line[..line.len() - 1]
            } else {
                &line[..]
            };
            let response = decode_response(content)?;

            let got_id = response.id.clone().unwrap_or(Id::Number(-1));
            if got_id != Id::Number(seq as i64) {
                return Err(Error::IdMismatch {
                    expected: seq.to_string(),
                    got: got_id.to_string(),
                });
            }

            if let Some(rpc_err) = response.error {
                return Err(Error::Internal(rpc_err.message));
            }
            let result = response
                .result
                .ok_or_else(|| Error::Internal("response missing result".to_string()))?;
            serde_json::from_str::<R>(result.get()).map_err(|e| Error::InvalidParams(e.to_string()))
        };

        // Receive is bounded by ctx: cancellation aborts the wait rather
        // than letting a hung peer block the caller indefinitely.
        let bounded = match ctx.remaining() {
            Some(remaining) => match tokio::time::timeout(remaining, roundtrip).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            },
            None => roundtrip.await,
        };

        match bounded {
            Ok(reply) => {
                self.pool.put(conn).await;
                Ok(reply)
            }
            Err(err) => {
                // §9 "Retry after partial write": never return a connection
                // that may have seen a partial write/read error.
                self.pool.destroy(conn).await;
                Err(err)
            }
        }
    }

    /// Fire-and-continue asynchronous call (§4.6 "Asynchronous call").
    /// Returns immediately; the sync call runs on a background task and
    /// signals completion on `done` (capacity >= 1) if given.
    pub fn go<A, R>(
        self: &Arc<Self>,
        method: &str,
        args: A,
        done: Option<tokio::sync::mpsc::Sender<Call>>,
    ) where
        A: serde::Serialize + Send + 'static,
        R: serde::de::DeserializeOwned + Send + 'static,
    {
        self.go_with_context::<A, R>(Ctx::with_timeout(Duration::from_secs(30)), method, args, done)
    }

    /// Like [`Client::go`] but with an explicit deadline/cancellation
    /// handle.
    pub fn go_with_context<A, R>(
        self: &Arc<Self>,
        ctx: Ctx,
        method: &str,
        args: A,
        done: Option<tokio::sync::mpsc::Sender<Call>>,
    ) where
        A: serde::Serialize + Send + 'static,
        R: serde::de::DeserializeOwned + Send + 'static,
    {
        let client = Arc::clone(self);
        let method = method.to_string();
        tokio::spawn(async move {
            let result: Result<R, Error> = client.call(ctx, &method, &args).await;
            let call = Call {
                method,
                error: result.err(),
            };
            if let Some(done) = done {
                let _ = done.try_send(call);
            }
        });
    }

    /// Run every call in `calls` concurrently; returns the first observed
    /// error, if any. Each call's own error is independently recorded on
    /// its `Call` record regardless of the aggregate return value
    /// (§4.6 "Batch").
    pub async fn batch<A, R>(
        self: &Arc<Self>,
        ctx: Ctx,
        calls: Vec<(String, A)>,
    ) -> (Vec<Call>, Option<Error>)
    where
        A: serde::Serialize + Send + 'static,
        R: serde::de::DeserializeOwned + Send + 'static,
    {
        let futures = calls.into_iter().map(|(method, args)| {
            let client = Arc::clone(self);
            async move {
                let result: Result<R, Error> = client.call(ctx, &method, &args).await;
                Call {
                    method,
                    error: result.err(),
                }
            }
        });
        let results = join_all(futures).await;
        let first_error = results
            .iter()
            .find_map(|c| c.error.as_ref().map(|e| e.to_string()))
            .map(Error::Internal);
        (results, first_error)
    }

    /// Exercise the full wire path (dial/lease, write, read, decode)
    /// against the server's reserved ping method, without requiring any
    /// registered handler.
    pub async fn ping(&self, ctx: Ctx) -> Result<(), Error> {
        let _: bool = self.call(ctx, PING_METHOD, &()).await?;
        Ok(())
    }

    /// CAS the closed flag; close the pool; stamp every still-pending call
    /// `ClientClosed`. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
        let mut pending = self.pending.lock().await;
        for (seq, call) in pending.drain() {
            debug!(seq, method = %call.method, "marking pending call ClientClosed");
        }
    }

    /// Close, but wait up to `timeout` for `pending_count()` to reach zero
    /// first.
    pub async fn close_gracefully(&self, timeout: Duration) {
        let _ = self.wait_for_pending(timeout).await;
        self.close().await;
    }

    /// Wait until there are no pending calls, or `timeout` elapses
    /// (returns `false` on timeout).
    pub async fn wait_for_pending(&self, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if self.pending.lock().await.is_empty() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Aggregate client observables: pending-call count, pool stats, and
    /// closed flag (§6 "Client public API").
    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            pending: self.pending_count().await,
            pool: self.pool_stats().await,
            closed: self.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
