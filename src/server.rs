//! Accept loop and per-connection request/response cycle (§4.5).
//!
//! Grounded on the grounding repo's `ipc::mod` accept loop
//! (`accept_async_with_config`, per-connection read/dispatch/write cycle)
//! restructured around [`crate::workerpool::WorkerPool`] in place of one
//! bare `tokio::spawn` per connection, and its shutdown CAS pattern.

use crate::codec::{decode_request, encode_response_or_fallback, error_response, to_raw_value};
use crate::error::Error;
use crate::registry::Registry;
use crate::workerpool::WorkerPool;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Server-side per-connection read idle deadline (§4.5, §5).
const READ_IDLE_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Server-side per-connection write deadline (§5).
const WRITE_DEADLINE: Duration = Duration::from_secs(30);

/// `workers <= 0` coerces to this (§6 "Server public API").
const DEFAULT_WORKERS: usize = 100;

/// A JSON-RPC server: registry + worker pool + accept loop.
pub struct Server {
    registry: Arc<Registry>,
    workers: Arc<WorkerPool>,
    shutting_down: Arc<AtomicBool>,
    in_flight: Arc<AtomicU64>,
    addr: std::sync::Mutex<Option<std::net::SocketAddr>>,
    /// Unblocks a pending `listener.accept()` on shutdown (§4.5 "close the
    /// listener"). `notify_one`'s stored-permit semantics mean `close`/
    /// `shutdown` racing ahead of `serve`'s select is never a missed wakeup.
    shutdown_notify: Arc<Notify>,
}

impl Server {
    /// `workers <= 0` coerces to 100 (§6).
    pub fn new(workers: i64) -> Self {
        let workers = if workers <= 0 {
            DEFAULT_WORKERS
        } else {
            workers as usize
        };
        Self {
            registry: Arc::new(Registry::new()),
            workers: Arc::new(WorkerPool::with_default_queue(workers)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicU64::new(0)),
            addr: std::sync::Mutex::new(None),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn crate::registry::Service>) -> Result<(), Error> {
        self.registry.register(handler)
    }

    pub fn register_named(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn crate::registry::Service>,
    ) -> Result<(), Error> {
        self.registry.register_named(name, handler)
    }

    /// Bind `address` on `network` (only `"tcp"` is supported) and run the
    /// accept loop until shutdown. Blocks.
    pub async fn serve(&self, network: &str, address: &str) -> Result<(), Error> {
        if network != "tcp" {
            return Err(Error::InvalidConn(format!(
                "unsupported network family {network:?}"
            )));
        }
        let listener = TcpListener::bind(address).await?;
        *self.addr.lock().unwrap() = Some(listener.local_addr()?);
        info!(address, "server listening");

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                debug!("accept loop exiting: shutting down");
                break;
            }
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.shutdown_notify.notified() => {
                    debug!("accept loop exiting: shutdown signaled");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if self.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let registry = Arc::clone(&self.registry);
            let in_flight = Arc::clone(&self.in_flight);
            in_flight.fetch_add(1, Ordering::SeqCst);

            let submitted = self
                .workers
                .submit(move || {
                    Box::pin(async move {
                        if let Err(e) = handle_connection(stream, registry).await {
                            debug!(peer = %peer, error = %e, "connection handler ended");
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .await;

            if let Err(e) = submitted {
                warn!(error = %e, "worker pool rejected connection; closing it and stopping accept loop");
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        }
        Ok(())
    }

    /// Non-graceful shutdown: close the worker pool immediately. Idempotent.
    pub async fn close(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_notify.notify_one();
        self.workers.close().await;
    }

    /// Graceful shutdown: stop accepting, wait for in-flight connection
    /// handlers to finish (bounded by `deadline`), then close the worker
    /// pool regardless. Idempotent.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_notify.notify_one();
        let start = tokio::time::Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                warn!("graceful shutdown deadline elapsed with connections still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.workers.close().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> Option<std::net::SocketAddr> {
        *self.addr.lock().unwrap()
    }
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<(), Error> {
    stream.set_nodelay(true).ok();
    let mut io = BufStream::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(READ_IDLE_DEADLINE, io.read_until(b'\n', &mut line));
        let n = match read.await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                debug!("connection idle deadline elapsed");
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(()); // EOF: peer closed cleanly
        }
        let content = if line.last() == Some(&b'\n') {
            &line[..line.len() - 1]
        } else {
            &line[..]
        };

        let response_bytes = process_one(content, &registry).await;

        let write = tokio::time::timeout(WRITE_DEADLINE, async {
            io.write_all(&response_bytes).await?;
            io.flush().await
        });
        write.await.map_err(|_| Error::Timeout)?.map_err(Error::Io)?;
    }
}

/// Decode, dispatch, and re-encode a single request line (§4.5 "Request
/// processing"). Never fails — any error along the way is turned into an
/// encoded error response.
async fn process_one(line: &[u8], registry: &Registry) -> Vec<u8> {
    let request = match decode_request(line) {
        Ok(req) => req,
        Err(e) => {
            let resp = error_response(None, &e);
            return encode_response_or_fallback(&resp);
        }
    };

    if request.method == PING_METHOD {
        // Reserved method answered internally (SPEC_FULL §10.5): exercises
        // the full wire path without requiring a registered handler.
        let result = to_raw_value(&true).expect("bool serialization cannot fail");
        let resp = crate::protocol::Response::success(request.id, result);
        return encode_response_or_fallback(&resp);
    }

    let Some((service, method)) = request.method.split_once('.') else {
        let resp = error_response(
            Some(request.id),
            &Error::MethodNotFound(request.method.clone()),
        );
        return encode_response_or_fallback(&resp);
    };
    if service.is_empty() || method.is_empty() {
        let resp = error_response(
            Some(request.id),
            &Error::MethodNotFound(request.method.clone()),
        );
        return encode_response_or_fallback(&resp);
    }

    let empty_params = serde_json::value::RawValue::from_string("null".to_string()).unwrap();
    let params = request.params.as_deref().unwrap_or(&empty_params);

    let resp = match registry.call(service, method, params).await {
        Ok(result) => crate::protocol::Response::success(request.id, result),
        Err(e) => error_response(Some(request.id), &e),
    };
    encode_response_or_fallback(&resp)
}

/// Reserved method name used by [`crate::client::Client::ping`], answered
/// internally without registry dispatch (SPEC_FULL §10.5).
pub const PING_METHOD: &str = "__wire_rpc.Ping";
