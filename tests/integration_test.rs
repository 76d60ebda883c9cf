//! End-to-end tests: a real server on a random TCP port, a real client
//! dialing it, full encode/dispatch/decode round trips.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use wire_rpc::registry::{typed_method, MethodDescriptor, Service};
use wire_rpc::{Client, ClientConfig, Ctx, Error, Server};

#[derive(Serialize, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[derive(Serialize, Deserialize)]
struct AddReply {
    result: i64,
}

struct Calculator;

impl Service for Calculator {
    fn name(&self) -> &'static str {
        "Calculator"
    }

    fn methods(self: Arc<Self>) -> Vec<MethodDescriptor> {
        vec![
            typed_method("Add", |args: AddArgs| async move {
                Ok(AddReply {
                    result: args.a + args.b,
                })
            }),
            typed_method("Slow", |args: AddArgs| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(AddReply {
                    result: args.a + args.b,
                })
            }),
        ]
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn start_test_server(workers: i64) -> (Arc<Server>, String) {
    init_tracing();
    let server = Arc::new(Server::new(workers));
    server.register(Arc::new(Calculator)).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let serve_server = Arc::clone(&server);
    let bind_addr = addr.to_string();
    tokio::spawn(async move {
        serve_server.serve("tcp", &bind_addr).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, addr.to_string())
}

/// Scenario 1: basic add.
#[tokio::test]
async fn basic_add() {
    let (_server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));
    let reply: AddReply = client
        .call(Ctx::background(), "Calculator.Add", &AddArgs { a: 2, b: 3 })
        .await
        .unwrap();
    assert_eq!(reply.result, 5);
}

/// Scenario 2: method not found.
#[tokio::test]
async fn method_not_found() {
    let (_server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));
    let err = client
        .call::<_, AddReply>(Ctx::background(), "Calculator.DoesNotExist", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

/// Scenario 3: concurrent fan-out, many callers sharing one client and
/// pool (§8: "50 goroutines x 10 calls each, all succeed, pool stats
/// settle back to idle <= max_idle").
#[tokio::test]
async fn concurrent_fan_out() {
    let (_server, addr) = start_test_server(100).await;
    let mut config = ClientConfig::new(addr);
    config.max_active = 20;
    config.max_idle = 10;
    let client = Arc::new(Client::new(config));

    let mut tasks = Vec::new();
    for caller in 0..50i64 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for i in 0..10i64 {
                let reply: AddReply = client
                    .call(
                        Ctx::background(),
                        "Calculator.Add",
                        &AddArgs { a: caller, b: i },
                    )
                    .await
                    .unwrap();
                assert_eq!(reply.result, caller + i);
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = client.pool_stats().await;
    assert!(stats.idle <= 10, "idle connections stayed within max_idle: {stats:?}");
}

/// Scenario 4: a context deadline that has already elapsed returns the
/// cancellation sentinel without dispatching a request at all.
#[tokio::test]
async fn deadline_already_elapsed() {
    let (_server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));
    let past = Ctx::with_deadline(tokio::time::Instant::now().into_std() - Duration::from_secs(1));
    let err = client
        .call::<_, AddReply>(past, "Calculator.Slow", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
}

/// A deadline that elapses mid-flight (during the slow handler) also
/// surfaces as a timeout rather than hanging the caller.
#[tokio::test]
async fn deadline_elapses_mid_call() {
    let (_server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));
    let ctx = Ctx::with_timeout(Duration::from_millis(20));
    let err = client
        .call::<_, AddReply>(ctx, "Calculator.Slow", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
}

/// Scenario 5: pool reuse — max_active=5, max_idle=2, repeated calls stay
/// within bound and idle settles at max_idle once calls stop.
#[tokio::test]
async fn pool_reuse_within_bounds() {
    let (_server, addr) = start_test_server(10).await;
    let mut config = ClientConfig::new(addr);
    config.max_active = 5;
    config.max_idle = 2;
    let client = Client::new(config);

    for i in 0..30i64 {
        let _reply: AddReply = client
            .call(Ctx::background(), "Calculator.Add", &AddArgs { a: i, b: 1 })
            .await
            .unwrap();
        assert!(client.pool_stats().await.active <= 5);
    }
    let stats = client.pool_stats().await;
    assert!(stats.idle <= 2);
}

/// Scenario 6: graceful shutdown waits for in-flight handlers, then
/// stops accepting.
#[tokio::test]
async fn graceful_shutdown_drains_in_flight() {
    let (server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));

    let slow_call = {
        let client_ref: &Client = &client;
        async move {
            let reply: AddReply = client_ref
                .call(Ctx::background(), "Calculator.Slow", &AddArgs { a: 4, b: 6 })
                .await
                .unwrap();
            reply.result
        }
    };

    let (result, ()) = tokio::join!(slow_call, async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown(Duration::from_secs(2)).await;
    });
    assert_eq!(result, 10);
    assert!(server.is_shutdown());
}

#[tokio::test]
async fn ping_round_trip() {
    let (_server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));
    client.ping(Ctx::background()).await.unwrap();
}

#[tokio::test]
async fn client_close_marks_pending_and_rejects_new_calls() {
    let (_server, addr) = start_test_server(4).await;
    let client = Client::new(ClientConfig::new(addr));
    client.close().await;
    let err = client
        .call::<_, AddReply>(Ctx::background(), "Calculator.Add", &AddArgs { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientClosed));
}
