//! Method registry: handler registration, validation, dispatch (§4.4).
//!
//! Rust has no runtime reflection, so per §9's design note ("Reflection
//! vs typed registration") this is a compile-time registry: a handler
//! implements [`Service`], which exposes a fixed table of method
//! descriptors built once at registration. The typed argument/reply
//! decoding lives in each descriptor's callable, matching §9's statement
//! that "the typed argument/reply decoding becomes the handler's own
//! responsibility, and the `InvalidParams` classification moves into the
//! decoder wrapper."
//!
//! Grounded on the grounding repo's `ipc::mod` dispatch (`service.method`
//! split, `METHOD_NOT_FOUND`/`INVALID_PARAMS` handling) and its
//! trait-object handler style (`agents::orchestrator`).

use crate::error::Error;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::value::RawValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Once, RwLock};

thread_local! {
    /// Stashed by [`install_panic_backtrace_hook`] at the moment a panic
    /// unwinds on this thread, since `catch_unwind`'s payload carries only
    /// the panic message, not a backtrace.
    static LAST_PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL_PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records a backtrace for this thread before
/// deferring to whatever hook was already installed. Idempotent.
fn install_panic_backtrace_hook() {
    INSTALL_PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // `force_capture` so the wire error's `data.backtrace` is
            // populated regardless of `RUST_BACKTRACE`, since a caller
            // debugging a remote panic has no way to set that env var.
            let backtrace = std::backtrace::Backtrace::force_capture();
            LAST_PANIC_BACKTRACE.with(|cell| *cell.borrow_mut() = Some(backtrace.to_string()));
            previous(info);
        }));
    });
}

/// A single eligible method on a registered service (§4.4 "Per-method
/// cache" / "Handler descriptor").
///
/// The callable receives the raw JSON parameter payload and returns the
/// raw JSON result payload, performing its own typed decode/encode and
/// classifying decode failures as [`Error::InvalidParams`].
pub type MethodFn =
    dyn Fn(&RawValue) -> BoxFuture<'static, Result<Box<RawValue>, Error>> + Send + Sync;

/// One callable method exposed by a [`Service`].
pub struct MethodDescriptor {
    /// Must begin with an upper-case letter (§4.4 "Signature contract").
    pub name: &'static str,
    pub call: Box<MethodFn>,
}

/// A handler object exposing a fixed table of eligible methods.
///
/// Implementations build their descriptor table once, typically in
/// `methods()`, by wrapping each typed `async fn(Arg) -> Result<Reply,
/// E>` method in a closure that deserializes `Arg`, invokes it, and
/// serializes `Reply` — this is the compile-time stand-in for the
/// source's runtime method inspection.
pub trait Service: Send + Sync {
    /// Default registration name (the handler's "type name"). Must be
    /// non-empty and begin with an upper-case letter when no explicit
    /// name is given at registration (§4.4).
    fn name(&self) -> &'static str;

    /// Build the method descriptor table. Called once at registration;
    /// the registry never calls this again.
    fn methods(self: std::sync::Arc<Self>) -> Vec<MethodDescriptor>;
}

struct RegisteredService {
    methods: HashMap<&'static str, Box<MethodFn>>,
}

/// The method registry: a read-mostly map from service name to its
/// method table, guarded by an RW-lock (§4.4 "Concurrency").
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, RegisteredService>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under its default name ([`Service::name`]).
    ///
    /// The default name must be exported (start with an upper-case
    /// letter) — this check only applies to the derived-name path, per
    /// §4.4 "Registration": an explicit name given to
    /// [`Registry::register_named`] is taken as-is.
    pub fn register(&self, handler: std::sync::Arc<dyn Service>) -> Result<(), Error> {
        let name = handler.name().to_string();
        if !name.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            return Err(Error::InvalidRequest(format!(
                "service name {name:?} must be exported (start with an upper-case letter)"
            )));
        }
        self.register_named(name, handler)
    }

    /// Register `handler` under an explicit `name`.
    ///
    /// Fails if `name` is empty, already registered, or the handler
    /// exposes zero eligible methods (§4.4 "Registration").
    pub fn register_named(
        &self,
        name: impl Into<String>,
        handler: std::sync::Arc<dyn Service>,
    ) -> Result<(), Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidRequest(
                "service name must not be empty".to_string(),
            ));
        }

        let descriptors = handler.methods();
        if descriptors.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "service {name:?} has no eligible methods"
            )));
        }
        let mut methods = HashMap::with_capacity(descriptors.len());
        for d in descriptors {
            methods.insert(d.name, d.call);
        }

        let mut services = self.services.write().unwrap();
        if services.contains_key(&name) {
            return Err(Error::InvalidRequest(format!(
                "service {name:?} already registered"
            )));
        }
        services.insert(name, RegisteredService { methods });
        Ok(())
    }

    /// Dispatch a raw call (§4.4 "Dispatch").
    ///
    /// The registry's read lock is held only long enough to look up the
    /// service and method and clone out nothing but the invocation — the
    /// actual handler call runs outside the lock.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        raw_params: &RawValue,
    ) -> Result<Box<RawValue>, Error> {
        let fut = {
            let services = self.services.read().unwrap();
            let svc = services
                .get(service)
                .ok_or_else(|| Error::MethodNotFound(format!("{service}.{method}")))?;
            let m = svc
                .methods
                .get(method)
                .ok_or_else(|| Error::MethodNotFound(format!("{service}.{method}")))?;
            (m.call)(raw_params)
        };
        // A handler panic becomes `Panic` rather than taking down the
        // caller's task (§4.4 step 5). The panic hook, not this frame,
        // captures the backtrace — it runs at the panic site itself,
        // before unwinding discards those frames.
        install_panic_backtrace_hook();
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                let backtrace = LAST_PANIC_BACKTRACE
                    .with(|cell| cell.borrow_mut().take())
                    .unwrap_or_else(|| "<backtrace unavailable>".to_string());
                Err(Error::Panic {
                    service: service.to_string(),
                    method: method.to_string(),
                    message,
                    backtrace,
                })
            }
        }
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.services.read().unwrap().contains_key(service)
    }
}

/// Wrap a typed async handler method into a [`MethodDescriptor::call`].
///
/// `f` receives the deserialized argument and produces the reply; decode
/// failures become [`Error::InvalidParams`] and handler errors become
/// [`Error::Internal`], matching §4.4 step 3/5.
pub fn typed_method<A, R, F, Fut>(name: &'static str, f: F) -> MethodDescriptor
where
    A: serde::de::DeserializeOwned + Send + 'static,
    R: serde::Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<R, Error>> + Send + 'static,
{
    MethodDescriptor {
        name,
        call: Box::new(move |raw: &RawValue| {
            let parsed: Result<A, _> = serde_json::from_str(raw.get());
            let fut = match parsed {
                Ok(arg) => {
                    let call_fut = f(arg);
                    Box::pin(async move {
                        let reply = call_fut.await?;
                        crate::codec::to_raw_value(&reply)
                    }) as BoxFuture<'static, Result<Box<RawValue>, Error>>
                }
                Err(e) => {
                    let msg = e.to_string();
                    Box::pin(async move { Err(Error::InvalidParams(msg)) })
                }
            };
            fut
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct AddReply {
        result: i64,
    }

    struct TestService;

    impl Service for TestService {
        fn name(&self) -> &'static str {
            "TestService"
        }

        fn methods(self: Arc<Self>) -> Vec<MethodDescriptor> {
            vec![typed_method("Add", |args: AddArgs| async move {
                Ok(AddReply { result: args.a + args.b })
            })]
        }
    }

    struct EmptyService;
    impl Service for EmptyService {
        fn name(&self) -> &'static str {
            "EmptyService"
        }
        fn methods(self: Arc<Self>) -> Vec<MethodDescriptor> {
            vec![]
        }
    }

    #[tokio::test]
    async fn dispatch_basic_add() {
        let registry = Registry::new();
        registry.register(Arc::new(TestService)).unwrap();

        let params = RawValue::from_string(r#"{"a":10,"b":20}"#.to_string()).unwrap();
        let raw = registry.call("TestService", "Add", &params).await.unwrap();
        let reply: AddReply = serde_json::from_str(raw.get()).unwrap();
        assert_eq!(reply.result, 30);
    }

    #[tokio::test]
    async fn dispatch_unknown_method_not_found() {
        let registry = Registry::new();
        registry.register(Arc::new(TestService)).unwrap();
        let params = RawValue::from_string("{}".to_string()).unwrap();
        let err = registry
            .call("TestService", "NonExistent", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn dispatch_unknown_service_not_found() {
        let registry = Registry::new();
        let params = RawValue::from_string("{}".to_string()).unwrap();
        let err = registry.call("Nope", "Add", &params).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn dispatch_bad_params_invalid_params() {
        let registry = Registry::new();
        registry.register(Arc::new(TestService)).unwrap();
        let params = RawValue::from_string(r#"{"a":"not a number"}"#.to_string()).unwrap();
        let err = registry.call("TestService", "Add", &params).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn register_empty_service_fails() {
        let registry = Registry::new();
        let err = registry.register(Arc::new(EmptyService)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn register_duplicate_name_fails() {
        let registry = Registry::new();
        registry.register(Arc::new(TestService)).unwrap();
        let err = registry.register(Arc::new(TestService)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn register_named_rejects_empty_name() {
        let registry = Registry::new();
        let err = registry
            .register_named("", Arc::new(TestService))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    struct PanicService;
    impl Service for PanicService {
        fn name(&self) -> &'static str {
            "PanicService"
        }
        fn methods(self: Arc<Self>) -> Vec<MethodDescriptor> {
            vec![typed_method("Boom", |_args: AddArgs| async move {
                panic!("handler exploded");
                #[allow(unreachable_code)]
                Ok(AddReply { result: 0 })
            })]
        }
    }

    #[tokio::test]
    async fn dispatch_panicking_handler_becomes_panic_error_with_backtrace() {
        let registry = Registry::new();
        registry.register(Arc::new(PanicService)).unwrap();
        let params = RawValue::from_string(r#"{"a":1,"b":2}"#.to_string()).unwrap();
        let err = registry.call("PanicService", "Boom", &params).await.unwrap_err();
        match err {
            Error::Panic {
                service,
                method,
                message,
                backtrace,
            } => {
                assert_eq!(service, "PanicService");
                assert_eq!(method, "Boom");
                assert!(message.contains("handler exploded"));
                assert!(!backtrace.is_empty());
            }
            other => panic!("expected Error::Panic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_populates_rpc_error_data() {
        use crate::protocol::RpcError;

        let registry = Registry::new();
        registry.register(Arc::new(PanicService)).unwrap();
        let params = RawValue::from_string(r#"{"a":1,"b":2}"#.to_string()).unwrap();
        let err = registry.call("PanicService", "Boom", &params).await.unwrap_err();
        let rpc_err = RpcError::from(&err);
        let data = rpc_err.data.expect("panic data must be populated");
        assert!(data["panic"].as_str().unwrap().contains("handler exploded"));
        assert!(!data["backtrace"].as_str().unwrap().is_empty());
    }

    struct LowercaseNamedService;
    impl Service for LowercaseNamedService {
        fn name(&self) -> &'static str {
            "lowercaseService"
        }
        fn methods(self: Arc<Self>) -> Vec<MethodDescriptor> {
            vec![typed_method("Add", |args: AddArgs| async move {
                Ok(AddReply { result: args.a + args.b })
            })]
        }
    }

    #[test]
    fn register_rejects_lowercase_default_name() {
        let registry = Registry::new();
        let err = registry
            .register(Arc::new(LowercaseNamedService))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn register_named_accepts_lowercase_explicit_name() {
        let registry = Registry::new();
        registry
            .register_named("testService", Arc::new(TestService))
            .unwrap();
        assert!(registry.is_registered("testService"));
    }
}
