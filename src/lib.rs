//! A minimal JSON-RPC 2.0 runtime: wire codec, connection pool, bounded
//! worker pool, compile-time method registry, and a call-multiplexing
//! client, all over newline-delimited TCP.
//!
//! The public surface is small by design: [`server::Server`] to expose
//! [`registry::Service`] handlers, [`client::Client`] to call them.
//! Everything else (`codec`, `protocol`, `pool`, `workerpool`, `arena`,
//! `ctx`, `error`) is exported for composition and testing but is not
//! required for the common path.

pub mod arena;
pub mod client;
pub mod codec;
pub mod ctx;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod workerpool;

pub use client::{Client, ClientConfig};
pub use ctx::Ctx;
pub use error::{Error, Result};
pub use registry::{typed_method, MethodDescriptor, Service};
pub use server::Server;
