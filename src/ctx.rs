//! Cancellation/deadline handle passed to blocking operations (§5
//! "Cancellation & timeouts").
//!
//! The source language carries a `context.Context`; this crate's
//! equivalent is a plain deadline-carrying value, since Rust's ownership
//! model and `tokio::time::timeout` already give cancellation-by-dropping
//! for free — a full cancellation-tree type would be machinery this core
//! does not need.

use std::time::{Duration, Instant};

/// A deadline, optionally already expired. Cloned freely; cheap.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    deadline: Option<Instant>,
}

impl Ctx {
    /// No deadline: never expires.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    /// Expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Expires at the given instant (may already be in the past).
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time remaining, or `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}
