//! Striped counters for the per-request hot paths.
//!
//! Every submitted metric bumps several counters (catalog calls, dispatcher
//! received/completed, trace point invocations). A single `AtomicU64`
//! bounces between the cores running pool workers, so each counter keeps a
//! fixed set of cache-line-aligned stripes and a thread always writes the
//! same stripe. Reads sum the stripes and only happen when stats are
//! collected.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Stripes per counter. Pool sizes above this share stripes.
const STRIPES: usize = 16;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Handed out round-robin the first time a thread touches any counter.
    static THREAD_STRIPE: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed) % STRIPES;
}

#[repr(align(128))]
#[derive(Debug, Default)]
struct Stripe(AtomicU64);

/// A monotonically increasing counter striped across cache lines.
#[derive(Debug, Default)]
pub struct ShardedCounter {
    stripes: [Stripe; STRIPES],
}

impl ShardedCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        let stripe = THREAD_STRIPE.with(|s| *s);
        self.stripes[stripe].0.fetch_add(n, Ordering::Relaxed);
    }

    /// Sum over all stripes. Concurrent writers may or may not be included.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.stripes
            .iter()
            .map(|s| s.0.load(Ordering::Relaxed))
            .fold(0u64, u64::wrapping_add)
    }
}
