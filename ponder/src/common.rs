// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-process context handed to every component constructor. There are no
//! process-wide singletons; anything a component needs beyond its own inputs
//! travels through [`Common`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::Registry;

use crate::config::Options;
use crate::metrics::PonderMetrics;

#[derive(Clone)]
pub struct Common {
    pub options: Arc<Options>,
    pub metrics: Arc<PonderMetrics>,
}

impl Common {
    pub fn new(options: Options, registry: &Registry) -> Self {
        Self {
            options: Arc::new(options),
            metrics: Arc::new(PonderMetrics::new(registry)),
        }
    }

    /// Context with a fresh registry, for tests.
    pub fn for_testing() -> Self {
        Self::new(Options::default(), &Registry::new())
    }
}

/// Time source for lease bookkeeping. The manual variant lets tests advance
/// the clock past a lease TTL without sleeping.
#[derive(Clone, Default)]
pub struct Clock {
    manual: Option<Arc<AtomicI64>>,
}

impl Clock {
    pub fn system() -> Self {
        Self { manual: None }
    }

    pub fn manual(start_ms: i64) -> Self {
        Self {
            manual: Some(Arc::new(AtomicI64::new(start_ms))),
        }
    }

    pub fn now_ms(&self) -> i64 {
        match &self.manual {
            Some(v) => v.load(Ordering::SeqCst),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
        }
    }

    /// No-op on the system clock.
    pub fn advance_ms(&self, delta: i64) {
        if let Some(v) = &self.manual {
            v.fetch_add(delta, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = Clock::manual(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance_ms(60_001);
        assert_eq!(clock.now_ms(), 61_001);
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = Clock::system();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        // advance_ms is a no-op for the system clock
        clock.advance_ms(1_000_000);
        assert!(clock.now_ms() < a + 1_000_000);
    }
}
