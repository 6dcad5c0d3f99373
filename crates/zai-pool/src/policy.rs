//! Scan order for credential selection
//!
//! Selection walks the active credentials starting from the index a
//! [`ScanPolicy`] picks, wrapping around once.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;

/// Picks the starting index for a selection scan.
pub trait ScanPolicy: Send + Sync {
    /// Start index in `0..candidates`. Only called with `candidates > 0`.
    fn start(&self, candidates: usize) -> usize;

    fn name(&self) -> &'static str;
}

/// Always start at the oldest credential.
#[derive(Debug, Default)]
pub struct InsertionOrder;

impl ScanPolicy for InsertionOrder {
    fn start(&self, _candidates: usize) -> usize {
        0
    }

    fn name(&self) -> &'static str {
        "insertion"
    }
}

/// Advance the start index on every scan.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next_index: AtomicUsize,
}

impl ScanPolicy for RoundRobin {
    fn start(&self, candidates: usize) -> usize {
        self.next_index.fetch_add(1, Ordering::Relaxed) % candidates
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Configured scan order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOrder {
    #[default]
    Insertion,
    RoundRobin,
}

impl ScanOrder {
    pub fn policy(self) -> Box<dyn ScanPolicy> {
        match self {
            ScanOrder::Insertion => Box::new(InsertionOrder),
            ScanOrder::RoundRobin => Box::new(RoundRobin::default()),
        }
    }
}
