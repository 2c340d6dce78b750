//! In-memory collaborators for exercising the queue without Postgres, a
//! tracker, an oracle, or a broker.
//!
//! [`MemStore`] honours the same invariants the SQL schema enforces;
//! the fakes are scripted via helper methods and record everything the
//! queue does to them. The end-to-end scenarios live under `tests/`.

mod fakes;
mod mem_store;

pub use fakes::{FakeBus, FakeOracle, FakeTracker};
pub use mem_store::MemStore;

use std::sync::Arc;

use alq_queue::QueueDeps;

/// Bundle of fresh fakes plus the deps struct the queue components take.
pub struct TestHarness {
    pub store: Arc<MemStore>,
    pub tracker: Arc<FakeTracker>,
    pub oracle: Arc<FakeOracle>,
    pub bus: Arc<FakeBus>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemStore::new()),
            tracker: Arc::new(FakeTracker::new()),
            oracle: Arc::new(FakeOracle::new()),
            bus: Arc::new(FakeBus::new()),
        }
    }

    pub fn deps(&self) -> QueueDeps {
        QueueDeps {
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            oracle: self.oracle.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
