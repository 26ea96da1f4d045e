//! Process-wide identity injected into a run.
//!
//! The orchestrator never reads the wall clock or the current user directly;
//! it asks the `RunContext` it was handed, so decisions and manifest records
//! are reproducible under test.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of timestamps for log headers and manifest records.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Identity of one run: who runs it, when, and under which id.
pub struct RunContext {
    pub run_id: Uuid,
    pub operator: String,
    clock: Box<dyn Clock>,
}

impl RunContext {
    /// Context with a fresh run id and the system clock.
    pub fn new(operator: impl Into<String>) -> Self {
        RunContext {
            run_id: Uuid::new_v4(),
            operator: operator.into(),
            clock: Box::new(SystemClock),
        }
    }

    /// Replace the clock (tests pin time with `FixedClock`).
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("operator", &self.operator)
            .finish_non_exhaustive()
    }
}
