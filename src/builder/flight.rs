//! Single-flight coalescing of concurrent builds.
//!
//! When a build of some target is already running, later requests attach
//! to it and block for its result instead of racing it. A flight covers a
//! whole split-output group, so siblings produced by the same `build`
//! call coalesce too.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::errors::BuildError;

/// Outcome broadcast to every waiter: whether the target was rebuilt, or
/// the failure.
pub type FlightResult = Result<bool, BuildError>;

struct Flight {
    result: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Flight {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> FlightResult {
        let mut result = self.result.lock().unwrap();
        while result.is_none() {
            result = self.done.wait(result).unwrap();
        }
        result.clone().unwrap()
    }

    fn complete(&self, outcome: FlightResult) {
        let mut result = self.result.lock().unwrap();
        *result = Some(outcome);
        self.done.notify_all();
    }
}

/// What `claim` decided for the caller.
pub enum Claim {
    /// Nobody is building this group; the caller must do the work and
    /// complete the guard.
    Leader(FlightGuard),
    /// Someone else is building it; wait for their result.
    Follower(Waiter),
}

/// Handle held by a follower.
pub struct Waiter {
    flight: Arc<Flight>,
}

impl Waiter {
    /// Block until the leader finishes and return its outcome.
    pub fn wait(self) -> FlightResult {
        self.flight.wait()
    }
}

/// Leadership of one in-flight group. If dropped without completing (a
/// panicking capability), waiters receive a failure rather than hanging.
pub struct FlightGuard {
    table: Arc<Mutex<HashMap<String, Arc<Flight>>>>,
    keys: Vec<String>,
    flight: Arc<Flight>,
    completed: bool,
}

impl FlightGuard {
    /// Publish the outcome to all waiters and retire the flight.
    pub fn complete(mut self, outcome: FlightResult) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FlightResult) {
        if self.completed {
            return;
        }
        self.completed = true;

        // Remove from the table before broadcasting, so a request landing
        // after completion starts a fresh flight (and sees the result on
        // disk) instead of adopting a finished one.
        {
            let mut table = self.table.lock().unwrap();
            for key in &self.keys {
                table.remove(key);
            }
        }
        self.flight.complete(outcome);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            let target = self.keys.first().cloned().unwrap_or_default();
            self.finish(Err(BuildError::BuildFailed {
                label: String::new(),
                output: target.clone(),
                argv: None,
                stderr: None,
                message: "builder terminated without reporting a result".to_string(),
            }));
        }
    }
}

/// The process-wide table of in-flight builds.
#[derive(Default)]
pub struct FlightTable {
    inner: Arc<Mutex<HashMap<String, Arc<Flight>>>>,
}

impl FlightTable {
    pub fn new() -> Self {
        FlightTable::default()
    }

    /// Claim a build of `keys` (a split-output group, sorted by the
    /// caller). Returns leadership if none of the keys is in flight;
    /// otherwise a waiter on the existing flight.
    ///
    /// The lock is held only for the claim itself, never across build
    /// work.
    pub fn claim(&self, keys: &[String]) -> Claim {
        let mut table = self.inner.lock().unwrap();

        for key in keys {
            if let Some(flight) = table.get(key) {
                return Claim::Follower(Waiter {
                    flight: Arc::clone(flight),
                });
            }
        }

        let flight = Arc::new(Flight::new());
        for key in keys {
            table.insert(key.clone(), Arc::clone(&flight));
        }
        Claim::Leader(FlightGuard {
            table: Arc::clone(&self.inner),
            keys: keys.to_vec(),
            flight,
            completed: false,
        })
    }

    /// Number of groups currently in flight (counting each key).
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
