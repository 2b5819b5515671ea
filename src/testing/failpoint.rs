//! Named failure injection points for the region store.
//!
//! A [`FailpointRegistry`] is handed to a region store through
//! [`crate::config::ProviderConfig::with_failpoints`]. The store consults it
//! before each step of an operation:
//!
//! - `region_store::create`
//! - `region_store::publish` (between the split remainder and the live header)
//! - `region_store::write`
//! - `region_store::persist`
//! - `region_store::read`
//! - `region_store::remove`
//! - `region_store::sync`
//!
//! Appending `:<target id>` to a name arms it for one target only.
//!
//! An armed failpoint turns the step into an injected I/O error, delays it,
//! or panics.
//!
//! ```rust,ignore
//! use silo::testing::{FailpointAction, FailpointRegistry};
//!
//! let failpoints = FailpointRegistry::new();
//! failpoints.enable("region_store::persist", FailpointAction::Error);
//! // create_write_persist now fails and removes the region it created
//! failpoints.disable("region_store::persist");
//! ```

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// What an armed failpoint does when reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailpointAction {
    /// Fail every hit.
    Error,

    /// Fail the first hit only.
    OnceError,

    /// Let the first N hits through, fail the rest.
    FailAfter(u64),

    /// Delay the step, then let it proceed.
    Sleep(Duration),

    /// Panic, simulating a crash in the middle of the step.
    Panic,
}

#[derive(Debug)]
struct Armed {
    action: FailpointAction,
    hits: AtomicU64,
    fired: AtomicU64,
}

/// Armed failpoints by name.
#[derive(Debug, Default)]
pub struct FailpointRegistry {
    armed: DashMap<String, Armed>,
}

impl FailpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `name`, replacing any previous action and resetting its counts.
    pub fn enable(&self, name: &str, action: FailpointAction) {
        self.armed.insert(
            name.to_string(),
            Armed {
                action,
                hits: AtomicU64::new(0),
                fired: AtomicU64::new(0),
            },
        );
    }

    pub fn disable(&self, name: &str) {
        self.armed.remove(name);
    }

    pub fn disable_all(&self) {
        self.armed.clear();
    }

    /// Times `name` was reached while armed.
    pub fn hit_count(&self, name: &str) -> u64 {
        self.armed
            .get(name)
            .map_or(0, |a| a.hits.load(Ordering::SeqCst))
    }

    /// Times `name` actually injected a failure.
    pub fn triggered_count(&self, name: &str) -> u64 {
        self.armed
            .get(name)
            .map_or(0, |a| a.fired.load(Ordering::SeqCst))
    }

    /// Names of armed failpoints, sorted.
    pub fn active_failpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.armed.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Called by the store at `name`. Returns the injected error, if any.
    pub fn check(&self, name: &str) -> Result<()> {
        // Copy out what we need so no map guard is held while sleeping.
        let (action, hit) = match self.armed.get(name) {
            Some(armed) => (armed.action, armed.hits.fetch_add(1, Ordering::SeqCst) + 1),
            None => return Ok(()),
        };

        let fire = match action {
            FailpointAction::Error | FailpointAction::Panic => true,
            FailpointAction::OnceError => hit == 1,
            FailpointAction::FailAfter(n) => hit > n,
            FailpointAction::Sleep(d) => {
                std::thread::sleep(d);
                false
            }
        };
        if !fire {
            return Ok(());
        }

        if let Some(armed) = self.armed.get(name) {
            armed.fired.fetch_add(1, Ordering::SeqCst);
        }
        debug!(failpoint = name, ?action, "Failpoint fired");

        if action == FailpointAction::Panic {
            panic!("failpoint triggered: {name}");
        }
        Err(Error::Io(io::Error::other(format!("failpoint triggered: {name}"))))
    }
}
