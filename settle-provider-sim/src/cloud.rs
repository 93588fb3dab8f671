//! In-memory simulated cloud
//!
//! Every record carries a timeline: the pending states of its latest
//! operation, each held for one step, followed by the state it settles in.
//! Time is read from tokio's clock, so paused-time tests advance resources
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use settle_core::resource::{LifecycleState, Resource, ResourceHandle, Value};
use settle_core::waiter::FetchError;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::resources::{FAILED_STATE, KindProfile};

/// Default time each pending state is held
pub const DEFAULT_STEP: Duration = Duration::from_secs(5);

/// Errors reported by the simulated backend
#[derive(Debug, Error)]
pub enum SimError {
    #[error("request throttled")]
    Throttled,

    #[error("no such resource: {0}")]
    NotFound(ResourceHandle),

    #[error("invalid {kind}: {message}")]
    Invalid { kind: String, message: String },

    #[error("{handle} is {state} and cannot be modified")]
    Conflict {
        handle: ResourceHandle,
        state: String,
    },
}

#[derive(Debug)]
struct Timeline {
    started: Instant,
    step: Duration,
    pending: Vec<LifecycleState>,
    /// `None` once the resource is gone
    settled: Option<LifecycleState>,
}

impl Timeline {
    fn start(step: Duration, pending: &[&str], settled: Option<&str>) -> Self {
        Self {
            started: Instant::now(),
            step,
            pending: pending.iter().map(|s| LifecycleState::from(*s)).collect(),
            settled: settled.map(LifecycleState::from),
        }
    }

    fn state_at(&self, now: Instant) -> Option<LifecycleState> {
        let elapsed = now.saturating_duration_since(self.started);
        let mut offset = Duration::ZERO;
        for state in &self.pending {
            offset += self.step;
            if elapsed < offset {
                return Some(state.clone());
            }
        }
        self.settled.clone()
    }
}

#[derive(Debug)]
struct Record {
    kind: &'static str,
    attributes: HashMap<String, Value>,
    time_created: DateTime<Utc>,
    timeline: Timeline,
}

#[derive(Debug, Default)]
struct Faults {
    transient_errors: u32,
    fail_next_create: Vec<String>,
}

/// Snapshot of one simulated resource
#[derive(Debug, Clone, PartialEq)]
pub struct SimSnapshot {
    pub kind: &'static str,
    pub state: LifecycleState,
    pub attributes: HashMap<String, Value>,
    pub time_created: DateTime<Utc>,
}

/// Simulated backend shared by all kinds of a provider
#[derive(Debug)]
pub struct SimCloud {
    step: Duration,
    records: Mutex<BTreeMap<ResourceHandle, Record>>,
    faults: Mutex<Faults>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new(DEFAULT_STEP)
    }
}

impl SimCloud {
    /// Create a backend holding each pending state for `step`
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            records: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<ResourceHandle, Record>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` state fetches fail with a transient error
    pub fn inject_transient_errors(&self, count: u32) {
        self.faults().transient_errors += count;
    }

    /// Make the next create of `kind` settle in `FAILED`
    pub fn fail_next_create(&self, kind: &str) {
        self.faults().fail_next_create.push(kind.to_string());
    }

    pub fn create(
        &self,
        profile: &'static KindProfile,
        resource: &Resource,
    ) -> Result<ResourceHandle, SimError> {
        (profile.validate)(resource).map_err(|message| SimError::Invalid {
            kind: profile.kind.to_string(),
            message,
        })?;

        let fails = {
            let mut faults = self.faults();
            match faults.fail_next_create.iter().position(|k| k == profile.kind) {
                Some(index) => {
                    faults.fail_next_create.remove(index);
                    true
                }
                None => false,
            }
        };

        let lifecycle = &profile.create;
        let timeline = if fails {
            let first = &lifecycle.pending[..lifecycle.pending.len().min(1)];
            Timeline::start(self.step, first, Some(FAILED_STATE))
        } else {
            Timeline::start(self.step, lifecycle.pending, Some(lifecycle.target))
        };

        let handle = ResourceHandle::new(format!("sim-{}-{}", profile.kind, Uuid::new_v4()));
        debug!("sim: creating {} ({})", handle, resource.id);
        self.records().insert(
            handle.clone(),
            Record {
                kind: profile.kind,
                attributes: resource.attributes.clone(),
                time_created: Utc::now(),
                timeline,
            },
        );
        Ok(handle)
    }

    pub fn update(
        &self,
        profile: &'static KindProfile,
        handle: &ResourceHandle,
        resource: &Resource,
    ) -> Result<(), SimError> {
        (profile.validate)(resource).map_err(|message| SimError::Invalid {
            kind: profile.kind.to_string(),
            message,
        })?;

        let now = Instant::now();
        let mut records = self.records();
        let record = records
            .get_mut(handle)
            .ok_or_else(|| SimError::NotFound(handle.clone()))?;
        let current = record
            .timeline
            .state_at(now)
            .ok_or_else(|| SimError::NotFound(handle.clone()))?;
        if current != profile.create.target {
            return Err(SimError::Conflict {
                handle: handle.clone(),
                state: current.to_string(),
            });
        }

        let lifecycle = &profile.update;
        record.attributes = resource.attributes.clone();
        record.timeline = Timeline::start(self.step, lifecycle.pending, Some(lifecycle.target));
        debug!("sim: updating {}", handle);
        Ok(())
    }

    /// Start deleting a resource. Deleting a resource that is already gone
    /// succeeds.
    pub fn delete(
        &self,
        profile: &'static KindProfile,
        handle: &ResourceHandle,
    ) -> Result<(), SimError> {
        let now = Instant::now();
        let mut records = self.records();
        let record = records
            .get_mut(handle)
            .ok_or_else(|| SimError::NotFound(handle.clone()))?;

        let lifecycle = &profile.delete;
        let current = record.timeline.state_at(now);
        let already_deleted = match &current {
            None => true,
            Some(state) => {
                state == lifecycle.target || lifecycle.pending.contains(&state.as_str())
            }
        };
        if already_deleted {
            return Ok(());
        }

        let settled = (!lifecycle.vanishes).then_some(lifecycle.target);
        record.timeline = Timeline::start(self.step, lifecycle.pending, settled);
        debug!("sim: deleting {}", handle);
        Ok(())
    }

    /// Current lifecycle state, as a poller sees it
    pub fn fetch_state(&self, handle: &ResourceHandle) -> Result<LifecycleState, FetchError> {
        {
            let mut faults = self.faults();
            if faults.transient_errors > 0 {
                faults.transient_errors -= 1;
                return Err(FetchError::transient(SimError::Throttled));
            }
        }

        let now = Instant::now();
        self.records()
            .get(handle)
            .and_then(|record| record.timeline.state_at(now))
            .ok_or(FetchError::NotFound)
    }

    /// Current view of a resource, `None` if it does not exist
    pub fn snapshot(&self, handle: &ResourceHandle) -> Option<SimSnapshot> {
        let now = Instant::now();
        let records = self.records();
        let record = records.get(handle)?;
        let state = record.timeline.state_at(now)?;
        Some(SimSnapshot {
            kind: record.kind,
            state,
            attributes: record.attributes.clone(),
            time_created: record.time_created,
        })
    }

    /// Handles of resources of `kind` that still exist and are not terminated
    pub fn live_handles(&self, kind: &str) -> Vec<ResourceHandle> {
        let now = Instant::now();
        self.records()
            .iter()
            .filter(|(_, record)| record.kind == kind)
            .filter(|(_, record)| {
                record
                    .timeline
                    .state_at(now)
                    .is_some_and(|state| state != "TERMINATED")
            })
            .map(|(handle, _)| handle.clone())
            .collect()
    }

    /// Number of records, gone ones included
    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.records().len()
    }
}
