//! Sweepers - Cleaning up resources left behind by test runs
//!
//! Every handle created during a run is recorded in a [`ResourceTracker`].
//! Sweepers, one per resource kind, delete whatever the tracker still holds.
//! A [`SweeperRegistry`] runs them in dependency order: a sweeper only runs
//! after all the sweepers it depends on (e.g. subnets are swept after the
//! instances living in them).
//!
//! Both the tracker and the registry are plain values owned by whoever
//! orchestrates the run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::resource::ResourceHandle;
use crate::waiter::{BoxError, WaitSpecError};

/// Errors from registering or running sweepers
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Sweeper already registered: {0}")]
    Duplicate(String),

    #[error("Sweeper {sweeper} depends on unknown sweeper {dependency}")]
    UnknownDependency { sweeper: String, dependency: String },

    #[error("Sweeper dependency cycle among: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Unknown sweeper: {0}")]
    UnknownSweeper(String),

    #[error("Invalid sweeper wait: {0}")]
    Wait(#[from] WaitSpecError),

    #[error("Failed to sweep {handle}: {source}")]
    Resource {
        handle: ResourceHandle,
        #[source]
        source: BoxError,
    },
}

/// Handles created during a run, grouped by resource kind
#[derive(Debug, Default)]
pub struct ResourceTracker {
    handles: Mutex<BTreeMap<String, BTreeSet<ResourceHandle>>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, BTreeSet<ResourceHandle>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, kind: &str, handle: ResourceHandle) {
        self.lock().entry(kind.to_string()).or_default().insert(handle);
    }

    /// Remove a handle, returning whether it was tracked
    pub fn forget(&self, kind: &str, handle: &ResourceHandle) -> bool {
        let mut handles = self.lock();
        let Some(set) = handles.get_mut(kind) else {
            return false;
        };
        let removed = set.remove(handle);
        if set.is_empty() {
            handles.remove(kind);
        }
        removed
    }

    pub fn handles(&self, kind: &str) -> Vec<ResourceHandle> {
        self.lock()
            .get(kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a sweeper gets to work with
pub struct SweepContext<'a> {
    pub tracker: &'a ResourceTracker,
    pub cancel: &'a CancellationToken,
}

/// Cleanup routine for one resource kind
#[async_trait]
pub trait Sweeper: Send + Sync {
    /// Delete leftover resources, returning how many were removed
    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<usize, SweepError>;
}

struct SweeperEntry {
    dependencies: Vec<String>,
    sweeper: Box<dyn Sweeper>,
}

/// Outcome of each sweeper that ran, in execution order
#[derive(Debug, Default)]
pub struct SweepReport {
    pub results: Vec<(String, Result<usize, SweepError>)>,
}

impl SweepReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Total number of resources removed
    pub fn swept(&self) -> usize {
        self.results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .sum()
    }
}

/// Named sweepers with dependencies between them
#[derive(Default)]
pub struct SweeperRegistry {
    entries: BTreeMap<String, SweeperEntry>,
}

impl SweeperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sweeper that must run after `dependencies`
    pub fn register<I, S>(
        &mut self,
        name: impl Into<String>,
        dependencies: I,
        sweeper: impl Sweeper + 'static,
    ) -> Result<(), SweepError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(SweepError::Duplicate(name));
        }
        self.entries.insert(
            name,
            SweeperEntry {
                dependencies: dependencies.into_iter().map(Into::into).collect(),
                sweeper: Box::new(sweeper),
            },
        );
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.entries
            .get(name)
            .map_or(&[], |e| e.dependencies.as_slice())
    }

    /// All sweepers, dependencies first; ties broken by name
    pub fn order(&self) -> Result<Vec<String>, SweepError> {
        let all: BTreeSet<&str> = self.entries.keys().map(String::as_str).collect();
        self.order_within(&all)
    }

    /// The selected sweepers plus everything they depend on, in run order
    pub fn order_for(&self, selected: &[&str]) -> Result<Vec<String>, SweepError> {
        let mut included = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for name in selected {
            let (name, _) = self
                .entries
                .get_key_value(*name)
                .ok_or_else(|| SweepError::UnknownSweeper(name.to_string()))?;
            stack.push(name.as_str());
        }
        while let Some(name) = stack.pop() {
            if !included.insert(name) {
                continue;
            }
            for dependency in self.dependencies_of(name) {
                stack.push(dependency.as_str());
            }
        }
        self.order_within(&included)
    }

    fn order_within(&self, included: &BTreeSet<&str>) -> Result<Vec<String>, SweepError> {
        let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
        for &name in included {
            let deps = self.dependencies_of(name);
            for dependency in deps {
                if !self.entries.contains_key(dependency) {
                    return Err(SweepError::UnknownDependency {
                        sweeper: name.to_string(),
                        dependency: dependency.clone(),
                    });
                }
            }
            remaining.insert(name, deps.len());
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while let Some(name) = ready.pop_first() {
            remaining.remove(name);
            order.push(name.to_string());
            for (&other, count) in remaining.iter_mut() {
                let waits_on = self
                    .dependencies_of(other)
                    .iter()
                    .filter(|d| d.as_str() == name)
                    .count();
                if waits_on > 0 {
                    *count -= waits_on;
                    if *count == 0 {
                        ready.insert(other);
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(SweepError::Cycle(
                remaining.keys().map(|s| s.to_string()).collect(),
            ));
        }
        Ok(order)
    }

    /// Run all sweepers, or only `selected` and their dependencies.
    ///
    /// A failing sweeper does not stop the others; its error is recorded in
    /// the report. Cancellation stops before the next sweeper starts.
    pub async fn run(
        &self,
        ctx: &SweepContext<'_>,
        selected: Option<&[&str]>,
    ) -> Result<SweepReport, SweepError> {
        let order = match selected {
            Some(selected) => self.order_for(selected)?,
            None => self.order()?,
        };

        let mut report = SweepReport::default();
        for name in order {
            if ctx.cancel.is_cancelled() {
                warn!("Sweep cancelled before {}", name);
                break;
            }
            let Some(entry) = self.entries.get(&name) else {
                continue;
            };
            let result = entry.sweeper.sweep(ctx).await;
            match &result {
                Ok(count) => info!("Sweeper {} removed {} resources", name, count),
                Err(e) => warn!("Sweeper {} failed: {}", name, e),
            }
            report.results.push((name, result));
        }
        Ok(report)
    }
}
