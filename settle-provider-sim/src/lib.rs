//! Settle Simulated Cloud Provider
//!
//! In-memory cloud whose resources move through lifecycle states over time,
//! for rehearsing plans and exercising waiters without a real backend.
//!
//! ## Module Structure
//!
//! - `cloud` - SimCloud backend: records, timelines and fault injection
//! - `resources` - Kind profiles (lifecycles, retry categories, validation)
//! - `provider` - SimProvider and its per-kind lifecycles
//! - `sweep` - Sweepers deleting tracked resources

pub mod cloud;
pub mod provider;
pub mod resources;
pub mod sweep;

// Re-export main types
pub use cloud::{SimCloud, SimError};
pub use provider::{SimKind, SimProvider};
pub use sweep::KindSweeper;

use settle_core::provider::{Provider, ResourceLifecycle};

// =============================================================================
// Provider Trait Implementation
// =============================================================================

impl Provider for SimProvider {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn resource_kinds(&self) -> Vec<&dyn ResourceLifecycle> {
        self.kinds()
            .iter()
            .map(|kind| kind as &dyn ResourceLifecycle)
            .collect()
    }
}
