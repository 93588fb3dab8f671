//! Resource kind profiles for the simulated cloud
//!
//! This module defines:
//! - The lifecycle each kind goes through on create, update and delete
//! - Which retry category each kind polls under
//! - Attribute validation performed on create

use settle_core::config::{DATABASE_CATEGORY, OBJECT_STORAGE_CATEGORY};
use settle_core::provider::{Operation, StateTransition};
use settle_core::resource::Resource;
use settle_core::retry::DEFAULT_CATEGORY;
use settle_core::source_details::InstanceSourceDetails;

/// State every kind settles in when a create is made to fail
pub const FAILED_STATE: &str = "FAILED";

// =============================================================================
// Lifecycle Definitions
// =============================================================================

/// States one operation walks through in the simulated backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    /// Pending states, each held for one simulation step
    pub pending: &'static [&'static str],
    /// State the resource settles in
    pub target: &'static str,
    /// Whether the resource disappears instead of staying in `target`
    pub vanishes: bool,
}

/// Resource kind configuration
#[derive(Debug, Clone, Copy)]
pub struct KindProfile {
    pub kind: &'static str,
    pub retry_category: &'static str,
    pub create: Lifecycle,
    pub update: Lifecycle,
    pub delete: Lifecycle,
    /// Attribute validation performed before a create or update is accepted
    pub validate: fn(&Resource) -> Result<(), String>,
}

impl KindProfile {
    pub fn lifecycle(&self, operation: Operation) -> &Lifecycle {
        match operation {
            Operation::Create => &self.create,
            Operation::Update => &self.update,
            Operation::Delete => &self.delete,
        }
    }

    /// Pending and target states as seen by a waiter
    pub fn transition(&self, operation: Operation) -> StateTransition {
        let lifecycle = self.lifecycle(operation);
        let transition =
            StateTransition::new(lifecycle.pending.iter().copied(), [lifecycle.target]);
        match operation {
            Operation::Delete => transition.with_not_found_state(lifecycle.target),
            _ => transition,
        }
    }
}

// =============================================================================
// Compute
// =============================================================================

pub const INSTANCE: KindProfile = KindProfile {
    kind: "instance",
    retry_category: DEFAULT_CATEGORY,
    create: Lifecycle {
        pending: &["PROVISIONING", "STARTING"],
        target: "RUNNING",
        vanishes: false,
    },
    update: Lifecycle {
        pending: &["UPDATING"],
        target: "RUNNING",
        vanishes: false,
    },
    delete: Lifecycle {
        pending: &["STOPPING", "TERMINATING"],
        target: "TERMINATED",
        vanishes: false,
    },
    validate: validate_instance,
};

fn validate_instance(resource: &Resource) -> Result<(), String> {
    let details = resource
        .attributes
        .get("source_details")
        .ok_or_else(|| "source_details is required".to_string())?;
    InstanceSourceDetails::from_value(details)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

// =============================================================================
// Database
// =============================================================================

pub const DATABASE: KindProfile = KindProfile {
    kind: "database",
    retry_category: DATABASE_CATEGORY,
    create: Lifecycle {
        pending: &["PROVISIONING"],
        target: "AVAILABLE",
        vanishes: false,
    },
    update: Lifecycle {
        pending: &["UPDATING"],
        target: "AVAILABLE",
        vanishes: false,
    },
    delete: Lifecycle {
        pending: &["TERMINATING"],
        target: "TERMINATED",
        vanishes: false,
    },
    validate: validate_database,
};

fn validate_database(resource: &Resource) -> Result<(), String> {
    match resource.attribute_str("db_name") {
        Some(name) if !name.is_empty() => Ok(()),
        _ => Err("db_name is required".to_string()),
    }
}

// =============================================================================
// Object Storage
// =============================================================================

pub const BUCKET: KindProfile = KindProfile {
    kind: "bucket",
    retry_category: OBJECT_STORAGE_CATEGORY,
    create: Lifecycle {
        pending: &["CREATING"],
        target: "ACTIVE",
        vanishes: false,
    },
    update: Lifecycle {
        pending: &["UPDATING"],
        target: "ACTIVE",
        vanishes: false,
    },
    delete: Lifecycle {
        pending: &["DELETING"],
        target: "DELETED",
        vanishes: true,
    },
    validate: accept_any,
};

fn accept_any(_resource: &Resource) -> Result<(), String> {
    Ok(())
}

/// Returns all kinds supported by the simulated cloud
pub fn kind_profiles() -> Vec<&'static KindProfile> {
    vec![&INSTANCE, &DATABASE, &BUCKET]
}

pub fn kind_profile(kind: &str) -> Option<&'static KindProfile> {
    kind_profiles().into_iter().find(|p| p.kind == kind)
}
