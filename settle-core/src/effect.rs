//! Effect - A side effect against a backend, represented as a value

use crate::provider::Operation;
use crate::resource::{Resource, ResourceHandle, ResourceId, State};

/// One operation to perform against a Provider
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Read the current state of an existing resource
    Read {
        id: ResourceId,
        handle: ResourceHandle,
    },
    /// Create a new resource
    Create(Resource),
    /// Update an existing resource from its current state
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
    },
    /// Delete an existing resource
    Delete {
        id: ResourceId,
        handle: ResourceHandle,
    },
}

impl Effect {
    /// Whether this Effect changes anything on the backend
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Effect::Read { .. })
    }

    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Effect::Read { id, .. } | Effect::Update { id, .. } | Effect::Delete { id, .. } => id,
            Effect::Create(resource) => &resource.id,
        }
    }

    /// The operation this Effect waits on, if any
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Effect::Read { .. } => None,
            Effect::Create(_) => Some(Operation::Create),
            Effect::Update { .. } => Some(Operation::Update),
            Effect::Delete { .. } => Some(Operation::Delete),
        }
    }
}
