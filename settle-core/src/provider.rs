//! Provider - Traits abstracting resource lifecycles
//!
//! A Provider groups the resource kinds of one backend (a cloud, a simulator).
//! Each kind implements [`ResourceLifecycle`]: the four CRUD calls, a
//! lifecycle-state fetch, and the pending/target states each mutating
//! operation passes through.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::resource::{LifecycleState, Resource, ResourceHandle, ResourceId, State};
use crate::retry::DEFAULT_CATEGORY;
use crate::waiter::FetchError;

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    pub resource_id: Option<ResourceId>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource_id: None,
            cause: None,
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Mutating operations that end in a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// States a resource passes through during one operation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateTransition {
    pub pending: Vec<LifecycleState>,
    pub target: Vec<LifecycleState>,
    /// State to assume when the resource can no longer be found
    pub not_found_state: Option<LifecycleState>,
}

impl StateTransition {
    pub fn new<P, T>(pending: P, target: T) -> Self
    where
        P: IntoIterator,
        P::Item: Into<LifecycleState>,
        T: IntoIterator,
        T::Item: Into<LifecycleState>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            not_found_state: None,
        }
    }

    pub fn with_not_found_state(mut self, state: impl Into<LifecycleState>) -> Self {
        self.not_found_state = Some(state.into());
        self
    }
}

/// CRUD lifecycle of one resource kind
pub trait ResourceLifecycle: Send + Sync {
    /// Resource kind name (e.g., "instance")
    fn kind(&self) -> &'static str;

    /// Retry category used for state fetches (e.g., "database")
    fn retry_category(&self) -> &'static str {
        DEFAULT_CATEGORY
    }

    /// Pending and target states of an operation
    fn transition(&self, operation: Operation) -> StateTransition;

    /// Start creating a resource, returning its backend handle
    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<ResourceHandle>>;

    /// Read the current state of a resource
    ///
    /// Returns `State::not_found()` if the resource does not exist.
    fn read(
        &self,
        id: &ResourceId,
        handle: &ResourceHandle,
    ) -> BoxFuture<'_, ProviderResult<State>>;

    /// Start updating a resource
    fn update(
        &self,
        handle: &ResourceHandle,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<()>>;

    /// Start deleting a resource
    fn delete(&self, handle: &ResourceHandle) -> BoxFuture<'_, ProviderResult<()>>;

    /// Fetch only the lifecycle state, for polling
    fn fetch_state(
        &self,
        handle: &ResourceHandle,
    ) -> BoxFuture<'_, Result<LifecycleState, FetchError>>;
}

/// Main Provider trait
///
/// Each backend implements this trait by listing its resource kinds.
pub trait Provider: Send + Sync {
    /// Name of this Provider (e.g., "sim")
    fn name(&self) -> &'static str;

    /// Resource kinds this Provider can handle
    fn resource_kinds(&self) -> Vec<&dyn ResourceLifecycle>;

    /// Look up a resource kind by name
    fn resource_kind(&self, kind: &str) -> Option<&dyn ResourceLifecycle> {
        self.resource_kinds().into_iter().find(|k| k.kind() == kind)
    }
}

/// Provider implementation for Box<dyn Provider>
/// This enables dynamic dispatch for Providers
impl Provider for Box<dyn Provider> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn resource_kinds(&self) -> Vec<&dyn ResourceLifecycle> {
        (**self).resource_kinds()
    }

    fn resource_kind(&self, kind: &str) -> Option<&dyn ResourceLifecycle> {
        (**self).resource_kind(kind)
    }
}
