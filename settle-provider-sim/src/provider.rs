//! Simulated provider implementation
//!
//! This module exposes the kinds of the simulated cloud through the
//! `ResourceLifecycle` trait. Every call completes immediately; the time a
//! resource spends in its pending states is observed through `fetch_state`.

use std::sync::Arc;

use chrono::SecondsFormat;
use settle_core::provider::{
    BoxFuture, Operation, ProviderError, ProviderResult, ResourceLifecycle, StateTransition,
};
use settle_core::resource::{LifecycleState, Resource, ResourceHandle, ResourceId, State, Value};
use settle_core::waiter::FetchError;

use crate::cloud::SimCloud;
use crate::resources::{KindProfile, kind_profiles};

/// One resource kind of the simulated cloud
#[derive(Debug, Clone)]
pub struct SimKind {
    profile: &'static KindProfile,
    cloud: Arc<SimCloud>,
}

impl SimKind {
    pub fn new(profile: &'static KindProfile, cloud: Arc<SimCloud>) -> Self {
        Self { profile, cloud }
    }

    pub fn profile(&self) -> &'static KindProfile {
        self.profile
    }
}

impl ResourceLifecycle for SimKind {
    fn kind(&self) -> &'static str {
        self.profile.kind
    }

    fn retry_category(&self) -> &'static str {
        self.profile.retry_category
    }

    fn transition(&self, operation: Operation) -> StateTransition {
        self.profile.transition(operation)
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<ResourceHandle>> {
        let result = self.cloud.create(self.profile, resource).map_err(|e| {
            ProviderError::new(format!("Failed to create resource: {}", e))
                .for_resource(resource.id.clone())
                .with_cause(e)
        });
        Box::pin(async move { result })
    }

    fn read(
        &self,
        id: &ResourceId,
        handle: &ResourceHandle,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let state = match self.cloud.snapshot(handle) {
            Some(snapshot) => {
                let mut attributes = snapshot.attributes;
                attributes.insert(
                    "time_created".to_string(),
                    Value::String(
                        snapshot
                            .time_created
                            .to_rfc3339_opts(SecondsFormat::Secs, true),
                    ),
                );
                State::existing(id.clone(), attributes)
                    .with_handle(handle.clone())
                    .with_lifecycle_state(snapshot.state)
            }
            None => State::not_found(id.clone()),
        };
        Box::pin(async move { Ok(state) })
    }

    fn update(
        &self,
        handle: &ResourceHandle,
        _from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let result = self.cloud.update(self.profile, handle, to).map_err(|e| {
            ProviderError::new(format!("Failed to update resource: {}", e))
                .for_resource(to.id.clone())
                .with_cause(e)
        });
        Box::pin(async move { result })
    }

    fn delete(&self, handle: &ResourceHandle) -> BoxFuture<'_, ProviderResult<()>> {
        let result = self.cloud.delete(self.profile, handle).map_err(|e| {
            ProviderError::new(format!("Failed to delete resource {}: {}", handle, e)).with_cause(e)
        });
        Box::pin(async move { result })
    }

    fn fetch_state(
        &self,
        handle: &ResourceHandle,
    ) -> BoxFuture<'_, Result<LifecycleState, FetchError>> {
        let result = self.cloud.fetch_state(handle);
        Box::pin(async move { result })
    }
}

/// Simulated cloud Provider
pub struct SimProvider {
    cloud: Arc<SimCloud>,
    kinds: Vec<SimKind>,
}

impl SimProvider {
    /// Create a provider serving every simulated kind from `cloud`
    pub fn new(cloud: Arc<SimCloud>) -> Self {
        let kinds = kind_profiles()
            .into_iter()
            .map(|profile| SimKind::new(profile, cloud.clone()))
            .collect();
        Self { cloud, kinds }
    }

    pub fn cloud(&self) -> &Arc<SimCloud> {
        &self.cloud
    }

    pub fn kinds(&self) -> &[SimKind] {
        &self.kinds
    }

    pub(crate) fn kind(&self, name: &str) -> Option<&SimKind> {
        self.kinds.iter().find(|k| k.profile.kind == name)
    }
}
