//! Interpreter - Execute Effects using a Provider
//!
//! The Interpreter executes Effects contained in a Plan in order,
//! collecting the results. This is where side effects actually occur:
//! each mutating call is followed by a wait until the resource settles
//! in one of the target states of the operation.

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SettleConfig;
use crate::effect::Effect;
use crate::plan::Plan;
use crate::provider::{Operation, Provider, ProviderError, ResourceLifecycle};
use crate::resource::{ResourceHandle, ResourceId, State};
use crate::retry::RetryPolicies;
use crate::sweeper::ResourceTracker;
use crate::waiter::{WaitError, WaitReport, WaitSpecError};

/// Errors from executing a single Effect
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Unknown resource kind: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("[{id}] {operation} did not complete: {source}")]
    Wait {
        id: ResourceId,
        operation: Operation,
        #[source]
        source: WaitError,
    },

    #[error("[{id}] invalid wait for {operation}: {source}")]
    InvalidWait {
        id: ResourceId,
        operation: Operation,
        #[source]
        source: WaitSpecError,
    },

    #[error("[{0}] has no backend handle")]
    MissingHandle(ResourceId),
}

/// Result of executing each Effect
#[derive(Debug)]
pub enum EffectOutcome {
    /// Read succeeded
    Read { state: State },
    /// Create succeeded
    Created { state: State, report: WaitReport },
    /// Update succeeded
    Updated { state: State, report: WaitReport },
    /// Delete succeeded
    Deleted {
        handle: ResourceHandle,
        report: WaitReport,
    },
    /// Skipped (e.g., dry-run)
    Skipped { reason: String },
}

/// Result of executing the entire Plan
#[derive(Debug)]
pub struct ApplyResult {
    pub outcomes: Vec<Result<EffectOutcome, ApplyError>>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.failure_count == 0
    }
}

/// Interpreter configuration
#[derive(Debug, Clone, Default)]
pub struct InterpreterConfig {
    /// If true, skip actual side effects
    pub dry_run: bool,
    /// Continue on error
    pub continue_on_error: bool,
}

/// Interpreter that executes Effects using a Provider
pub struct Interpreter<P: Provider> {
    provider: P,
    config: InterpreterConfig,
    settings: SettleConfig,
    retry: RetryPolicies,
    cancel: CancellationToken,
    tracker: Option<Arc<ResourceTracker>>,
}

impl<P: Provider> Interpreter<P> {
    pub fn new(provider: P) -> Self {
        Self::with_settings(provider, SettleConfig::default())
    }

    /// Create an Interpreter using timeouts, polling and retry settings from `settings`
    pub fn with_settings(provider: P, settings: SettleConfig) -> Self {
        let retry = settings.retry_policies();
        Self {
            provider,
            config: InterpreterConfig::default(),
            settings,
            retry,
            cancel: CancellationToken::new(),
            tracker: None,
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record created handles in `tracker` (and forget deleted ones)
    pub fn with_tracker(mut self, tracker: Arc<ResourceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Execute a Plan, interpreting all Effects and causing side effects
    pub async fn apply(&self, plan: &Plan) -> ApplyResult {
        let mut outcomes = Vec::new();
        let mut success_count = 0;
        let mut failure_count = 0;

        for effect in plan.effects() {
            let result = self.execute_effect(effect).await;

            let failed = match &result {
                Ok(_) => {
                    success_count += 1;
                    false
                }
                Err(e) => {
                    warn!("{}", e);
                    failure_count += 1;
                    true
                }
            };

            outcomes.push(result);
            if failed && !self.config.continue_on_error {
                break;
            }
        }

        ApplyResult {
            outcomes,
            success_count,
            failure_count,
        }
    }

    /// Execute a single Effect
    pub async fn execute_effect(&self, effect: &Effect) -> Result<EffectOutcome, ApplyError> {
        if self.config.dry_run {
            return Ok(EffectOutcome::Skipped {
                reason: "dry-run mode".to_string(),
            });
        }

        let kind = self.kind_of(effect.resource_id())?;

        match effect {
            Effect::Read { id, handle } => {
                let state = kind.read(id, handle).await?;
                Ok(EffectOutcome::Read { state })
            }
            Effect::Create(resource) => {
                info!("Creating {}", resource.id);
                let handle = kind.create(resource).await?;
                // Tracked before waiting so a failed create is still swept
                if let Some(tracker) = &self.tracker {
                    tracker.record(kind.kind(), handle.clone());
                }
                let report = self
                    .wait(kind, &resource.id, Operation::Create, &handle)
                    .await?;
                let state = kind.read(&resource.id, &handle).await?;
                info!("Created {} ({}) in {:?}", resource.id, handle, report.elapsed);
                Ok(EffectOutcome::Created { state, report })
            }
            Effect::Update { id, from, to } => {
                let handle = from
                    .handle
                    .clone()
                    .ok_or_else(|| ApplyError::MissingHandle(id.clone()))?;
                info!("Updating {} ({})", id, handle);
                kind.update(&handle, from, to).await?;
                let report = self.wait(kind, id, Operation::Update, &handle).await?;
                let state = kind.read(id, &handle).await?;
                Ok(EffectOutcome::Updated { state, report })
            }
            Effect::Delete { id, handle } => {
                info!("Deleting {} ({})", id, handle);
                kind.delete(handle).await?;
                let report = self.wait(kind, id, Operation::Delete, handle).await?;
                if let Some(tracker) = &self.tracker {
                    tracker.forget(kind.kind(), handle);
                }
                Ok(EffectOutcome::Deleted {
                    handle: handle.clone(),
                    report,
                })
            }
        }
    }

    fn kind_of(&self, id: &ResourceId) -> Result<&dyn ResourceLifecycle, ApplyError> {
        self.provider
            .resource_kind(&id.resource_type)
            .ok_or_else(|| ApplyError::UnknownKind(id.resource_type.clone()))
    }

    async fn wait(
        &self,
        kind: &dyn ResourceLifecycle,
        id: &ResourceId,
        operation: Operation,
        handle: &ResourceHandle,
    ) -> Result<WaitReport, ApplyError> {
        let transition = kind.transition(operation);
        let retry = self.retry.for_category(kind.retry_category());
        let spec = self
            .settings
            .wait_spec(kind.kind(), operation, &transition, retry)
            .map_err(|source| ApplyError::InvalidWait {
                id: id.clone(),
                operation,
                source,
            })?;

        spec.wait(handle, &self.cancel, || kind.fetch_state(handle))
            .await
            .map_err(|source| ApplyError::Wait {
                id: id.clone(),
                operation,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BoxFuture, ProviderResult, StateTransition};
    use crate::resource::{LifecycleState, Resource};
    use crate::waiter::FetchError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Kind whose state fetches follow a script, then repeat `settled`
    struct TestKind {
        script: Mutex<VecDeque<&'static str>>,
        settled: &'static str,
    }

    impl TestKind {
        fn new(script: &[&'static str], settled: &'static str) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                settled,
            }
        }
    }

    impl ResourceLifecycle for TestKind {
        fn kind(&self) -> &'static str {
            "test"
        }

        fn transition(&self, operation: Operation) -> StateTransition {
            match operation {
                Operation::Create => StateTransition::new(["PROVISIONING"], ["RUNNING"]),
                Operation::Update => StateTransition::new(["UPDATING"], ["RUNNING"]),
                Operation::Delete => StateTransition::new(["TERMINATING"], ["TERMINATED"])
                    .with_not_found_state("TERMINATED"),
            }
        }

        fn create(&self, _resource: &Resource) -> BoxFuture<'_, ProviderResult<ResourceHandle>> {
            Box::pin(async { Ok(ResourceHandle::new("test-id")) })
        }

        fn read(
            &self,
            id: &ResourceId,
            handle: &ResourceHandle,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            let state = State::existing(id.clone(), HashMap::new())
                .with_handle(handle.clone())
                .with_lifecycle_state(self.settled);
            Box::pin(async move { Ok(state) })
        }

        fn update(
            &self,
            _handle: &ResourceHandle,
            _from: &State,
            _to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn delete(&self, _handle: &ResourceHandle) -> BoxFuture<'_, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn fetch_state(
            &self,
            _handle: &ResourceHandle,
        ) -> BoxFuture<'_, Result<LifecycleState, FetchError>> {
            let next = self.script.lock().unwrap().pop_front();
            let settled = self.settled;
            Box::pin(async move {
                match next {
                    Some("GONE") => Err(FetchError::NotFound),
                    Some(state) => Ok(LifecycleState::from(state)),
                    None => Ok(LifecycleState::from(settled)),
                }
            })
        }
    }

    struct TestProvider {
        kind: TestKind,
    }

    impl TestProvider {
        fn new(script: &[&'static str], settled: &'static str) -> Self {
            Self {
                kind: TestKind::new(script, settled),
            }
        }
    }

    impl Provider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        fn resource_kinds(&self) -> Vec<&dyn ResourceLifecycle> {
            vec![&self.kind]
        }
    }

    fn fast_settings() -> SettleConfig {
        SettleConfig::from_json_str(r#"{ "polling": { "interval_ms": 1000 } }"#).unwrap()
    }

    #[tokio::test]
    async fn apply_empty_plan() {
        let interpreter = Interpreter::new(TestProvider::new(&[], "RUNNING"));
        let plan = Plan::new();
        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_create_effect_waits_for_target() {
        let tracker = Arc::new(ResourceTracker::new());
        let interpreter = Interpreter::with_settings(
            TestProvider::new(&["PROVISIONING", "PROVISIONING"], "RUNNING"),
            fast_settings(),
        )
        .with_tracker(tracker.clone());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("test", "example")));

        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        match &result.outcomes[0] {
            Ok(EffectOutcome::Created { state, report }) => {
                assert_eq!(report.fetches, 3);
                assert_eq!(state.lifecycle_state, Some(LifecycleState::from("RUNNING")));
                assert_eq!(state.handle, Some(ResourceHandle::new("test-id")));
            }
            other => panic!("Expected Created, got {:?}", other),
        }
        assert_eq!(tracker.handles("test"), vec![ResourceHandle::new("test-id")]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_reports_unexpected_state_and_stays_tracked() {
        let tracker = Arc::new(ResourceTracker::new());
        let interpreter = Interpreter::with_settings(
            TestProvider::new(&["PROVISIONING", "FAILED"], "RUNNING"),
            fast_settings(),
        )
        .with_tracker(tracker.clone());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("test", "example")));
        plan.add(Effect::Create(Resource::new("test", "never-reached")));

        let result = interpreter.apply(&plan).await;

        assert!(!result.is_success());
        assert_eq!(result.outcomes.len(), 1);
        match &result.outcomes[0] {
            Err(ApplyError::Wait {
                operation: Operation::Create,
                source: WaitError::UnexpectedState { state, .. },
                ..
            }) => assert_eq!(state, "FAILED"),
            other => panic!("Expected UnexpectedState, got {:?}", other),
        }
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_accepts_not_found_and_forgets_handle() {
        let tracker = Arc::new(ResourceTracker::new());
        tracker.record("test", ResourceHandle::new("test-id"));
        let interpreter = Interpreter::with_settings(
            TestProvider::new(&["TERMINATING", "GONE"], "RUNNING"),
            fast_settings(),
        )
        .with_tracker(tracker.clone());
        let effect = Effect::Delete {
            id: ResourceId::new("test", "example"),
            handle: ResourceHandle::new("test-id"),
        };

        let outcome = interpreter.execute_effect(&effect).await.unwrap();

        match outcome {
            EffectOutcome::Deleted { report, .. } => assert_eq!(report.state, "TERMINATED"),
            other => panic!("Expected Deleted, got {:?}", other),
        }
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn update_without_handle_is_rejected() {
        let interpreter = Interpreter::new(TestProvider::new(&[], "RUNNING"));
        let id = ResourceId::new("test", "example");
        let effect = Effect::Update {
            id: id.clone(),
            from: State::existing(id.clone(), HashMap::new()),
            to: Resource::new("test", "example"),
        };

        let err = interpreter.execute_effect(&effect).await.unwrap_err();
        assert!(matches!(err, ApplyError::MissingHandle(missing) if missing == id));
    }

    #[tokio::test]
    async fn unknown_kind_continues_when_configured() {
        let config = InterpreterConfig {
            continue_on_error: true,
            ..Default::default()
        };
        let interpreter =
            Interpreter::new(TestProvider::new(&[], "RUNNING")).with_config(config);
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("nope", "a")));
        plan.add(Effect::Read {
            id: ResourceId::new("test", "b"),
            handle: ResourceHandle::new("test-id"),
        });

        let result = interpreter.apply(&plan).await;

        assert_eq!(result.failure_count, 1);
        assert_eq!(result.success_count, 1);
        assert!(matches!(
            result.outcomes[0],
            Err(ApplyError::UnknownKind(ref kind)) if kind == "nope"
        ));
    }

    #[tokio::test]
    async fn cancelled_interpreter_stops_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let interpreter = Interpreter::new(TestProvider::new(&[], "RUNNING"))
            .with_cancellation(cancel);

        let err = interpreter
            .execute_effect(&Effect::Create(Resource::new("test", "example")))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Wait {
                source: WaitError::Cancelled { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dry_run_skips_effects() {
        let config = InterpreterConfig {
            dry_run: true,
            ..Default::default()
        };
        let interpreter =
            Interpreter::new(TestProvider::new(&[], "RUNNING")).with_config(config);
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("test", "example")));

        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        assert!(matches!(
            result.outcomes[0],
            Ok(EffectOutcome::Skipped { .. })
        ));
    }
}
