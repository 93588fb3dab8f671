//! Sweepers for the simulated cloud
//!
//! One sweeper per kind deletes the handles the tracker still holds and
//! waits for each delete to settle. Instances go first: databases and
//! buckets are only swept after every instance is gone.

use async_trait::async_trait;
use log::{debug, warn};
use settle_core::config::SettleConfig;
use settle_core::provider::{Operation, ResourceLifecycle};
use settle_core::resource::ResourceHandle;
use settle_core::sweeper::{SweepContext, SweepError, Sweeper, SweeperRegistry};
use settle_core::waiter::{BoxError, WaitSpec, WaitSpecError};
use tokio_util::sync::CancellationToken;

use crate::provider::{SimKind, SimProvider};
use crate::resources::{BUCKET, DATABASE, INSTANCE};

/// Deletes tracked resources of one kind
pub struct KindSweeper {
    kind: SimKind,
    wait: WaitSpec,
}

impl KindSweeper {
    pub fn new(kind: SimKind, settings: &SettleConfig) -> Result<Self, WaitSpecError> {
        let retry = settings
            .retry_policies()
            .for_category(kind.retry_category());
        let wait = settings.wait_spec(
            kind.kind(),
            Operation::Delete,
            &kind.transition(Operation::Delete),
            retry,
        )?;
        Ok(Self { kind, wait })
    }

    async fn remove(
        &self,
        handle: &ResourceHandle,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.kind.delete(handle).await?;
        let report = self
            .wait
            .wait(handle, cancel, || self.kind.fetch_state(handle))
            .await?;
        debug!("{} reached {} in {:?}", handle, report.state, report.elapsed);
        Ok(())
    }
}

#[async_trait]
impl Sweeper for KindSweeper {
    async fn sweep(&self, ctx: &SweepContext<'_>) -> Result<usize, SweepError> {
        let kind = self.kind.kind();
        let mut swept = 0;
        let mut first_error = None;

        for handle in ctx.tracker.handles(kind) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self.remove(&handle, ctx.cancel).await {
                Ok(()) => {
                    ctx.tracker.forget(kind, &handle);
                    swept += 1;
                }
                Err(source) => {
                    warn!("Failed to sweep {}: {}", handle, source);
                    first_error.get_or_insert(SweepError::Resource { handle, source });
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(swept),
        }
    }
}

impl SimProvider {
    /// Build a registry with one sweeper per kind
    pub fn sweepers(&self, settings: &SettleConfig) -> Result<SweeperRegistry, SweepError> {
        let mut registry = SweeperRegistry::new();
        for (profile, dependencies) in [
            (&INSTANCE, &[][..]),
            (&DATABASE, &[INSTANCE.kind][..]),
            (&BUCKET, &[INSTANCE.kind][..]),
        ] {
            let kind = self
                .kind(profile.kind)
                .cloned()
                .ok_or_else(|| SweepError::UnknownSweeper(profile.kind.to_string()))?;
            registry.register(
                profile.kind,
                dependencies.iter().copied(),
                KindSweeper::new(kind, settings)?,
            )?;
        }
        Ok(registry)
    }
}
