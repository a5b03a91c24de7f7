//! Activation supervisor.
//!
//! Activation runs on its own task and is raced against a timeout.  When the
//! timeout wins the task is aborted, or, with `abort_on_timeout` off, left
//! to finish in the background with its result discarded.

use std::sync::Arc;
use std::time::Duration;

use exthost_kernel::panic_message;
use tokio::time::Instant;

use crate::activation::{Activatable, Activation};
use crate::context::ExtensionContext;

/// How an activation attempt ended.
#[derive(Debug)]
pub enum ActivationOutcome {
    Activated {
        activation: Activation,
        elapsed: Duration,
    },
    Failed {
        reason: String,
    },
    TimedOut {
        timeout: Duration,
    },
}

/// Runs activations under a time bound.
#[derive(Debug, Clone, Copy)]
pub struct ActivationSupervisor {
    abort_on_timeout: bool,
}

impl Default for ActivationSupervisor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ActivationSupervisor {
    pub fn new(abort_on_timeout: bool) -> Self {
        Self { abort_on_timeout }
    }

    /// Activate `unit`, giving up after `timeout`.
    ///
    /// A panicking activation is reported as a failure.
    pub async fn run(
        &self,
        extension_id: &str,
        unit: Arc<dyn Activatable>,
        ctx: ExtensionContext,
        timeout: Duration,
    ) -> ActivationOutcome {
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { unit.activate(ctx).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(activation))) => {
                let elapsed = started.elapsed();
                tracing::debug!(extension_id = %extension_id, elapsed = ?elapsed, "activation completed");
                ActivationOutcome::Activated {
                    activation,
                    elapsed,
                }
            }
            Ok(Ok(Err(reason))) => ActivationOutcome::Failed { reason },
            Ok(Err(join_err)) => {
                let reason = if join_err.is_panic() {
                    panic_message("activation", join_err.into_panic().as_ref())
                } else {
                    join_err.to_string()
                };
                ActivationOutcome::Failed { reason }
            }
            Err(_elapsed) => {
                if self.abort_on_timeout {
                    handle.abort();
                } else {
                    tracing::warn!(
                        extension_id = %extension_id,
                        "activation timed out, leaving task running detached"
                    );
                }
                ActivationOutcome::TimedOut { timeout }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use dashmap::DashMap;

    use crate::context::{SecretStore, SharedDisposables};

    fn ctx(id: &str) -> ExtensionContext {
        ExtensionContext {
            extension_id: id.into(),
            extension_path: PathBuf::from("/ext").join(id),
            extension_uri: crate::context::extension_uri(id),
            storage_path: PathBuf::from("/data").join(id),
            subscriptions: SharedDisposables::default(),
            secrets: SecretStore::new(id, Arc::new(DashMap::new())),
            surface: Arc::new(()),
        }
    }

    struct Sleepy {
        delay: Duration,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Activatable for Sleepy {
        async fn activate(&self, _ctx: ExtensionContext) -> Result<Activation, String> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(Activation::new(serde_json::Value::Null))
        }
    }

    struct Refuses;

    #[async_trait]
    impl Activatable for Refuses {
        async fn activate(&self, _ctx: ExtensionContext) -> Result<Activation, String> {
            Err("no workspace open".into())
        }
    }

    struct Panics;

    #[async_trait]
    impl Activatable for Panics {
        async fn activate(&self, _ctx: ExtensionContext) -> Result<Activation, String> {
            panic!("boom");
        }
    }

    fn sleepy(delay: Duration) -> (Arc<dyn Activatable>, Arc<AtomicBool>) {
        let finished = Arc::new(AtomicBool::new(false));
        let unit = Sleepy {
            delay,
            finished: Arc::clone(&finished),
        };
        (Arc::new(unit), finished)
    }

    #[tokio::test]
    async fn fast_activation_succeeds() {
        let (unit, finished) = sleepy(Duration::from_millis(1));
        let outcome = ActivationSupervisor::default()
            .run("acme.fast", unit, ctx("acme.fast"), Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, ActivationOutcome::Activated { .. }));
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_the_task() {
        let (unit, finished) = sleepy(Duration::from_secs(30));
        let outcome = ActivationSupervisor::new(true)
            .run("acme.slow", unit, ctx("acme.slow"), Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, ActivationOutcome::TimedOut { .. }));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_timeout_lets_the_task_finish() {
        let (unit, finished) = sleepy(Duration::from_secs(30));
        let outcome = ActivationSupervisor::new(false)
            .run("acme.slow", unit, ctx("acme.slow"), Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, ActivationOutcome::TimedOut { .. }));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn errors_and_panics_are_failures() {
        let supervisor = ActivationSupervisor::default();

        let outcome = supervisor
            .run("acme.no", Arc::new(Refuses), ctx("acme.no"), Duration::from_secs(1))
            .await;
        match outcome {
            ActivationOutcome::Failed { reason } => assert_eq!(reason, "no workspace open"),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let outcome = supervisor
            .run("acme.boom", Arc::new(Panics), ctx("acme.boom"), Duration::from_secs(1))
            .await;
        match outcome {
            ActivationOutcome::Failed { reason } => assert_eq!(reason, "activation panicked: boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
