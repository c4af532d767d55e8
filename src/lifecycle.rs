//! Background loop supervision shared by the coordinators

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ConclaveError, Result};

/// Receiver side of a shutdown signal handed to every loop
pub type ShutdownSignal = watch::Receiver<bool>;

/// Result of stopping a [`BackgroundTasks`] set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub exited: Vec<String>,
    pub abandoned: Vec<String>,
}

/// A set of named long-lived tasks sharing one shutdown signal
pub struct BackgroundTasks {
    owner: String,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Fails when called outside a tokio runtime
    pub fn new(owner: impl Into<String>) -> Result<Self> {
        let owner = owner.into();
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConclaveError::DegradedDependency {
                dependency: "tokio runtime".into(),
                reason: format!("{owner} cannot start background loops outside a runtime"),
            });
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            owner,
            shutdown_tx,
            handles: Vec::new(),
        })
    }

    /// Spawn a loop; the closure receives its own shutdown receiver
    pub fn spawn<F, Fut>(&mut self, name: &str, f: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(f(self.shutdown_tx.subscribe()));
        debug!(owner = %self.owner, task = %name, "Spawned background loop");
        self.handles.push((name.to_string(), handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown, wait up to `grace` per loop, then abort stragglers
    pub async fn stop(self, grace: Duration) -> StopReport {
        let _ = self.shutdown_tx.send(true);
        let mut report = StopReport::default();

        for (name, mut handle) in self.handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => report.exited.push(name),
                Ok(Err(e)) => {
                    warn!(owner = %self.owner, task = %name, error = %e, "Background loop ended abnormally");
                    report.exited.push(name);
                }
                Err(_) => {
                    handle.abort();
                    warn!(
                        owner = %self.owner,
                        task = %name,
                        grace_ms = grace.as_millis() as u64,
                        "Background loop did not exit in time, abandoned"
                    );
                    report.abandoned.push(name);
                }
            }
        }
        report
    }
}

/// Resolves once shutdown has been requested or the sender is gone
pub async fn shutdown_requested(signal: &mut ShutdownSignal) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime() {
        let err = BackgroundTasks::new("test").err().unwrap();
        assert!(matches!(err, ConclaveError::DegradedDependency { .. }));
    }

    #[tokio::test]
    async fn test_cooperative_loops_exit() {
        let mut tasks = BackgroundTasks::new("test").unwrap();
        tasks.spawn("polite", |mut signal| async move {
            shutdown_requested(&mut signal).await;
        });

        let report = tasks.stop(Duration::from_secs(1)).await;
        assert_eq!(report.exited, vec!["polite".to_string()]);
        assert!(report.abandoned.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_loop_is_abandoned() {
        let mut tasks = BackgroundTasks::new("test").unwrap();
        tasks.spawn("stubborn", |_signal| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let report = tasks.stop(Duration::from_millis(100)).await;
        assert_eq!(report.abandoned, vec!["stubborn".to_string()]);
    }
}
