use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{select, Either};
use tokio::task::JoinHandle;

use crate::error::{remote_unavailable, RunnerResult};

/// Spawns a background task on the ambient Tokio runtime, or on a shared fallback runtime when
/// called from outside one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build background tokio runtime")
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = BACKGROUND_RUNTIME.spawn(future);
    }
}

pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Runs a remote call under a deadline. An elapsed deadline is a retriable failure, never a
/// success.
pub async fn with_timeout<F, T>(timeout: Duration, label: &str, future: F) -> RunnerResult<T>
where
    F: Future<Output = RunnerResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(remote_unavailable(format!(
            "{label} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Background loop invoking an operation on a fixed interval until cancelled.
///
/// Cancellation is only observed between runs: an operation that already started is allowed to
/// finish, so a drain or ranking pass never stops half way.
pub struct PeriodicTask {
    name: String,
    cancel: async_channel::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PeriodicTask {
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (cancel, cancelled) = async_channel::bounded::<()>(1);
        let operation = Arc::new(operation);
        let label = name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let tick = Box::pin(sleep(interval));
                let stop = Box::pin(cancelled.recv());
                match select(tick, stop).await {
                    Either::Left(_) => {
                        log::debug!("periodic task {label} tick");
                        (operation)().await;
                    }
                    Either::Right(_) => break,
                }
            }
            log::debug!("periodic task {label} stopped");
        });

        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals the loop to stop and waits for any in-flight run to complete.
    pub async fn shutdown(&self) {
        self.cancel.close();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::warn!("periodic task {} ended abnormally: {err}", self.name);
            }
        }
    }
}
