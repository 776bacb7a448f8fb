//! Async completion contract
//!
//! Every asynchronous operation completes exactly once, either with a success
//! value or with a `LogError`. Three shapes are offered:
//!
//! - plain `async fn` returning [`Completion<T>`]
//! - callback form via [`spawn_completion`], guarded so the callback fires
//!   exactly once even if the task is torn down
//! - a oneshot handle via [`completion_channel`] for callers that prefer to
//!   await a receiver
//!
//! Hung backend calls are bounded by [`with_timeout`]. Dropping a future only
//! stops waiting; the backend operation is never aborted mid-flight.

use super::error::LogError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Two-outcome result delivered by every async operation
pub type Completion<T> = Result<T, LogError>;

/// Boxed completion callback
pub type Callback<T> = Box<dyn FnOnce(Completion<T>) + Send + 'static>;

/// Bound a backend call by `timeout`, mapping expiry to `OperationTimeout`
pub async fn with_timeout<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> Completion<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<LogError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!(operation, ?timeout, "backend call timed out");
            Err(LogError::OperationTimeout { operation, timeout })
        }
    }
}

/// Holds a callback and guarantees it is invoked exactly once
///
/// If dropped without `complete`, the callback receives a
/// `BackendUnavailable` naming the abandoned operation.
pub struct CompletionGuard<T> {
    operation: &'static str,
    callback: Option<Callback<T>>,
}

impl<T> CompletionGuard<T> {
    pub fn new<C>(operation: &'static str, callback: C) -> Self
    where
        C: FnOnce(Completion<T>) + Send + 'static,
    {
        CompletionGuard {
            operation,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, result: Completion<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            tracing::error!(operation = self.operation, "completion abandoned");
            callback(Err(LogError::BackendUnavailable(format!(
                "{} abandoned before completion",
                self.operation
            ))));
        }
    }
}

/// Run `fut` on the Tokio runtime and deliver its outcome to `callback`
///
/// Must be called from within a runtime context.
pub fn spawn_completion<T, F, C>(operation: &'static str, fut: F, callback: C) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Completion<T>> + Send + 'static,
    C: FnOnce(Completion<T>) + Send + 'static,
{
    let guard = CompletionGuard::new(operation, callback);
    tokio::spawn(async move {
        let result = fut.await;
        guard.complete(result);
    })
}

/// Sending half of a completion handle
pub struct CompletionSender<T> {
    tx: oneshot::Sender<Completion<T>>,
}

impl<T: Send + 'static> CompletionSender<T> {
    /// Deliver the outcome; a dropped receiver is ignored
    pub fn send(self, result: Completion<T>) {
        let _ = self.tx.send(result);
    }

    /// Adapt into a callback for the `async_*` methods
    pub fn into_callback(self) -> impl FnOnce(Completion<T>) + Send + 'static {
        move |result| self.send(result)
    }
}

/// Receiving half of a completion handle
pub struct CompletionReceiver<T> {
    operation: &'static str,
    rx: oneshot::Receiver<Completion<T>>,
}

impl<T> CompletionReceiver<T> {
    pub async fn wait(self) -> Completion<T> {
        let operation = self.operation;
        self.rx.await.unwrap_or(Err(LogError::BackendUnavailable(format!(
            "{} sender dropped",
            operation
        ))))
    }

    /// Stop waiting after `timeout`; the operation itself keeps running
    pub async fn wait_timeout(self, timeout: Duration) -> Completion<T> {
        let operation = self.operation;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(LogError::OperationTimeout { operation, timeout }),
        }
    }
}

pub fn completion_channel<T>(operation: &'static str) -> (CompletionSender<T>, CompletionReceiver<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSender { tx }, CompletionReceiver { operation, rx })
}
