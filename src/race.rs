use std::future::Future;
use std::time::Duration;

/// Outcome of racing an operation against a timer.
#[derive(Debug)]
pub(crate) enum Raced<T> {
    Completed(T),
    TimedOut,
    /// The spawned task panicked.
    Failed,
}

/// Race `operation` against a `limit` timer without cancelling it.
///
/// The operation runs as its own task. If the timer wins, the task keeps
/// running to completion and its output is dropped, so any side effects
/// it performs still happen.
pub(crate) async fn race<F, T>(limit: Duration, operation: F) -> Raced<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(output)) => Raced::Completed(output),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Raced operation panicked");
            Raced::Failed
        }
        Err(_) => Raced::TimedOut,
    }
}
