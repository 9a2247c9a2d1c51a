use std::future::Future;
use std::time::Duration;

/// Outcome of a remote call that did not produce a value.
///
/// A timeout is never folded into `Failed`: callers must be able to tell
/// "the remote side said no" apart from "we stopped waiting".
#[derive(Debug, thiserror::Error)]
pub enum RemoteCallError<E> {
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("{0}")]
    Failed(E),
}

impl<E> RemoteCallError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteCallError::Timeout { .. })
    }
}

/// Runs `call` under `deadline`. The future is dropped when the deadline
/// elapses, which aborts the in-flight request. No retry happens here.
pub async fn bounded_call<T, E, F>(
    operation: &'static str,
    deadline: Duration,
    call: F,
) -> Result<T, RemoteCallError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(RemoteCallError::Failed(error)),
        Err(_) => {
            let after_ms = deadline.as_millis() as u64;
            tracing::warn!(operation, after_ms, "remote call exceeded its deadline");
            Err(RemoteCallError::Timeout { operation, after_ms })
        }
    }
}
