use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::MockodbError;

/// Starts `future` on a background task immediately and returns a handle to
/// collect its outcome later. This is how a test kicks off a driver
/// operation, scripts the server's side of the conversation, then checks
/// what the driver made of it.
pub fn go<F, T>(future: F) -> Background<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Background {
        handle: tokio::spawn(future),
    }
}

/// Handle to a running background operation. No cancellation: once started
/// the operation runs to completion, the handle only waits.
pub struct Background<T> {
    handle: JoinHandle<T>,
}

impl<T> Background<T> {
    /// Waits for the operation and returns its value. A panic inside the
    /// task resumes in the caller, so assertion failures in the operation
    /// surface as ordinary test failures.
    pub async fn wait(self) -> T {
        match self.handle.await {
            Ok(value) => value,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => panic!("background operation aborted: {err}"),
        }
    }

    /// Like [`wait`](Self::wait) but bounded, so a hung driver fails the
    /// test instead of hanging the suite.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<T, MockodbError> {
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Ok(Err(err)) => Err(MockodbError::Protocol(format!(
                "background operation aborted: {err}"
            ))),
            Err(_) => Err(MockodbError::Timeout {
                pattern: "background operation result".into(),
                queued: "n/a".into(),
                waited: timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_the_result_after_the_fact() {
        let handle = go(async { 41 + 1 });
        assert_eq!(handle.wait().await, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "driver blew up")]
    async fn propagates_panics_to_the_caller() {
        let handle = go(async { panic!("driver blew up") });
        handle.wait().await
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let handle = go(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let err = handle.wait_timeout(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(MockodbError::Timeout { .. })));
    }
}
