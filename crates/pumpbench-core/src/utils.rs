/*!
 * Utility functions and helpers for pumpbench.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("Operation timed out after {:?}", duration))),
    }
}

/// Call a blocking operation up to `attempts` times, sleeping `delay` between attempts
///
/// Meant for dedicated worker threads; never call it on the async runtime.
/// Returns the last error when every attempt fails.
pub fn retry_blocking<T, E, F>(attempts: usize, delay: Duration, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> std::result::Result<T, E>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Succeeded on attempt {}/{}", attempt, attempts);
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                warn!("All {} attempts failed: {}", attempts, e);
                return Err(e);
            }
        }
    }
}

/// Create a task that runs in the background and logs any errors
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_retry_blocking_success_after_failures() {
        let mut calls = 0;
        let result = retry_blocking(3, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 {
                Err("not yet")
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_blocking_all_failures() {
        let mut calls = 0;
        let result: std::result::Result<(), &str> = retry_blocking(3, Duration::ZERO, || {
            calls += 1;
            Err("down")
        });
        assert_eq!(result, Err("down"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_blocking_zero_attempts_still_calls_once() {
        let mut calls = 0;
        let _: std::result::Result<(), &str> = retry_blocking(0, Duration::ZERO, || {
            calls += 1;
            Err("down")
        });
        assert_eq!(calls, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_spawn_and_log() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let ok = spawn_and_log("ok", async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(())
        });
        let failed = spawn_and_log("failed", async { Err::<(), _>(Error::other("boom")) });

        ok.await.unwrap();
        failed.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
