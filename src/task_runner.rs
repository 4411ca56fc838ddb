//! Periodic job runner with circuit breaker
//!
//! Runs a job every `interval` until shutdown. Failures back off
//! exponentially; too many consecutive failures trip the breaker and the
//! runner returns an error so the caller can stop the service.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Circuit breaker configuration for background tasks
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    pub max_consecutive_failures: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("task '{task}' exceeded {failures} consecutive failures, last error: {last_error}")]
pub struct CircuitOpen {
    pub task: String,
    pub failures: u32,
    pub last_error: String,
}

/// Internal state for circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl CircuitBreakerState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    fn record_failure(&mut self, max_delay: Duration) {
        self.consecutive_failures += 1;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Sleep for `duration` unless shutdown fires first; returns true on shutdown
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Run `task_fn` every `interval` with circuit breaker protection
pub async fn run_periodic<F, Fut>(
    task_name: &str,
    interval: Duration,
    config: CircuitBreakerConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) -> Result<(), CircuitOpen>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut state = CircuitBreakerState::new(config.initial_retry_delay);

    loop {
        let delay = match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                debug!(task = task_name, "Periodic task completed");
                interval
            }
            Err(e) => {
                state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed (attempt {}/{}): {}",
                    task_name, state.consecutive_failures, config.max_consecutive_failures, e
                );
                if state.consecutive_failures >= config.max_consecutive_failures {
                    return Err(CircuitOpen {
                        task: task_name.to_string(),
                        failures: state.consecutive_failures,
                        last_error: e,
                    });
                }
                warn!("Task '{}' will retry in {:?}", task_name, state.current_retry_delay);
                state.current_retry_delay
            }
        };

        if wait_or_shutdown(delay, &mut shutdown).await {
            debug!(task = task_name, "Periodic task stopping");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_circuit_breaker_resets_on_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = attempt_count.clone();
        let (tx, rx) = watch::channel(false);

        let config = CircuitBreakerConfig {
            max_consecutive_failures: 3,
            initial_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
        };

        let handle = tokio::spawn(async move {
            run_periodic("test_task", Duration::from_millis(10), config, rx, || {
                let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err("Simulated failure".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        let result = handle.await.unwrap();

        assert!(result.is_ok());
        assert!(attempt_count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips_on_max_failures() {
        let (_tx, rx) = watch::channel(false);
        let config = CircuitBreakerConfig {
            max_consecutive_failures: 3,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(10),
        };

        let err = run_periodic("failing_task", Duration::from_secs(60), config, rx, || async {
            Err("Always fails".to_string())
        })
        .await
        .unwrap_err();

        assert_eq!(err.failures, 3);
        assert_eq!(err.last_error, "Always fails");
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_periodic(
            "idle_task",
            Duration::from_secs(3600),
            CircuitBreakerConfig::default(),
            rx,
            || async { Ok(()) },
        ));
        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
