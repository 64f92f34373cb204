//! ABOUTME: Task polling loop with exponential backoff and transient retry
//! ABOUTME: Honors deadlines and cancellation between poll ticks

use crate::{PulpClient, Task};
use pm_core::{Deadline, Error, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polling behavior for task completion
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Consecutive transient poll failures tolerated before giving up
    pub max_consecutive_errors: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_consecutive_errors: 5,
        }
    }
}

impl PollSettings {
    fn next_interval(&self, current: Duration) -> Duration {
        let scaled = current.as_millis() as f64 * self.multiplier;
        Duration::from_millis(scaled as u64).min(self.max_interval)
    }
}

/// Poll a task href until it reaches a terminal state.
///
/// Transient poll errors (network, 5xx) are retried with backoff; the task
/// itself is never re-submitted. Returns the terminal task; the caller maps
/// `failed`/`canceled` states to per-repo outcomes.
///
/// Errors: `Deadline` once the deadline's grace window closes, `Canceled`
/// when the token fires between ticks, `PulpUnreachable` when consecutive
/// transient failures exhaust the ceiling.
pub async fn wait_for_task(
    client: &PulpClient,
    task_href: &str,
    settings: &PollSettings,
    deadline: Option<&Deadline>,
    cancel: &CancellationToken,
) -> Result<Task> {
    let mut interval = settings.initial_interval;
    let mut consecutive_errors = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Canceled(format!("polling of {} canceled", task_href)));
        }
        if let Some(deadline) = deadline {
            if deadline.grace_expired() {
                return Err(Error::Deadline(format!(
                    "task {} did not finish within the runtime budget",
                    task_href
                )));
            }
        }

        match client.get_task(task_href).await {
            Ok(task) => {
                consecutive_errors = 0;
                if task.state.is_terminal() {
                    debug!(task = %task_href, state = ?task.state, "Task reached terminal state");
                    return Ok(task);
                }
            }
            Err(err) if err.is_transient() => {
                consecutive_errors += 1;
                warn!(
                    task = %task_href,
                    attempt = consecutive_errors,
                    error = %err,
                    "Transient error polling task"
                );
                if consecutive_errors >= settings.max_consecutive_errors {
                    return Err(Error::PulpUnreachable(format!(
                        "gave up polling {} after {} consecutive errors: {}",
                        task_href, consecutive_errors, err
                    )));
                }
            }
            Err(err) => return Err(err),
        }

        let mut sleep_for = interval;
        if let Some(deadline) = deadline {
            sleep_for = sleep_for.min(deadline.remaining_with_grace());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Canceled(format!("polling of {} canceled", task_href)));
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }

        interval = settings.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_ceiling() {
        let settings = PollSettings::default();
        let mut interval = settings.initial_interval;
        let mut observed = vec![interval];
        for _ in 0..6 {
            interval = settings.next_interval(interval);
            observed.push(interval);
        }
        assert_eq!(observed[0], Duration::from_secs(2));
        assert_eq!(observed[1], Duration::from_secs(4));
        assert_eq!(observed[2], Duration::from_secs(8));
        assert!(observed.iter().all(|i| *i <= Duration::from_secs(30)));
        assert_eq!(*observed.last().unwrap(), Duration::from_secs(30));
    }
}
