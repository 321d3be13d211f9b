//! Readiness polling for long-running cloud resources.

use std::time::Duration;

/// How often and how long to poll, and which states end the wait.
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
    pub ready_states: Vec<String>,
    pub failure_states: Vec<String>,
    /// States that count as failed when seen on two consecutive polls.
    pub stall_states: Vec<String>,
}

fn owned(states: &[&str]) -> Vec<String> {
    states.iter().map(ToString::to_string).collect()
}

impl PollSpec {
    /// Poll a HyperPod cluster until `InService`.
    #[must_use]
    pub fn cluster(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ready_states: owned(&["InService"]),
            failure_states: owned(&["Failed", "Deleting"]),
            stall_states: owned(&["RollingBack"]),
        }
    }

    /// Poll a CloudFormation stack until `CREATE_COMPLETE`.
    #[must_use]
    pub fn stack(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ready_states: owned(&["CREATE_COMPLETE", "UPDATE_COMPLETE"]),
            failure_states: owned(&[
                "CREATE_FAILED",
                "ROLLBACK_COMPLETE",
                "ROLLBACK_FAILED",
                "DELETE_IN_PROGRESS",
                "DELETE_COMPLETE",
            ]),
            stall_states: owned(&["ROLLBACK_IN_PROGRESS"]),
        }
    }

    /// Number of status checks: `timeout / interval`, at least one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let attempts = self.timeout.as_millis() / interval;
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    Failed(String),
    TimedOut {
        attempts: u32,
        last_state: Option<String>,
    },
}

impl PollOutcome {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::TimedOut {
                attempts,
                last_state,
            } => write!(
                f,
                "not yet ready after {attempts} checks (last state: {})",
                last_state.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// Waits between polls.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Check `resource_id` until it reaches a terminal state or the attempts run out.
///
/// A failed status read counts as an attempt. There is no sleep after the last attempt.
pub fn poll_until_ready<F, E>(
    resource_id: &str,
    spec: &PollSpec,
    sleeper: &dyn Sleeper,
    mut read_status: F,
) -> PollOutcome
where
    F: FnMut() -> Result<String, E>,
    E: std::fmt::Display,
{
    let max_attempts = spec.max_attempts();
    let mut last_state: Option<String> = None;

    for attempt in 1..=max_attempts {
        match read_status() {
            Ok(state) => {
                tracing::info!("{resource_id}: {state} (check {attempt}/{max_attempts})");

                if spec.ready_states.contains(&state) {
                    return PollOutcome::Ready;
                }
                if spec.failure_states.contains(&state) {
                    return PollOutcome::Failed(format!("{resource_id} entered {state}"));
                }
                if spec.stall_states.contains(&state) && last_state.as_ref() == Some(&state) {
                    return PollOutcome::Failed(format!("{resource_id} stuck in {state}"));
                }
                last_state = Some(state);
            }
            Err(e) => {
                tracing::warn!("{resource_id}: status check failed: {e} (check {attempt}/{max_attempts})");
                last_state = None;
            }
        }

        if attempt < max_attempts {
            sleeper.sleep(spec.interval);
        }
    }

    PollOutcome::TimedOut {
        attempts: max_attempts,
        last_state,
    }
}
