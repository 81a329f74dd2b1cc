use crate::config::AppSpec;
use crate::process::types::ExitInfo;
use std::fmt;
use std::time::Duration;

/// Why a running episode ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// The process terminated on its own or was killed externally
    Exited(ExitInfo),
    /// The process could not be spawned at all
    SpawnFailed(String),
    /// The memory watchdog forced the restart
    MemoryExceeded { rss: u64, limit: u64 },
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Exited(exit) => write!(f, "{}", exit),
            ExitCause::SpawnFailed(message) => write!(f, "spawn failed: {}", message),
            ExitCause::MemoryExceeded { rss, limit } => {
                write!(f, "memory {} bytes over ceiling {} bytes", rss, limit)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartAction {
    RestartNow,
    RestartAfter(Duration),
    GiveUp,
}

impl RestartAction {
    /// Delay before the next start, `None` when giving up
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RestartAction::RestartNow => Some(Duration::ZERO),
            RestartAction::RestartAfter(delay) => Some(*delay),
            RestartAction::GiveUp => None,
        }
    }
}

/// Outcome of consulting the policy after an episode ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDecision {
    pub action: RestartAction,
    pub reason: String,
    /// Consecutive-failure counter after this decision
    pub consecutive_failures: u32,
}

/// Restart rules for one app, derived from its spec.
///
/// Decisions are a pure function of the exit cause, how long the process
/// stayed up and the consecutive-failure counter; the caller owns the
/// counter and stores back whatever the decision says.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Uptime after which a run counts as stable
    pub min_uptime: Duration,
    /// Unstable exits tolerated in a row before giving up
    pub max_restarts: u32,
    /// Delay before the first restart inside a crash loop
    pub initial_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn from_spec(spec: &AppSpec) -> Self {
        Self {
            enabled: spec.autorestart,
            min_uptime: spec.min_uptime(),
            max_restarts: spec.max_restarts,
            initial_delay: spec.restart_delay(),
            max_delay: spec.max_restart_delay(),
        }
    }

    /// Delay before restart attempt `attempt` (0-indexed) of a crash loop:
    /// `initial_delay * 2^attempt`, saturating, capped at `max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a process alive for `uptime` has had a sustained run
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.min_uptime
    }

    pub fn decide(
        &self,
        cause: &ExitCause,
        uptime: Duration,
        consecutive_failures: u32,
    ) -> RestartDecision {
        let stable = self.is_stable(uptime) && !matches!(cause, ExitCause::SpawnFailed(_));
        let carried = if stable { 0 } else { consecutive_failures };

        // Memory restarts are deliberate: immediate, never counted as a failure
        if let ExitCause::MemoryExceeded { .. } = cause {
            return RestartDecision {
                action: RestartAction::RestartNow,
                reason: cause.to_string(),
                consecutive_failures: carried,
            };
        }

        if !self.enabled {
            return RestartDecision {
                action: RestartAction::GiveUp,
                reason: format!("{}, autorestart disabled", cause),
                consecutive_failures: carried,
            };
        }

        if stable {
            return RestartDecision {
                action: RestartAction::RestartNow,
                reason: format!("{} after {:?} uptime", cause, uptime),
                consecutive_failures: 0,
            };
        }

        let failures = consecutive_failures.saturating_add(1);
        if failures > self.max_restarts {
            return RestartDecision {
                action: RestartAction::GiveUp,
                reason: format!(
                    "{}, {} consecutive exits before {:?} uptime",
                    cause, failures, self.min_uptime
                ),
                consecutive_failures: failures,
            };
        }

        let delay = self.backoff_delay(failures - 1);
        RestartDecision {
            action: RestartAction::RestartAfter(delay),
            reason: format!(
                "{}, unstable restart {}/{}",
                cause, failures, self.max_restarts
            ),
            consecutive_failures: failures,
        }
    }
}
