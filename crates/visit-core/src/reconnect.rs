//! Reconnection supervision.
//!
//! Tracks per-session failure counts against a retry bound, and owns the
//! single-shot "give up" timer that runs while the reconnecting indicator is
//! up. Decisions are synchronous; the orchestrator's event loop applies them.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::state::SessionPhase;

/// Retry configuration. The defaults mirror the production values: a fixed
/// 1s delay with a 120-attempt bound (~2 minutes of transient failures) and
/// a 30s reconnecting timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 120,
            retry_delay: Duration::from_secs(1),
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

/// What to do with a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another connect attempt after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// The bound is met; treat the failure as fatal.
    Escalate,
}

/// Supervises reconnection for both sessions of a visit.
pub struct ReconnectSupervisor {
    policy: RetryPolicy,
    failure_counts: HashMap<SessionPhase, u32>,
    is_reconnecting: bool,
    timeout_task: Option<JoinHandle<()>>,
}

impl ReconnectSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failure_counts: HashMap::new(),
            is_reconnecting: false,
            timeout_task: None,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting
    }

    pub fn failure_count(&self, phase: SessionPhase) -> u32 {
        self.failure_counts.get(&phase).copied().unwrap_or(0)
    }

    /// Record a retryable failure for one session and decide what happens.
    pub fn on_retryable_failure(&mut self, phase: SessionPhase) -> RetryDecision {
        let count = self.failure_counts.entry(phase).or_insert(0);
        if *count < self.policy.max_retries {
            *count += 1;
            tracing::info!(
                "retryable failure on {phase:?} session, attempt {}/{}",
                *count,
                self.policy.max_retries
            );
            RetryDecision::Retry {
                attempt: *count,
                delay: self.policy.retry_delay,
            }
        } else {
            tracing::warn!("retry bound reached on {phase:?} session");
            RetryDecision::Escalate
        }
    }

    /// A session (re)connected: its failure count starts over.
    pub fn on_connected(&mut self, phase: SessionPhase) {
        self.failure_counts.insert(phase, 0);
    }

    /// Enter the reconnecting state.
    ///
    /// Unless `timeout` is false, arms a single-shot timer that invokes
    /// `on_timeout` if no successful reconnect cancels it first. A new call
    /// replaces any pending timer; at most one is ever armed.
    pub fn begin_reconnecting<F>(&mut self, timeout: bool, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.is_reconnecting = true;
        self.cancel_timeout();
        if timeout {
            let deadline = self.policy.reconnect_timeout;
            self.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                on_timeout();
            }));
        }
    }

    /// Both sessions are connected again: clear the flag and the timer.
    pub fn reconnected(&mut self) {
        self.is_reconnecting = false;
        self.cancel_timeout();
    }

    /// Cancel the pending timeout, if any. Safe to call repeatedly.
    pub fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn retries_up_to_bound_then_escalates() {
        let mut sup = ReconnectSupervisor::new(policy(3));
        for attempt in 1..=3 {
            match sup.on_retryable_failure(SessionPhase::Clinical) {
                RetryDecision::Retry { attempt: a, delay } => {
                    assert_eq!(a, attempt);
                    assert_eq!(delay, Duration::from_secs(1));
                }
                RetryDecision::Escalate => panic!("escalated at attempt {attempt}"),
            }
        }
        assert_eq!(
            sup.on_retryable_failure(SessionPhase::Clinical),
            RetryDecision::Escalate
        );
    }

    #[test]
    fn successful_connect_resets_count() {
        let mut sup = ReconnectSupervisor::new(policy(2));
        sup.on_retryable_failure(SessionPhase::WaitingRoom);
        sup.on_retryable_failure(SessionPhase::WaitingRoom);
        sup.on_connected(SessionPhase::WaitingRoom);
        assert_eq!(sup.failure_count(SessionPhase::WaitingRoom), 0);
        assert!(matches!(
            sup.on_retryable_failure(SessionPhase::WaitingRoom),
            RetryDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn sessions_counted_independently() {
        let mut sup = ReconnectSupervisor::new(policy(1));
        sup.on_retryable_failure(SessionPhase::WaitingRoom);
        assert_eq!(
            sup.on_retryable_failure(SessionPhase::WaitingRoom),
            RetryDecision::Escalate
        );
        assert!(matches!(
            sup.on_retryable_failure(SessionPhase::Clinical),
            RetryDecision::Retry { attempt: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_when_not_cancelled() {
        let mut sup = ReconnectSupervisor::new(RetryPolicy::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        sup.begin_reconnecting(true, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sup.is_reconnecting());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnected_cancels_timeout() {
        let mut sup = ReconnectSupervisor::new(RetryPolicy::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        sup.begin_reconnecting(true, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        sup.reconnected();
        assert!(!sup.is_reconnecting());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_reconnecting_call_replaces_pending_timer() {
        let mut sup = ReconnectSupervisor::new(RetryPolicy::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let flag = first.clone();
        sup.begin_reconnecting(true, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(20)).await;

        let flag = second.clone();
        sup.begin_reconnecting(true, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        // 20s later the first timer would have fired; it was replaced.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_timer_when_timeout_disabled() {
        let mut sup = ReconnectSupervisor::new(RetryPolicy::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        sup.begin_reconnecting(false, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(sup.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn double_cancel_is_a_noop() {
        let mut sup = ReconnectSupervisor::new(RetryPolicy::default());
        sup.begin_reconnecting(true, || {});
        sup.cancel_timeout();
        sup.cancel_timeout();
        sup.reconnected();
    }
}
