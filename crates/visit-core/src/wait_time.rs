//! Waiting-room wait-time polling.
//!
//! Runs only while the visit sits in a waiting-room phase: a default message
//! goes up immediately, the first real poll happens after a short delay (the
//! backend needs a moment to register the visit), then polling continues on a
//! fixed interval until the phase changes. A failed poll shows the unknown
//! message but keeps the schedule alive.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::events::{EventEmitter, VisitEvent};
use crate::services::{WaitTimeEstimate, WaitTimeService};
use crate::surface::WaitingRoomView;

pub const DEFAULT_MESSAGE: &str = "A provider will be with you shortly.";
pub const UNKNOWN_MESSAGE: &str = "Estimated wait time is currently unavailable.";

#[derive(Debug, Clone, Copy)]
pub struct WaitTimeConfig {
    pub initial_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitTimeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Render an estimate for display.
///
/// A min/max range gets the templated "between X and Y minutes" phrasing;
/// otherwise the server-supplied message is passed through as-is.
pub fn format_estimate(estimate: &WaitTimeEstimate) -> String {
    if let (Some(min), Some(max)) = (estimate.min_seconds, estimate.max_seconds) {
        let min_minutes = min.div_ceil(60).max(1);
        let max_minutes = max.div_ceil(60).max(1);
        return format!(
            "Estimated wait time is between {min_minutes} and {max_minutes} minutes."
        );
    }
    if estimate.message.is_empty() {
        UNKNOWN_MESSAGE.to_string()
    } else {
        estimate.message.clone()
    }
}

/// Polls the wait-time service while the waiting room is on screen.
pub struct WaitTimeEstimator {
    visit_id: String,
    service: Arc<dyn WaitTimeService>,
    config: WaitTimeConfig,
    emitter: EventEmitter,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WaitTimeEstimator {
    pub fn new(
        visit_id: String,
        service: Arc<dyn WaitTimeService>,
        config: WaitTimeConfig,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            visit_id,
            service,
            config,
            emitter,
            task: Mutex::new(None),
        }
    }

    /// Begin polling, pushing updates into the waiting-room view.
    ///
    /// Restartable: a prior schedule is cancelled first, so re-entering the
    /// waiting room after a failed reconnect starts fresh.
    pub fn start(&self, view: Weak<dyn WaitingRoomView>) {
        self.stop();

        if let Some(view) = view.upgrade() {
            view.set_wait_time(DEFAULT_MESSAGE);
        }
        self.emitter
            .emit(VisitEvent::WaitTimeUpdated(DEFAULT_MESSAGE.to_string()));

        let visit_id = self.visit_id.clone();
        let service = self.service.clone();
        let config = self.config;
        let emitter = self.emitter.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(config.initial_delay).await;
            loop {
                let message = match service.estimate(&visit_id).await {
                    Ok(estimate) => format_estimate(&estimate),
                    Err(e) => {
                        tracing::warn!("wait time poll failed: {e}");
                        UNKNOWN_MESSAGE.to_string()
                    }
                };
                if let Some(view) = view.upgrade() {
                    view.set_wait_time(&message);
                }
                emitter.emit(VisitEvent::WaitTimeUpdated(message));
                tokio::time::sleep(config.poll_interval).await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Cancel the schedule. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for WaitTimeEstimator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VisitError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn estimate(min: Option<u64>, max: Option<u64>, message: &str) -> WaitTimeEstimate {
        WaitTimeEstimate {
            message: message.to_string(),
            localization_key: None,
            min_seconds: min,
            max_seconds: max,
        }
    }

    #[test]
    fn range_uses_templated_phrasing() {
        let msg = format_estimate(&estimate(Some(300), Some(600), "ignored"));
        assert_eq!(msg, "Estimated wait time is between 5 and 10 minutes.");
    }

    #[test]
    fn sub_minute_range_rounds_up_to_one_minute() {
        let msg = format_estimate(&estimate(Some(20), Some(90), ""));
        assert_eq!(msg, "Estimated wait time is between 1 and 2 minutes.");
    }

    #[test]
    fn no_range_falls_back_to_server_message() {
        let msg = format_estimate(&estimate(None, None, "Shouldn't be long now."));
        assert_eq!(msg, "Shouldn't be long now.");
    }

    #[test]
    fn partial_range_falls_back_to_server_message() {
        let msg = format_estimate(&estimate(Some(60), None, "About a minute."));
        assert_eq!(msg, "About a minute.");
    }

    #[test]
    fn empty_message_without_range_shows_unknown() {
        let msg = format_estimate(&estimate(None, None, ""));
        assert_eq!(msg, UNKNOWN_MESSAGE);
    }

    struct ScriptedService {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl WaitTimeService for ScriptedService {
        async fn estimate(&self, _visit_id: &str) -> Result<WaitTimeEstimate, VisitError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(call) {
                return Err(VisitError::Http("503".to_string()));
            }
            Ok(WaitTimeEstimate {
                message: format!("poll {call}"),
                localization_key: None,
                min_seconds: None,
                max_seconds: None,
            })
        }
    }

    struct RecordingView {
        messages: Mutex<Vec<String>>,
    }

    impl WaitingRoomView for RecordingView {
        fn set_wait_time(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn estimator(service: Arc<ScriptedService>) -> WaitTimeEstimator {
        WaitTimeEstimator::new(
            "visit-1".to_string(),
            service,
            WaitTimeConfig::default(),
            EventEmitter::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn default_message_shown_before_first_poll() {
        let service = Arc::new(ScriptedService {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let view = Arc::new(RecordingView {
            messages: Mutex::new(Vec::new()),
        });
        let est = estimator(service);
        est.start(Arc::downgrade(
            &(view.clone() as Arc<dyn WaitingRoomView>),
        ));

        // Before the initial delay only the default message is up.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            view.messages.lock().unwrap().as_slice(),
            &[DEFAULT_MESSAGE.to_string()]
        );
        est.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn polls_on_interval_after_initial_delay() {
        let service = Arc::new(ScriptedService {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let view = Arc::new(RecordingView {
            messages: Mutex::new(Vec::new()),
        });
        let est = estimator(service.clone());
        est.start(Arc::downgrade(
            &(view.clone() as Arc<dyn WaitingRoomView>),
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        est.stop();

        let messages = view.messages.lock().unwrap();
        assert_eq!(messages[1], "poll 0");
        assert_eq!(messages[2], "poll 1");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_shows_unknown_but_keeps_schedule() {
        let service = Arc::new(ScriptedService {
            calls: AtomicUsize::new(0),
            fail_on: Some(0),
        });
        let view = Arc::new(RecordingView {
            messages: Mutex::new(Vec::new()),
        });
        let est = estimator(service.clone());
        est.start(Arc::downgrade(
            &(view.clone() as Arc<dyn WaitingRoomView>),
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(view.messages.lock().unwrap()[1], UNKNOWN_MESSAGE);

        // Next interval still polls.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(view.messages.lock().unwrap()[2], "poll 1");
        est.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_schedule() {
        let service = Arc::new(ScriptedService {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let view = Arc::new(RecordingView {
            messages: Mutex::new(Vec::new()),
        });
        let est = estimator(service.clone());
        est.start(Arc::downgrade(
            &(view.clone() as Arc<dyn WaitingRoomView>),
        ));
        est.stop();
        est.stop();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_begins_a_fresh_schedule() {
        let service = Arc::new(ScriptedService {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let view = Arc::new(RecordingView {
            messages: Mutex::new(Vec::new()),
        });
        let est = estimator(service.clone());
        est.start(Arc::downgrade(
            &(view.clone() as Arc<dyn WaitingRoomView>),
        ));
        est.stop();
        est.start(Arc::downgrade(
            &(view.clone() as Arc<dyn WaitingRoomView>),
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        est.stop();
    }
}
