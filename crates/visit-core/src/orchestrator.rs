//! Virtual visit session orchestration.
//!
//! Owns the two transport sessions of a visit (waiting room and clinical),
//! derives the single visit state from their statuses, supervises
//! reconnection, relays chat signaling, and reports exactly one completion
//! outcome. All transport callbacks from both sessions funnel into one event
//! loop task, so no two notifications ever race on shared fields.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::{ChatChannel, ChatMessage, LocalChatIdentity};
use crate::errors::VisitError;
use crate::events::{CompletionReason, EventEmitter, VisitEvent, VisitEventListener};
use crate::reconnect::{ReconnectSupervisor, RetryDecision, RetryPolicy};
use crate::services::{ChatPersistence, MediaPermissions, TokenService, WaitTimeService};
use crate::signaling::{
    self, ERROR_JOINED_ELSEWHERE, STATUS_DECLINED, ErrorSignalPayload, StatusChangePayload,
};
use crate::state::{ConnectionStatus, SessionPhase, VisitState, derive_state};
use crate::stats::{StatsAggregator, StatsConfig, WindowStats};
use crate::surface::{VisitSurface, VisitView, WaitingRoomView};
use crate::transport::{
    PublisherHandle, SessionEvent, SessionLink, SubscriberHandle, TransportErrorCode,
    TransportSession, signal_kind,
};
use crate::wait_time::{WaitTimeConfig, WaitTimeEstimator};

/// Delivery mode of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitModality {
    Virtual,
    Phone,
}

/// Facts about the visit being joined, supplied by the caller.
#[derive(Debug, Clone)]
pub struct VisitDescriptor {
    pub visit_id: String,
    pub modality: VisitModality,
    /// True when rejoining a visit that is already in progress; the waiting
    /// room is skipped.
    pub resuming: bool,
    pub local_participant_id: String,
    pub display_name: String,
    /// Role tag the transport puts on streams published by this side.
    pub local_role: String,
    pub is_staff: bool,
}

/// Tunables for the orchestrator's background machinery.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisitConfig {
    pub retry: RetryPolicy,
    pub stats: StatsConfig,
    pub wait_time: WaitTimeConfig,
}

/// Backend collaborators consumed by the orchestrator.
#[derive(Clone)]
pub struct VisitServices {
    pub tokens: Arc<dyn TokenService>,
    pub wait_times: Arc<dyn WaitTimeService>,
    pub chat_log: Arc<dyn ChatPersistence>,
    pub permissions: Arc<dyn MediaPermissions>,
}

/// Everything the single event loop consumes.
enum LoopEvent {
    Session(SessionPhase, SessionEvent),
    Control(ControlEvent),
}

enum ControlEvent {
    RetryConnect(SessionPhase),
    ReconnectTimedOut,
    Shutdown,
}

/// Mutable state owned by the event loop, readable through short lock holds.
struct Shared {
    waiting_status: Option<ConnectionStatus>,
    clinical_status: Option<ConnectionStatus>,
    waiting_connection_id: Option<String>,
    clinical_connection_id: Option<String>,
    on_visit_view: bool,
    waiting_room_shown: bool,
    supervisor: ReconnectSupervisor,
    stats: StatsAggregator,
    publisher: Option<PublisherHandle>,
    subscription: Option<SubscriberHandle>,
    waiting_room_view: Option<Weak<dyn WaitingRoomView>>,
    visit_view: Option<Weak<dyn VisitView>>,
    last_state: VisitState,
    completed: Option<CompletionReason>,
    forwarder_tasks: Vec<JoinHandle<()>>,
    loop_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn status(&self, phase: SessionPhase) -> Option<ConnectionStatus> {
        match phase {
            SessionPhase::WaitingRoom => self.waiting_status,
            SessionPhase::Clinical => self.clinical_status,
        }
    }

    fn set_status(&mut self, phase: SessionPhase, status: ConnectionStatus) {
        match phase {
            SessionPhase::WaitingRoom => self.waiting_status = Some(status),
            SessionPhase::Clinical => self.clinical_status = Some(status),
        }
    }

    fn set_connection_id(&mut self, phase: SessionPhase, id: String) {
        match phase {
            SessionPhase::WaitingRoom => self.waiting_connection_id = Some(id),
            SessionPhase::Clinical => self.clinical_connection_id = Some(id),
        }
    }

    fn is_own_connection(&self, connection_id: &str) -> bool {
        self.waiting_connection_id.as_deref() == Some(connection_id)
            || self.clinical_connection_id.as_deref() == Some(connection_id)
    }

    fn both_connected(&self) -> bool {
        self.waiting_status == Some(ConnectionStatus::Connected)
            && self.clinical_status == Some(ConnectionStatus::Connected)
    }

    fn derive(&self) -> VisitState {
        derive_state(
            self.waiting_status,
            self.clinical_status,
            self.supervisor.is_reconnecting(),
            self.on_visit_view,
        )
    }
}

/// Receivers handed over at construction, consumed when the loop spawns.
struct PendingReceivers {
    loop_rx: mpsc::UnboundedReceiver<LoopEvent>,
    waiting_events: mpsc::UnboundedReceiver<SessionEvent>,
    clinical_events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct Inner {
    descriptor: VisitDescriptor,
    services: VisitServices,
    surface: Arc<dyn VisitSurface>,
    emitter: EventEmitter,
    waiting_room: Arc<dyn TransportSession>,
    clinical: Arc<dyn TransportSession>,
    chat: ChatChannel,
    wait_time: WaitTimeEstimator,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    pending: Mutex<Option<PendingReceivers>>,
    shared: Mutex<Shared>,
    completion_tx: watch::Sender<Option<CompletionReason>>,
}

/// Drives one virtual visit from join to completion.
pub struct VisitOrchestrator {
    inner: Arc<Inner>,
}

impl VisitOrchestrator {
    pub fn new(
        descriptor: VisitDescriptor,
        config: VisitConfig,
        waiting_room: SessionLink,
        clinical: SessionLink,
        services: VisitServices,
        surface: Arc<dyn VisitSurface>,
    ) -> Self {
        let emitter = EventEmitter::new();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (completion_tx, _) = watch::channel(None);

        let chat = ChatChannel::new(
            descriptor.visit_id.clone(),
            LocalChatIdentity {
                sender_id: descriptor.local_participant_id.clone(),
                display_name: descriptor.display_name.clone(),
                is_staff: descriptor.is_staff,
            },
            waiting_room.session.clone(),
            clinical.session.clone(),
            services.chat_log.clone(),
            emitter.clone(),
        );

        let wait_time = WaitTimeEstimator::new(
            descriptor.visit_id.clone(),
            services.wait_times.clone(),
            config.wait_time,
            emitter.clone(),
        );

        let shared = Shared {
            waiting_status: None,
            clinical_status: None,
            waiting_connection_id: None,
            clinical_connection_id: None,
            on_visit_view: false,
            waiting_room_shown: false,
            supervisor: ReconnectSupervisor::new(config.retry),
            stats: StatsAggregator::new(config.stats),
            publisher: None,
            subscription: None,
            waiting_room_view: None,
            visit_view: None,
            last_state: VisitState::NotStarted,
            completed: None,
            forwarder_tasks: Vec::new(),
            loop_task: None,
        };

        Self {
            inner: Arc::new(Inner {
                descriptor,
                services,
                surface,
                emitter,
                waiting_room: waiting_room.session,
                clinical: clinical.session,
                chat,
                wait_time,
                loop_tx,
                pending: Mutex::new(Some(PendingReceivers {
                    loop_rx,
                    waiting_events: waiting_room.events,
                    clinical_events: clinical.events,
                })),
                shared: Mutex::new(shared),
                completion_tx,
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn VisitEventListener>) {
        self.inner.emitter.add_listener(listener);
    }

    /// The current derived visit state.
    pub fn state(&self) -> VisitState {
        self.inner.shared.lock().unwrap().derive()
    }

    /// Terminal reason, once the visit has ended.
    pub fn completed(&self) -> Option<CompletionReason> {
        self.inner.shared.lock().unwrap().completed
    }

    /// Watch channel resolved with the completion reason.
    pub fn completion(&self) -> watch::Receiver<Option<CompletionReason>> {
        self.inner.completion_tx.subscribe()
    }

    /// Windowed network figures for the subscriber stream.
    pub fn subscriber_stats(&self) -> WindowStats {
        self.inner.shared.lock().unwrap().stats.subscriber_stats()
    }

    /// Windowed network figures for the publisher streams.
    pub fn publisher_stats(&self) -> Vec<WindowStats> {
        self.inner.shared.lock().unwrap().stats.publisher_stats()
    }

    /// Chat messages currently held for a phase.
    pub fn chat_messages(&self, phase: SessionPhase) -> Vec<ChatMessage> {
        self.inner.chat.messages(phase)
    }

    /// Join the visit.
    ///
    /// Returns once both session tokens were fetched and the initial
    /// handshakes have either succeeded or been handed to the reconnection
    /// supervisor. Non-virtual visits never open a transport session: the
    /// completion fires immediately and the visit id is returned.
    pub async fn join(&self) -> Result<String, VisitError> {
        let inner = &self.inner;
        let visit_id = inner.descriptor.visit_id.clone();

        if inner.descriptor.modality != VisitModality::Virtual {
            tracing::info!("visit {visit_id} is not virtual, completing without transport");
            inner.complete_without_transport(CompletionReason::PhoneVisit);
            return Ok(visit_id);
        }

        if !inner.services.permissions.media_granted().await {
            inner.complete_without_transport(CompletionReason::PermissionDenied);
            return Err(VisitError::PermissionDenied);
        }
        inner.emitter.emit(VisitEvent::DevicePairInitiated);

        inner.spawn_event_loop();

        // The two token reads are independent; fetch them concurrently.
        let tokens = &inner.services.tokens;
        let token_result = tokio::try_join!(
            tokens.fetch_token(&visit_id, inner.waiting_room.session_id()),
            tokens.fetch_token(&visit_id, inner.clinical.session_id()),
        );
        let (waiting_token, clinical_token) = match token_result {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("token fetch failed: {e}");
                inner.end_conference(CompletionReason::TransportFailed).await;
                return Err(e);
            }
        };

        {
            let mut shared = inner.shared.lock().unwrap();
            shared.set_status(SessionPhase::WaitingRoom, ConnectionStatus::Connecting);
            shared.set_status(SessionPhase::Clinical, ConnectionStatus::Connecting);
        }

        let (waiting_result, clinical_result) = tokio::join!(
            inner.waiting_room.connect(&waiting_token),
            inner.clinical.connect(&clinical_token),
        );
        inner
            .handle_initial_connect(SessionPhase::WaitingRoom, waiting_result)
            .await?;
        inner
            .handle_initial_connect(SessionPhase::Clinical, clinical_result)
            .await?;

        Ok(visit_id)
    }

    /// Send a chat message on the session matching the current phase.
    pub async fn send_chat_message(&self, text: &str) -> Result<(), VisitError> {
        let state = self.state();
        self.inner.chat.send(state, text).await
    }

    /// Signal the local typing state, suppressing redundant transitions.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), VisitError> {
        let state = self.state();
        self.inner.chat.set_typing(state, is_typing).await
    }

    /// Present the chat screen for the current phase and attach it as the
    /// refresh sink for inbound messages.
    pub fn open_chat(&self) {
        let phase = match self.state() {
            VisitState::Visit => SessionPhase::Clinical,
            VisitState::WaitingRoom => SessionPhase::WaitingRoom,
            other => {
                tracing::debug!("chat not available in state {other:?}");
                return;
            }
        };
        let view = self.inner.surface.show_chat();
        self.inner.chat.attach_view(phase, Arc::downgrade(&view));
    }

    /// User-initiated termination. Asks for confirmation, sends a best-effort
    /// farewell signal, then ends the visit.
    pub async fn hang_up(&self) {
        if !self.inner.surface.confirm("Leave the visit?").await {
            return;
        }

        let state = self.state();
        let (session, reason) = match state {
            VisitState::Visit | VisitState::VisitReconnecting => {
                (&self.inner.clinical, CompletionReason::Completed)
            }
            VisitState::WaitingRoom | VisitState::WaitingRoomReconnecting => {
                (&self.inner.waiting_room, CompletionReason::CancelledByUser)
            }
            _ => (&self.inner.clinical, CompletionReason::Completed),
        };

        if let Err(e) = session.signal(signal_kind::PARTICIPANT_LEFT, "{}").await {
            tracing::debug!("farewell signal failed: {e}");
        }
        if reason == CompletionReason::CancelledByUser {
            self.inner.emitter.emit(VisitEvent::CancelledByUser);
        }
        self.inner.end_conference(reason).await;
    }

    /// Cancel affordance of the reconnecting indicator. Asks for
    /// confirmation; on decline, reconnection keeps going.
    pub async fn cancel_reconnect(&self) {
        let confirmed = self
            .inner
            .surface
            .confirm("Stop waiting for the connection and leave the visit?")
            .await;
        if confirmed {
            self.inner
                .end_conference(CompletionReason::ExceededReconnectAttempt)
                .await;
        }
    }

    /// Terminate the visit with an explicit reason. Idempotent.
    pub async fn end_conference(&self, reason: CompletionReason) {
        self.inner.end_conference(reason).await;
    }
}

impl Inner {
    fn session(&self, phase: SessionPhase) -> &Arc<dyn TransportSession> {
        match phase {
            SessionPhase::WaitingRoom => &self.waiting_room,
            SessionPhase::Clinical => &self.clinical,
        }
    }

    fn soft_error(&self, message: String) {
        tracing::warn!("{message}");
        self.emitter.emit(VisitEvent::SoftError(message));
    }

    /// Recompute the derived state and emit a change notification if it
    /// moved.
    fn sync_state(&self) {
        let changed = {
            let mut shared = self.shared.lock().unwrap();
            let state = shared.derive();
            if state != shared.last_state {
                shared.last_state = state;
                Some(state)
            } else {
                None
            }
        };
        if let Some(state) = changed {
            tracing::info!("visit state -> {state:?}");
            self.emitter.emit(VisitEvent::StateChanged(state));
        }
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let Some(pending) = self.pending.lock().unwrap().take() else {
            return;
        };
        let PendingReceivers {
            mut loop_rx,
            waiting_events,
            clinical_events,
        } = pending;

        let mut forwarders = Vec::new();
        for (phase, mut events) in [
            (SessionPhase::WaitingRoom, waiting_events),
            (SessionPhase::Clinical, clinical_events),
        ] {
            let tx = self.loop_tx.clone();
            forwarders.push(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx.send(LoopEvent::Session(phase, event)).is_err() {
                        break;
                    }
                }
            }));
        }

        let inner = self.clone();
        let loop_task = tokio::spawn(async move {
            while let Some(event) = loop_rx.recv().await {
                if inner.shared.lock().unwrap().completed.is_some() {
                    break;
                }
                match event {
                    LoopEvent::Session(phase, event) => {
                        inner.handle_session_event(phase, event).await
                    }
                    LoopEvent::Control(control) => inner.handle_control(control).await,
                }
            }
            tracing::debug!("visit event loop ended");
        });

        let mut shared = self.shared.lock().unwrap();
        shared.forwarder_tasks = forwarders;
        shared.loop_task = Some(loop_task);
    }

    /// Fold an initial `connect` result into the failure taxonomy: retryable
    /// codes go to the supervisor via the loop, fatal ones end the visit.
    async fn handle_initial_connect(
        self: &Arc<Self>,
        phase: SessionPhase,
        result: Result<(), crate::transport::TransportError>,
    ) -> Result<(), VisitError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code.is_retryable() => {
                tracing::warn!("{phase:?} session connect failed, will retry: {e}");
                let _ = self
                    .loop_tx
                    .send(LoopEvent::Session(phase, SessionEvent::ConnectFailed(e.code)));
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{phase:?} session connect failed fatally: {e}");
                self.end_conference(map_fatal(e.code)).await;
                Err(VisitError::Transport(e.to_string()))
            }
        }
    }

    async fn handle_control(self: &Arc<Self>, control: ControlEvent) {
        match control {
            ControlEvent::RetryConnect(phase) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.connect_session(phase).await;
                });
            }
            ControlEvent::ReconnectTimedOut => {
                tracing::warn!("reconnect timeout elapsed");
                self.end_conference(CompletionReason::ExceededReconnectAttempt)
                    .await;
            }
            ControlEvent::Shutdown => {}
        }
    }

    /// Fetch a fresh token and reconnect one session. Failures are fed back
    /// into the loop as retryable connect failures.
    async fn connect_session(self: &Arc<Self>, phase: SessionPhase) {
        let session = self.session(phase).clone();
        let token = match self
            .services
            .tokens
            .fetch_token(&self.descriptor.visit_id, session.session_id())
            .await
        {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("token fetch for {phase:?} reconnect failed: {e}");
                let _ = self.loop_tx.send(LoopEvent::Session(
                    phase,
                    SessionEvent::ConnectFailed(TransportErrorCode::ConnectionFailed),
                ));
                return;
            }
        };

        {
            let mut shared = self.shared.lock().unwrap();
            if shared.completed.is_some() {
                return;
            }
            shared.set_status(phase, ConnectionStatus::Connecting);
        }

        if let Err(e) = session.connect(&token).await {
            let _ = self
                .loop_tx
                .send(LoopEvent::Session(phase, SessionEvent::ConnectFailed(e.code)));
        }
    }

    async fn handle_session_event(self: &Arc<Self>, phase: SessionPhase, event: SessionEvent) {
        match event {
            SessionEvent::Connected { connection_id } => {
                self.on_session_connected(phase, connection_id).await
            }
            SessionEvent::Reconnected => self.on_session_reconnected(phase),
            SessionEvent::Reconnecting => {
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.set_status(phase, ConnectionStatus::Reconnecting);
                }
                self.begin_reconnecting(phase, true);
                self.sync_state();
            }
            SessionEvent::Disconnected => {
                tracing::info!("{phase:?} session disconnected");
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.set_status(phase, ConnectionStatus::NotConnected);
                }
                self.sync_state();
            }
            SessionEvent::ConnectFailed(code) | SessionEvent::SessionError(code) => {
                self.on_transport_failure(phase, code).await
            }
            SessionEvent::StreamCreated(info) => self.on_stream_created(phase, info).await,
            SessionEvent::StreamDestroyed { stream_id } => {
                self.on_stream_destroyed(phase, stream_id).await
            }
            SessionEvent::SignalReceived {
                kind,
                payload,
                from_connection_id,
            } => self.on_signal(phase, kind, payload, from_connection_id).await,
            SessionEvent::StatsReport {
                subscriber,
                publishers,
            } => {
                if phase == SessionPhase::Clinical {
                    let mut shared = self.shared.lock().unwrap();
                    if let Some(raw) = subscriber {
                        shared.stats.record_subscriber(&raw);
                    }
                    shared.stats.record_publishers(&publishers);
                }
            }
        }
    }

    async fn on_session_connected(self: &Arc<Self>, phase: SessionPhase, connection_id: String) {
        let recovered = {
            let mut shared = self.shared.lock().unwrap();
            shared.set_status(phase, ConnectionStatus::Connected);
            shared.set_connection_id(phase, connection_id);
            shared.supervisor.on_connected(phase);
            let recovered = shared.supervisor.is_reconnecting() && shared.both_connected();
            if recovered {
                shared.supervisor.reconnected();
            }
            recovered
        };
        if recovered {
            self.on_recovered(phase);
        }

        match phase {
            SessionPhase::WaitingRoom => self.maybe_show_waiting_room(),
            SessionPhase::Clinical => {
                // Resuming an in-progress visit skips the waiting room.
                if self.descriptor.resuming {
                    self.enter_visit_view().await;
                }
            }
        }
        self.sync_state();
    }

    fn on_session_reconnected(self: &Arc<Self>, phase: SessionPhase) {
        let recovered = {
            let mut shared = self.shared.lock().unwrap();
            shared.set_status(phase, ConnectionStatus::Connected);
            shared.supervisor.on_connected(phase);
            // A single session recovering is not enough to drop the flag.
            let recovered = shared.supervisor.is_reconnecting() && shared.both_connected();
            if recovered {
                shared.supervisor.reconnected();
            }
            recovered
        };
        if recovered {
            self.on_recovered(phase);
        }
        self.sync_state();
    }

    /// Both sessions are back: drop the indicator and, when still in the
    /// waiting room, resume wait-time polling.
    fn on_recovered(&self, phase: SessionPhase) {
        self.surface.reconnected();
        self.emitter.emit(VisitEvent::Reconnected(phase));

        let view = {
            let shared = self.shared.lock().unwrap();
            if shared.on_visit_view {
                None
            } else {
                shared.waiting_room_view.clone()
            }
        };
        if let Some(view) = view {
            self.wait_time.start(view);
        }
    }

    /// Present the waiting room the first time the waiting-room session comes
    /// up, unless this is a resumed visit.
    fn maybe_show_waiting_room(&self) {
        let should_show = {
            let mut shared = self.shared.lock().unwrap();
            let show = !self.descriptor.resuming
                && !shared.waiting_room_shown
                && !shared.on_visit_view
                && shared.derive() == VisitState::WaitingRoom;
            if show {
                shared.waiting_room_shown = true;
            }
            show
        };
        if !should_show {
            return;
        }

        let view = self.surface.show_waiting_room();
        let weak = Arc::downgrade(&view);
        self.shared.lock().unwrap().waiting_room_view = Some(weak.clone());
        self.wait_time.start(weak);
        self.emitter.emit(VisitEvent::WaitingRoomLaunched);
        self.emitter.emit(VisitEvent::TechCheckSubmitted);
    }

    /// Move the local participant onto the clinical view and publish local
    /// media. Publish failure is fatal.
    async fn enter_visit_view(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.on_visit_view || shared.completed.is_some() {
                return;
            }
            shared.on_visit_view = true;
        }
        self.wait_time.stop();

        let view = self.surface.show_visit();
        self.shared.lock().unwrap().visit_view = Some(Arc::downgrade(&view));

        match self.clinical.publish().await {
            Ok(handle) => {
                self.shared.lock().unwrap().publisher = Some(handle);
            }
            Err(e) => {
                tracing::warn!("publish failed: {e}");
                self.end_conference(map_fatal(e.code)).await;
                return;
            }
        }

        self.emitter.emit(VisitEvent::VisitStarted);
        self.sync_state();
    }

    async fn on_transport_failure(self: &Arc<Self>, phase: SessionPhase, code: TransportErrorCode) {
        if !code.is_retryable() {
            {
                let mut shared = self.shared.lock().unwrap();
                shared.set_status(phase, ConnectionStatus::Failed);
            }
            self.sync_state();
            self.end_conference(map_fatal(code)).await;
            return;
        }

        let decision = {
            let mut shared = self.shared.lock().unwrap();
            shared.supervisor.on_retryable_failure(phase)
        };
        match decision {
            RetryDecision::Retry { delay, .. } => {
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.set_status(phase, ConnectionStatus::Reconnecting);
                }
                // Connect retries have their own bound; the 30s indicator
                // timeout only guards transport-driven reconnect windows.
                self.begin_reconnecting(phase, false);
                self.sync_state();

                let tx = self.loop_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(LoopEvent::Control(ControlEvent::RetryConnect(phase)));
                });
            }
            RetryDecision::Escalate => {
                self.end_conference(CompletionReason::ExceededReconnectAttempt)
                    .await;
            }
        }
    }

    /// Raise the reconnecting flag, notify the surface, and (re)arm the
    /// give-up timer when `timeout` is set.
    fn begin_reconnecting(&self, phase: SessionPhase, timeout: bool) {
        let (newly, on_visit_view) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.completed.is_some() {
                return;
            }
            let newly = !shared.supervisor.is_reconnecting();
            let tx = self.loop_tx.clone();
            shared.supervisor.begin_reconnecting(timeout, move || {
                let _ = tx.send(LoopEvent::Control(ControlEvent::ReconnectTimedOut));
            });
            (newly, shared.on_visit_view)
        };
        if newly {
            if !on_visit_view {
                // Paused while degraded; resumed by on_recovered.
                self.wait_time.stop();
            }
            self.surface.reconnecting();
            self.emitter.emit(VisitEvent::Reconnecting(phase));
        }
    }

    async fn on_stream_created(self: &Arc<Self>, phase: SessionPhase, info: crate::transport::RemoteStreamInfo) {
        if phase != SessionPhase::Clinical {
            tracing::debug!("stream on {phase:?} session ignored");
            return;
        }
        if info.publisher_role == self.descriptor.local_role {
            tracing::debug!("own stream {} ignored", info.stream_id);
            return;
        }

        // At most one active remote subscription.
        let prior = self.shared.lock().unwrap().subscription.take();
        if let Some(handle) = prior {
            if let Err(e) = self.clinical.unsubscribe(&handle).await {
                tracing::debug!("unsubscribe of prior stream failed: {e}");
            }
        }

        match self.clinical.subscribe(&info).await {
            Ok(handle) => {
                let recovered = {
                    let mut shared = self.shared.lock().unwrap();
                    shared.subscription = Some(handle);
                    // A re-created stream ends a reconnect window opened by
                    // the destruction of its predecessor.
                    let recovered =
                        shared.supervisor.is_reconnecting() && shared.both_connected();
                    if recovered {
                        shared.supervisor.reconnected();
                    }
                    recovered
                };
                if recovered {
                    self.surface.reconnected();
                    self.emitter.emit(VisitEvent::Reconnected(phase));
                }
                self.enter_visit_view().await;
                self.notify_remote_stream(true);
                self.sync_state();
            }
            Err(e) => {
                tracing::warn!("subscribe failed: {e}");
                self.end_conference(CompletionReason::SubscribeFailed).await;
            }
        }
    }

    async fn on_stream_destroyed(self: &Arc<Self>, phase: SessionPhase, stream_id: String) {
        if phase != SessionPhase::Clinical {
            return;
        }
        tracing::info!("remote stream {stream_id} destroyed");

        let sub = self.shared.lock().unwrap().subscription.take();
        if let Some(handle) = sub {
            if let Err(e) = self.clinical.unsubscribe(&handle).await {
                tracing::debug!("unsubscribe failed: {e}");
            }
        }
        self.notify_remote_stream(false);

        // Give the transport a chance to re-establish before failing.
        self.begin_reconnecting(phase, true);
        self.sync_state();
    }

    fn notify_remote_stream(&self, active: bool) {
        let view = {
            let shared = self.shared.lock().unwrap();
            shared.visit_view.as_ref().and_then(|w| w.upgrade())
        };
        if let Some(view) = view {
            view.set_remote_stream_active(active);
        }
    }

    async fn on_signal(
        self: &Arc<Self>,
        phase: SessionPhase,
        kind: String,
        payload: String,
        from_connection_id: String,
    ) {
        let from_self = self
            .shared
            .lock()
            .unwrap()
            .is_own_connection(&from_connection_id);

        match kind.as_str() {
            signal_kind::PARTICIPANT_LEFT => {
                if !from_self {
                    tracing::info!("remote participant left, completing visit");
                    self.end_conference(CompletionReason::Completed).await;
                }
            }
            signal_kind::INSTANT_MESSAGE => {
                if let Err(e) = self.chat.handle_instant_message(phase, &payload) {
                    self.soft_error(format!("bad chat payload: {e}"));
                }
            }
            signal_kind::TYPING_STATE => {
                let state = self.shared.lock().unwrap().derive();
                if let Err(e) = self.chat.handle_typing_state(state, phase, from_self, &payload) {
                    self.soft_error(format!("bad typing payload: {e}"));
                }
            }
            signal_kind::ERROR => match signaling::decode::<ErrorSignalPayload>(&payload) {
                Ok(p) if p.error_type == ERROR_JOINED_ELSEWHERE => {
                    self.end_conference(CompletionReason::JoinedElsewhere).await;
                }
                Ok(p) => self.soft_error(format!("error signal: {}", p.error_type)),
                Err(e) => self.soft_error(format!("bad error payload: {e}")),
            },
            signal_kind::STATUS_CHANGE => match signaling::decode::<StatusChangePayload>(&payload) {
                Ok(p) if p.status == STATUS_DECLINED => {
                    self.surface
                        .display_alert("The provider is unable to see you at this time.");
                    self.emitter.emit(VisitEvent::DeclinedByProvider);
                    self.end_conference(CompletionReason::DeclinedByProvider)
                        .await;
                }
                Ok(p) => tracing::debug!("status change {} ignored", p.status),
                Err(e) => self.soft_error(format!("bad status payload: {e}")),
            },
            other => tracing::debug!("unknown signal kind {other} ignored"),
        }
    }

    /// Completion for visits that never open a transport session.
    fn complete_without_transport(&self, reason: CompletionReason) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.completed.is_some() {
                return;
            }
            shared.completed = Some(reason);
        }
        self.emitter.emit(VisitEvent::VisitCompleted(reason));
        let _ = self.completion_tx.send(Some(reason));
    }

    /// The single termination routine every fatal path converges on.
    ///
    /// Runs exactly once: the first caller marks the visit completed under
    /// the lock and performs the teardown; later callers return immediately.
    async fn end_conference(&self, reason: CompletionReason) {
        let (publisher, subscription) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.completed.is_some() {
                return;
            }
            shared.completed = Some(reason);
            shared.supervisor.cancel_timeout();
            for task in shared.forwarder_tasks.drain(..) {
                task.abort();
            }
            (shared.publisher.take(), shared.subscription.take())
        };
        tracing::info!("ending visit {}: {reason:?}", self.descriptor.visit_id);

        self.wait_time.stop();
        self.chat.clear();

        if let Some(handle) = subscription {
            if let Err(e) = self.clinical.unsubscribe(&handle).await {
                tracing::debug!("unsubscribe during teardown failed: {e}");
            }
        }
        if let Some(handle) = publisher {
            if let Err(e) = self.clinical.unpublish(&handle).await {
                tracing::debug!("unpublish during teardown failed: {e}");
            }
        }
        let (wr, cl) = futures_util::future::join(
            self.waiting_room.disconnect(),
            self.clinical.disconnect(),
        )
        .await;
        if let Err(e) = wr {
            tracing::debug!("waiting room disconnect failed: {e}");
        }
        if let Err(e) = cl {
            tracing::debug!("clinical disconnect failed: {e}");
        }

        self.emitter.emit(VisitEvent::VisitCompleted(reason));
        let _ = self.completion_tx.send(Some(reason));
        // Wake the loop so it observes the completed flag and exits.
        let _ = self.loop_tx.send(LoopEvent::Control(ControlEvent::Shutdown));
    }
}

fn map_fatal(code: TransportErrorCode) -> CompletionReason {
    match code {
        TransportErrorCode::SubscribeFailed => CompletionReason::SubscribeFailed,
        _ => CompletionReason::TransportFailed,
    }
}
