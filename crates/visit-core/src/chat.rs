//! Chat over the signaling channel.
//!
//! [`ChatLog`] keeps the two per-phase message lists ordered and free of
//! duplicates; [`ChatChannel`] does the wire work: outbound sends on whichever
//! session matches the current phase, typing-indicator dedup, inbound
//! idempotent receive, and best-effort persistence of sent messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::errors::VisitError;
use crate::events::{EventEmitter, VisitEvent};
use crate::services::ChatPersistence;
use crate::signaling::{self, InstantMessagePayload, TypingStatePayload};
use crate::state::{SessionPhase, VisitState};
use crate::surface::ChatView;
use crate::transport::{TransportSession, signal_kind};

/// One chat message, in memory for the duration of the visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_id: String,
    pub display_name: String,
    pub message_id: String,
    pub sent_at_ms: u64,
    pub text: String,
    pub is_staff: bool,
}

/// Ordered, append-only message lists, one per phase.
#[derive(Debug, Default)]
pub struct ChatLog {
    lists: HashMap<SessionPhase, Vec<ChatMessage>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message into the phase's list, keeping it sorted by
    /// `sent_at_ms`. A duplicate `message_id` is dropped, not replaced.
    /// Returns whether the message was actually inserted.
    pub fn insert(&mut self, phase: SessionPhase, message: ChatMessage) -> bool {
        let list = self.lists.entry(phase).or_default();
        if list.iter().any(|m| m.message_id == message.message_id) {
            return false;
        }
        list.push(message);
        list.sort_by_key(|m| m.sent_at_ms);
        true
    }

    pub fn messages(&self, phase: SessionPhase) -> Vec<ChatMessage> {
        self.lists.get(&phase).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }
}

/// Identity used for outbound messages.
#[derive(Debug, Clone)]
pub struct LocalChatIdentity {
    pub sender_id: String,
    pub display_name: String,
    pub is_staff: bool,
}

/// Sends and receives chat/typing signals over the visit's two sessions.
pub struct ChatChannel {
    visit_id: String,
    identity: LocalChatIdentity,
    waiting_room: Arc<dyn TransportSession>,
    clinical: Arc<dyn TransportSession>,
    log: Arc<Mutex<ChatLog>>,
    last_typing_sent: Mutex<Option<bool>>,
    persistence: Arc<dyn ChatPersistence>,
    emitter: EventEmitter,
    /// Chat view currently on screen, if any, with the phase it displays.
    /// A sink only; never consulted for state.
    chat_view: Mutex<Option<(SessionPhase, Weak<dyn ChatView>)>>,
}

/// The session phase an outbound chat signal should ride on, if any.
fn outbound_phase(state: VisitState) -> Option<SessionPhase> {
    match state {
        VisitState::Visit => Some(SessionPhase::Clinical),
        VisitState::WaitingRoom => Some(SessionPhase::WaitingRoom),
        _ => None,
    }
}

impl ChatChannel {
    pub fn new(
        visit_id: String,
        identity: LocalChatIdentity,
        waiting_room: Arc<dyn TransportSession>,
        clinical: Arc<dyn TransportSession>,
        persistence: Arc<dyn ChatPersistence>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            visit_id,
            identity,
            waiting_room,
            clinical,
            log: Arc::new(Mutex::new(ChatLog::new())),
            last_typing_sent: Mutex::new(None),
            persistence,
            emitter,
            chat_view: Mutex::new(None),
        }
    }

    fn session_for(&self, phase: SessionPhase) -> &Arc<dyn TransportSession> {
        match phase {
            SessionPhase::WaitingRoom => &self.waiting_room,
            SessionPhase::Clinical => &self.clinical,
        }
    }

    /// Attach the chat view currently on screen so inbound messages can
    /// trigger a refresh.
    pub fn attach_view(&self, phase: SessionPhase, view: Weak<dyn ChatView>) {
        *self.chat_view.lock().unwrap() = Some((phase, view));
    }

    pub fn detach_view(&self) {
        *self.chat_view.lock().unwrap() = None;
    }

    pub fn messages(&self, phase: SessionPhase) -> Vec<ChatMessage> {
        self.log.lock().unwrap().messages(phase)
    }

    /// Send a chat message on the session matching the current phase.
    ///
    /// A no-op outside the waiting-room and visit phases. Persistence runs in
    /// the background; its failures are logged and never surfaced to the
    /// sender.
    pub async fn send(&self, state: VisitState, text: &str) -> Result<(), VisitError> {
        let Some(phase) = outbound_phase(state) else {
            tracing::debug!("chat send ignored in state {state:?}");
            return Ok(());
        };

        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let message = ChatMessage {
            sender_id: self.identity.sender_id.clone(),
            display_name: self.identity.display_name.clone(),
            message_id: uuid::Uuid::new_v4().to_string(),
            sent_at_ms: now_ms,
            text: text.to_string(),
            is_staff: self.identity.is_staff,
        };

        let payload = InstantMessagePayload {
            from_participant: message.display_name.clone(),
            sender_id: Some(message.sender_id.clone()),
            creation_time_epoch_ms: message.sent_at_ms.to_string(),
            unique_id: message.message_id.clone(),
            message: message.text.clone(),
            is_staff: Some(message.is_staff),
        };
        let json = signaling::encode(&payload)?;

        let session = self.session_for(phase);
        session
            .signal(signal_kind::INSTANT_MESSAGE, &json)
            .await
            .map_err(|e| VisitError::Transport(e.to_string()))?;

        self.log.lock().unwrap().insert(phase, message.clone());
        self.refresh_view(phase);

        let persistence = self.persistence.clone();
        let visit_id = self.visit_id.clone();
        let session_id = session.session_id().to_string();
        tokio::spawn(async move {
            if let Err(e) = persistence.post(&visit_id, &session_id, &message).await {
                tracing::warn!("chat persistence failed: {e}");
            }
        });

        Ok(())
    }

    /// Signal a typing-state change, suppressing redundant transitions.
    pub async fn set_typing(&self, state: VisitState, is_typing: bool) -> Result<(), VisitError> {
        if *self.last_typing_sent.lock().unwrap() == Some(is_typing) {
            return Ok(());
        }
        let Some(phase) = outbound_phase(state) else {
            return Ok(());
        };

        let payload = TypingStatePayload {
            display_name: self.identity.display_name.clone(),
            typing_state: if is_typing { 1 } else { 0 },
        };
        let json = signaling::encode(&payload)?;

        self.session_for(phase)
            .signal(signal_kind::TYPING_STATE, &json)
            .await
            .map_err(|e| VisitError::Transport(e.to_string()))?;

        *self.last_typing_sent.lock().unwrap() = Some(is_typing);
        Ok(())
    }

    /// Handle an inbound `instantMessage` signal from `origin_phase`.
    ///
    /// Duplicate message ids are discarded. A parse failure is returned to the
    /// caller, which reports it as a soft error; the visit continues.
    pub fn handle_instant_message(
        &self,
        origin_phase: SessionPhase,
        payload: &str,
    ) -> Result<(), VisitError> {
        let decoded: InstantMessagePayload = signaling::decode(payload)?;
        let sent_at_ms = decoded
            .creation_time_epoch_ms
            .parse::<u64>()
            .map_err(|e| VisitError::Signal(format!("creationTimeEpochMs: {e}")))?;

        let message = ChatMessage {
            sender_id: decoded.sender_id.unwrap_or_default(),
            display_name: decoded.from_participant,
            message_id: decoded.unique_id,
            sent_at_ms,
            text: decoded.message,
            is_staff: decoded.is_staff.unwrap_or(false),
        };

        let inserted = self.log.lock().unwrap().insert(origin_phase, message.clone());
        if !inserted {
            tracing::debug!("duplicate chat message {} dropped", message.message_id);
            return Ok(());
        }

        self.refresh_view(origin_phase);
        self.emitter
            .emit(VisitEvent::ChatMessageReceived(origin_phase, message));
        Ok(())
    }

    /// Handle an inbound `typingStateMessage` signal.
    ///
    /// `from_self` marks signals that originated from one of the visit's own
    /// connections; those are echoes and are ignored. The indicator only
    /// changes when the remote's phase matches the phase we're displaying.
    pub fn handle_typing_state(
        &self,
        current_state: VisitState,
        origin_phase: SessionPhase,
        from_self: bool,
        payload: &str,
    ) -> Result<(), VisitError> {
        if from_self {
            return Ok(());
        }
        let decoded: TypingStatePayload = signaling::decode(payload)?;

        let displayed_phase = match current_state {
            VisitState::Visit => Some(SessionPhase::Clinical),
            VisitState::WaitingRoom => Some(SessionPhase::WaitingRoom),
            _ => None,
        };
        if displayed_phase != Some(origin_phase) {
            return Ok(());
        }

        match decoded.typing_state {
            1 => {
                self.notify_view_typing(true);
                self.emitter.emit(VisitEvent::RemoteTypingStarted {
                    display_name: decoded.display_name,
                });
            }
            0 => {
                self.notify_view_typing(false);
                self.emitter.emit(VisitEvent::RemoteTypingStopped);
            }
            other => tracing::debug!("unknown typing state {other} ignored"),
        }
        Ok(())
    }

    /// Drop all in-memory chat state (visit teardown).
    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
        *self.last_typing_sent.lock().unwrap() = None;
        self.detach_view();
    }

    fn refresh_view(&self, phase: SessionPhase) {
        let guard = self.chat_view.lock().unwrap();
        if let Some((view_phase, view)) = guard.as_ref() {
            if *view_phase == phase {
                if let Some(view) = view.upgrade() {
                    view.refresh_messages(&self.log.lock().unwrap().messages(phase));
                }
            }
        }
    }

    fn notify_view_typing(&self, is_typing: bool) {
        let guard = self.chat_view.lock().unwrap();
        if let Some((_, view)) = guard.as_ref() {
            if let Some(view) = view.upgrade() {
                view.set_remote_typing(is_typing);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, sent_at_ms: u64) -> ChatMessage {
        ChatMessage {
            sender_id: "p1".to_string(),
            display_name: "Pat".to_string(),
            message_id: id.to_string(),
            sent_at_ms,
            text: format!("msg {id}"),
            is_staff: false,
        }
    }

    #[test]
    fn duplicate_id_dropped_not_replaced() {
        let mut log = ChatLog::new();
        let original = message("m1", 100);
        assert!(log.insert(SessionPhase::Clinical, original.clone()));

        let mut late = message("m1", 200);
        late.text = "edited".to_string();
        assert!(!log.insert(SessionPhase::Clinical, late));

        let list = log.messages(SessionPhase::Clinical);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0], original);
    }

    #[test]
    fn sorted_by_sent_at_regardless_of_arrival_order() {
        let mut log = ChatLog::new();
        log.insert(SessionPhase::WaitingRoom, message("m3", 300));
        log.insert(SessionPhase::WaitingRoom, message("m1", 100));
        log.insert(SessionPhase::WaitingRoom, message("m2", 200));

        let ids: Vec<_> = log
            .messages(SessionPhase::WaitingRoom)
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn phases_keep_separate_lists() {
        let mut log = ChatLog::new();
        log.insert(SessionPhase::WaitingRoom, message("m1", 100));
        log.insert(SessionPhase::Clinical, message("m2", 50));

        assert_eq!(log.messages(SessionPhase::WaitingRoom).len(), 1);
        assert_eq!(log.messages(SessionPhase::Clinical).len(), 1);
    }

    #[test]
    fn outbound_phase_routing() {
        assert_eq!(
            outbound_phase(VisitState::Visit),
            Some(SessionPhase::Clinical)
        );
        assert_eq!(
            outbound_phase(VisitState::WaitingRoom),
            Some(SessionPhase::WaitingRoom)
        );
        assert_eq!(outbound_phase(VisitState::WaitingRoomReconnecting), None);
        assert_eq!(outbound_phase(VisitState::VisitReconnecting), None);
        assert_eq!(outbound_phase(VisitState::NotStarted), None);
        assert_eq!(outbound_phase(VisitState::Failed), None);
    }
}
