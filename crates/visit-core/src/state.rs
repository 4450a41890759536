//! Derived visit state.
//!
//! The visit never stores its state: it is recomputed from the two session
//! connection statuses, the reconnecting flag, and whether the local
//! participant has moved to the clinical view. Keeping this a pure function
//! means a transport callback can never observe a stale state.

/// Connection status of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Which of the two sequential parts of a visit a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    WaitingRoom,
    Clinical,
}

/// The single derived state of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitState {
    NotStarted,
    WaitingRoom,
    WaitingRoomReconnecting,
    Visit,
    VisitReconnecting,
    Failed,
}

/// Compute the visit state from current session facts.
///
/// Clinical-session signals take priority over waiting-room signals once the
/// local participant has moved to the clinical view. Statuses that don't
/// select a phase yet (still connecting, not connected) read as `NotStarted`.
pub fn derive_state(
    waiting_room: Option<ConnectionStatus>,
    clinical: Option<ConnectionStatus>,
    is_reconnecting: bool,
    on_visit_view: bool,
) -> VisitState {
    let (Some(waiting_room), Some(clinical)) = (waiting_room, clinical) else {
        return VisitState::NotStarted;
    };

    if is_reconnecting {
        return if on_visit_view {
            VisitState::VisitReconnecting
        } else {
            VisitState::WaitingRoomReconnecting
        };
    }

    if waiting_room == ConnectionStatus::Failed || clinical == ConnectionStatus::Failed {
        return VisitState::Failed;
    }

    if on_visit_view {
        match clinical {
            ConnectionStatus::Reconnecting => return VisitState::VisitReconnecting,
            ConnectionStatus::Connected => return VisitState::Visit,
            _ => {}
        }
    }

    match waiting_room {
        ConnectionStatus::Reconnecting => VisitState::WaitingRoomReconnecting,
        ConnectionStatus::Connected => VisitState::WaitingRoom,
        ConnectionStatus::NotConnected | ConnectionStatus::Connecting => VisitState::NotStarted,
        ConnectionStatus::Failed => VisitState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    const ALL: [ConnectionStatus; 5] = [NotConnected, Connecting, Connected, Reconnecting, Failed];

    #[test]
    fn missing_status_is_not_started() {
        assert_eq!(derive_state(None, None, false, false), VisitState::NotStarted);
        assert_eq!(
            derive_state(Some(Connected), None, false, false),
            VisitState::NotStarted
        );
        assert_eq!(
            derive_state(None, Some(Connected), false, true),
            VisitState::NotStarted
        );
    }

    #[test]
    fn reconnecting_flag_dominates() {
        assert_eq!(
            derive_state(Some(Connected), Some(Failed), true, true),
            VisitState::VisitReconnecting
        );
        assert_eq!(
            derive_state(Some(Failed), Some(Connected), true, false),
            VisitState::WaitingRoomReconnecting
        );
    }

    #[test]
    fn failed_session_fails_the_visit() {
        assert_eq!(
            derive_state(Some(Failed), Some(Connecting), false, false),
            VisitState::Failed
        );
        assert_eq!(
            derive_state(Some(Connected), Some(Failed), false, false),
            VisitState::Failed
        );
    }

    #[test]
    fn clinical_view_prefers_clinical_session() {
        assert_eq!(
            derive_state(Some(Connected), Some(Connected), false, true),
            VisitState::Visit
        );
        assert_eq!(
            derive_state(Some(Connected), Some(Reconnecting), false, true),
            VisitState::VisitReconnecting
        );
        // Clinical not up yet: waiting-room status still decides.
        assert_eq!(
            derive_state(Some(Connected), Some(Connecting), false, true),
            VisitState::WaitingRoom
        );
    }

    #[test]
    fn waiting_room_states() {
        assert_eq!(
            derive_state(Some(Connected), Some(NotConnected), false, false),
            VisitState::WaitingRoom
        );
        assert_eq!(
            derive_state(Some(Reconnecting), Some(NotConnected), false, false),
            VisitState::WaitingRoomReconnecting
        );
        assert_eq!(
            derive_state(Some(Connecting), Some(NotConnected), false, false),
            VisitState::NotStarted
        );
    }

    #[test]
    fn derivation_is_total() {
        // Every reachable tuple yields a state without panicking.
        for wr in ALL {
            for cl in ALL {
                for reconnecting in [false, true] {
                    for on_view in [false, true] {
                        derive_state(Some(wr), Some(cl), reconnecting, on_view);
                    }
                }
            }
        }
    }
}
