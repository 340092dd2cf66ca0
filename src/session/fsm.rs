//! Session FSM (C7): FIX session lifecycle, sequence numbers, and
//! out-of-order buffering/replay. `original_source/src/session.cpp` is a
//! simplification that lacks the resend-window buffering implemented here.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::fix::message::FixMessage;
use crate::fix::messages;
use crate::fix::tags;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    pub sender_comp_id: String,
    pub target_comp_id: String,
}

impl SessionId {
    pub fn new(sender_comp_id: impl Into<String>, target_comp_id: impl Into<String>) -> Self {
        Self {
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
        }
    }

    /// The ID as the peer addresses it: sender/target swapped.
    pub fn reversed(&self) -> SessionId {
        SessionId::new(self.target_comp_id.clone(), self.sender_comp_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    LogonSent,
    Established,
    LogoutSent,
}

/// The persisted counters backing C9's `session_states` row, loaded at
/// reconnect to resume sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSessionState {
    pub sender: String,
    pub target: String,
    pub send_seq: i64,
    pub recv_seq: i64,
    pub last_update_time: i64,
}

/// Outcome of feeding an inbound business (`fromApp`) message to the FSM.
pub enum BusinessOutcome {
    /// Messages for `Application.fromApp`, ascending by seq — may include
    /// previously buffered messages this one unblocked.
    Deliver(Vec<FixMessage>),
    /// Seq ran ahead of expected; the message was buffered and this
    /// ResendRequest should be sent to the peer.
    ResendRequest(FixMessage),
    /// Seq fell behind expected without PossDupFlag=Y: fatal for the session.
    Shutdown(String),
}

/// Outcome of a recv-idle timer tick (the 1.5·heartBtInt rule).
pub enum RecvTimeoutOutcome {
    Ok,
    SendTestRequest(FixMessage),
    Shutdown(String),
}

struct Inner {
    state: SessionState,
    send_seq: i64,
    recv_seq: i64,
    last_send_time: i64,
    last_recv_time: i64,
    outstanding_test_req_id: Option<String>,
    pending: BTreeMap<i64, FixMessage>,
}

/// One FIX session. All mutable state sits behind a single mutex.
/// Ordinary traffic for this session only ever runs on
/// the one worker its owning Connection is pinned to, so this lock sees
/// no real contention — it exists so the timing-wheel thread and the
/// shutdown broadcast can also touch session state safely.
pub struct Session {
    pub session_id: SessionId,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(session_id: SessionId, now: i64) -> Self {
        Self {
            session_id,
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                send_seq: 1,
                recv_seq: 1,
                last_send_time: now,
                last_recv_time: now,
                outstanding_test_req_id: None,
                pending: BTreeMap::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn restore_persisted(&self, persisted: &PersistedSessionState) {
        let mut inner = self.inner.lock();
        inner.send_seq = persisted.send_seq;
        inner.recv_seq = persisted.recv_seq;
    }

    pub fn snapshot_state(&self, now: i64) -> PersistedSessionState {
        let inner = self.inner.lock();
        PersistedSessionState {
            sender: self.session_id.sender_comp_id.clone(),
            target: self.session_id.target_comp_id.clone(),
            send_seq: inner.send_seq,
            recv_seq: inner.recv_seq,
            last_update_time: now,
        }
    }

    /// Stamps `msg` with the next send seq and standard header CompIDs;
    /// the caller is responsible for persisting the raw message keyed by
    /// `(sender, target, seq)` before handing it to the Connection.
    fn next_outbound(&self, inner: &mut Inner, msg: &mut FixMessage, now: i64) -> i64 {
        let seq = inner.send_seq;
        inner.send_seq += 1;
        inner.last_send_time = now;
        msg.set_int(tags::MSG_SEQ_NUM, seq);
        msg.set(tags::SENDER_COMP_ID, self.session_id.sender_comp_id.as_str());
        msg.set(tags::TARGET_COMP_ID, self.session_id.target_comp_id.as_str());
        seq
    }

    /// `Disconnected --start()--> LogonSent`.
    pub fn start_as_initiator(&self, heart_bt_int: i64, reset_seq_num: bool, now: i64) -> FixMessage {
        let mut inner = self.inner.lock();
        if reset_seq_num {
            inner.send_seq = 1;
            inner.recv_seq = 1;
            inner.pending.clear();
        }
        let mut msg = messages::logon(
            &self.session_id.sender_comp_id,
            &self.session_id.target_comp_id,
            heart_bt_int,
            reset_seq_num,
        );
        self.next_outbound(&mut inner, &mut msg, now);
        inner.state = SessionState::LogonSent;
        msg
    }

    /// Inbound Logon. Covers both the acceptor path (`Disconnected`) and
    /// the initiator path (`LogonSent`). Returns the Logon-Ack to send
    /// back on the acceptor path only.
    pub fn on_logon_received(
        &self,
        msg: &FixMessage,
        now: i64,
    ) -> Result<Option<FixMessage>, SessionError> {
        let mut inner = self.inner.lock();
        let reset = msg.get_string_opt(tags::RESET_SEQ_NUM_FLAG) == Some("Y");
        let peer_seq = msg
            .get_int(tags::MSG_SEQ_NUM)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        let heart_bt_int = msg
            .get_int(tags::HEART_BT_INT)
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        if heart_bt_int <= 0 {
            return Err(SessionError::Protocol("non-positive HeartBtInt".to_string()));
        }

        match inner.state {
            SessionState::Disconnected => {
                if reset {
                    inner.send_seq = 1;
                    inner.recv_seq = 1;
                    inner.pending.clear();
                } else {
                    inner.recv_seq = peer_seq + 1;
                }
                inner.last_recv_time = now;
                let mut ack = messages::logon(
                    &self.session_id.sender_comp_id,
                    &self.session_id.target_comp_id,
                    heart_bt_int,
                    reset,
                );
                self.next_outbound(&mut inner, &mut ack, now);
                inner.state = SessionState::Established;
                Ok(Some(ack))
            }
            SessionState::LogonSent => {
                inner.recv_seq = peer_seq + 1;
                inner.last_recv_time = now;
                inner.state = SessionState::Established;
                Ok(None)
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected Logon while in state {other:?}"
            ))),
        }
    }

    /// Stamps an outbound business (`Application.toApp`) message with the
    /// next send seq, for callers outside the session layer (the Trade
    /// Gateway) that originate their own `FixMessage`s.
    pub fn stamp_outbound(&self, msg: &mut FixMessage, now: i64) {
        let mut inner = self.inner.lock();
        self.next_outbound(&mut inner, msg, now);
    }

    /// `Established` business-message path: delivers in order, buffers
    /// ahead-of-sequence messages, or signals shutdown on a stale seq.
    pub fn on_business_message(&self, msg: FixMessage, now: i64) -> BusinessOutcome {
        let mut inner = self.inner.lock();
        let seq = match msg.get_int(tags::MSG_SEQ_NUM) {
            Ok(s) => s,
            Err(e) => return BusinessOutcome::Shutdown(e.to_string()),
        };
        inner.last_recv_time = now;

        if seq == inner.recv_seq {
            inner.recv_seq += 1;
            let mut delivered = vec![msg];
            while let Some(next) = { let seq = inner.recv_seq; inner.pending.remove(&seq) } {
                delivered.push(next);
                inner.recv_seq += 1;
            }
            BusinessOutcome::Deliver(delivered)
        } else if seq > inner.recv_seq {
            let begin_seq = inner.recv_seq;
            inner.pending.insert(seq, msg);
            BusinessOutcome::ResendRequest(resend_request(
                &self.session_id.sender_comp_id,
                &self.session_id.target_comp_id,
                begin_seq,
                seq - 1,
            ))
        } else if msg.get_string_opt(tags::POSS_DUP_FLAG) == Some("Y") {
            // Accepted duplicate; not delivered, session stays up.
            BusinessOutcome::Deliver(Vec::new())
        } else {
            BusinessOutcome::Shutdown(format!(
                "sequence too low: expected {}, got {}",
                inner.recv_seq, seq
            ))
        }
    }

    pub fn on_heartbeat_received(&self, now: i64) {
        let mut inner = self.inner.lock();
        inner.last_recv_time = now;
        inner.outstanding_test_req_id = None;
    }

    /// `TestRequest in -> Heartbeat echoing TestReqID`.
    pub fn on_test_request_received(&self, msg: &FixMessage, now: i64) -> FixMessage {
        let mut inner = self.inner.lock();
        inner.last_recv_time = now;
        let test_req_id = msg.get_string_opt(tags::TEST_REQ_ID).unwrap_or("");
        let mut hb = messages::heartbeat(
            &self.session_id.sender_comp_id,
            &self.session_id.target_comp_id,
            Some(test_req_id),
        );
        self.next_outbound(&mut inner, &mut hb, now);
        hb
    }

    /// `Established --Logout in--> Disconnected`: sends Logout ack.
    pub fn on_logout_received(&self, now: i64) -> FixMessage {
        let mut inner = self.inner.lock();
        let mut out = messages::logout(&self.session_id.sender_comp_id, &self.session_id.target_comp_id, "");
        self.next_outbound(&mut inner, &mut out, now);
        inner.state = SessionState::Disconnected;
        out
    }

    /// `Established --initiate_logout(reason)--> LogoutSent`.
    pub fn initiate_logout(&self, reason: &str, now: i64) -> FixMessage {
        let mut inner = self.inner.lock();
        let mut out = messages::logout(&self.session_id.sender_comp_id, &self.session_id.target_comp_id, reason);
        self.next_outbound(&mut inner, &mut out, now);
        inner.state = SessionState::LogoutSent;
        out
    }

    /// `LogoutSent --Logout in | timeout--> Disconnected`.
    pub fn complete_logout(&self) {
        self.inner.lock().state = SessionState::Disconnected;
    }

    /// Timer: send-idle ≥ heartBtInt ⇒ send a Heartbeat.
    pub fn send_idle_tick(&self, heart_bt_int_secs: i64, now: i64) -> Option<FixMessage> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Established {
            return None;
        }
        if now - inner.last_send_time < heart_bt_int_secs {
            return None;
        }
        let mut hb = messages::heartbeat(&self.session_id.sender_comp_id, &self.session_id.target_comp_id, None);
        self.next_outbound(&mut inner, &mut hb, now);
        Some(hb)
    }

    /// Timer: recv-idle ≥ 1.5·heartBtInt ⇒ TestRequest, or shutdown if one
    /// is already outstanding.
    pub fn recv_idle_tick(&self, heart_bt_int_secs: i64, now: i64) -> RecvTimeoutOutcome {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Established {
            return RecvTimeoutOutcome::Ok;
        }
        let threshold = (heart_bt_int_secs * 3) / 2;
        if now - inner.last_recv_time < threshold {
            return RecvTimeoutOutcome::Ok;
        }
        if inner.outstanding_test_req_id.is_some() {
            inner.state = SessionState::Disconnected;
            return RecvTimeoutOutcome::Shutdown("peer timeout".to_string());
        }
        let test_req_id = uuid::Uuid::new_v4().to_string();
        inner.outstanding_test_req_id = Some(test_req_id.clone());
        let mut req = messages::test_request(
            &self.session_id.sender_comp_id,
            &self.session_id.target_comp_id,
            &test_req_id,
        );
        self.next_outbound(&mut inner, &mut req, now);
        RecvTimeoutOutcome::SendTestRequest(req)
    }

    pub fn clear_outstanding_test_request(&self) {
        self.inner.lock().outstanding_test_req_id = None;
    }

    pub fn force_disconnect(&self) {
        self.inner.lock().state = SessionState::Disconnected;
    }
}

fn resend_request(sender: &str, target: &str, begin_seq: i64, end_seq: i64) -> FixMessage {
    let mut msg = FixMessage::new();
    msg.set(tags::MSG_TYPE, crate::fix::tags::msg_type::RESEND_REQUEST);
    msg.set(tags::SENDER_COMP_ID, sender);
    msg.set(tags::TARGET_COMP_ID, target);
    msg.set_int(tags::BEGIN_SEQ_NO, begin_seq);
    msg.set_int(tags::END_SEQ_NO, end_seq);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logon_msg(seq: i64, heart_bt_int: i64, reset: bool) -> FixMessage {
        let mut msg = FixMessage::new();
        msg.set(tags::MSG_TYPE, crate::fix::tags::msg_type::LOGON);
        msg.set_int(tags::MSG_SEQ_NUM, seq);
        msg.set_int(tags::HEART_BT_INT, heart_bt_int);
        if reset {
            msg.set(tags::RESET_SEQ_NUM_FLAG, "Y");
        }
        msg
    }

    fn business_msg(seq: i64) -> FixMessage {
        let mut msg = FixMessage::new();
        msg.set(tags::MSG_TYPE, "D");
        msg.set_int(tags::MSG_SEQ_NUM, seq);
        msg
    }

    #[test]
    fn acceptor_logon_establishes_session() {
        let session = Session::new(SessionId::new("GATEWAY", "CLIENT1"), 0);
        let ack = session.on_logon_received(&logon_msg(1, 30, false), 0).unwrap();
        assert!(ack.is_some());
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test]
    fn reset_seq_num_flag_clears_and_resets_to_one() {
        let session = Session::new(SessionId::new("GATEWAY", "CLIENT1"), 0);
        session.restore_persisted(&PersistedSessionState {
            sender: "GATEWAY".into(),
            target: "CLIENT1".into(),
            send_seq: 20,
            recv_seq: 50,
            last_update_time: 0,
        });
        let ack = session.on_logon_received(&logon_msg(1, 30, true), 0).unwrap().unwrap();
        assert_eq!(ack.get_int(tags::MSG_SEQ_NUM).unwrap(), 1);
    }

    #[test]
    fn gap_buffers_and_requests_resend_then_drains_in_order() {
        let session = Session::new(SessionId::new("GATEWAY", "CLIENT1"), 0);
        session.on_logon_received(&logon_msg(1, 30, false), 0).unwrap();
        // expectedRecv is now 2; peer sends seq=10 first.
        match session.on_business_message(business_msg(10), 0) {
            BusinessOutcome::ResendRequest(req) => {
                assert_eq!(req.get_int(tags::BEGIN_SEQ_NO).unwrap(), 2);
                assert_eq!(req.get_int(tags::END_SEQ_NO).unwrap(), 9);
            }
            _ => panic!("expected ResendRequest"),
        }
        for seq in 2..=9 {
            match session.on_business_message(business_msg(seq), 0) {
                BusinessOutcome::Deliver(msgs) if seq < 9 => assert_eq!(msgs.len(), 1),
                BusinessOutcome::Deliver(msgs) if seq == 9 => {
                    // seq 9 fills the gap up to and including the buffered 10.
                    assert_eq!(msgs.len(), 2);
                }
                _ => panic!("expected in-order delivery at seq {seq}"),
            }
        }
    }

    #[test]
    fn stale_seq_without_poss_dup_triggers_shutdown() {
        let session = Session::new(SessionId::new("GATEWAY", "CLIENT1"), 0);
        session.on_logon_received(&logon_msg(5, 30, false), 0).unwrap();
        session.on_business_message(business_msg(6), 0);
        match session.on_business_message(business_msg(3), 0) {
            BusinessOutcome::Shutdown(_) => {}
            _ => panic!("expected shutdown"),
        }
    }

    #[test]
    fn heartbeat_clears_outstanding_test_request_so_timeout_can_recur() {
        let session = Session::new(SessionId::new("GATEWAY", "CLIENT1"), 0);
        session.on_logon_received(&logon_msg(1, 10, false), 0).unwrap();

        match session.recv_idle_tick(10, 15) {
            RecvTimeoutOutcome::SendTestRequest(_) => {}
            _ => panic!("expected a TestRequest at 1.5x heartBtInt"),
        }

        // The peer answers with a Heartbeat, which must clear the
        // outstanding marker so a later idle window doesn't immediately
        // kill the session.
        session.on_heartbeat_received(16);
        match session.recv_idle_tick(10, 31) {
            RecvTimeoutOutcome::SendTestRequest(_) => {}
            _ => panic!("expected a fresh TestRequest, not an immediate shutdown"),
        }

        // Without another Heartbeat, the next idle tick shuts down.
        match session.recv_idle_tick(10, 32) {
            RecvTimeoutOutcome::Shutdown(_) => {}
            _ => panic!("expected shutdown while a TestRequest is outstanding"),
        }
    }

    #[test]
    fn test_request_echoes_id() {
        let session = Session::new(SessionId::new("GATEWAY", "CLIENT1"), 0);
        session.on_logon_received(&logon_msg(1, 30, false), 0).unwrap();
        let mut req = FixMessage::new();
        req.set(tags::TEST_REQ_ID, "abc123");
        let hb = session.on_test_request_received(&req, 0);
        assert_eq!(hb.get_string_opt(tags::TEST_REQ_ID), Some("abc123"));
    }
}
