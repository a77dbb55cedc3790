//! Multi-socket aggregation.
//!
//! Some exchanges need one socket per market, yet callers want to treat the
//! whole set as a single logical channel. [`MultiSocketAggregator`] opens N
//! [`SocketSession`]s that share one frame callback and folds their
//! connectivity into one event stream:
//!
//! - `Connected` fires once, after every member has connected.
//! - `Disconnected` fires once, on the first member drop, and every other
//!   member is force-closed so the aggregate is never left half-open.
//!
//! The folding rules live in [`MembershipTracker`], a plain state machine that
//! can be driven without any network.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::session::{
    DisconnectReason, OnFrameCallback, SessionConfig, SessionEvent, SessionHandle, SessionState,
    SocketSession,
};
use crate::error::QuayError;

/// Per-member connectivity as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Unknown,
    Connected,
    Disconnected,
}

/// Aggregate connectivity notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateEvent {
    /// Every member is connected.
    Connected,
    /// `member` dropped; the rest are being closed.
    Disconnected { member: usize, reason: DisconnectReason },
}

/// Receiver half of an aggregator's event channel.
pub type AggregateEventReceiver = mpsc::UnboundedReceiver<AggregateEvent>;

/// Folds member session events into at most one `Connected` and at most one
/// `Disconnected`.
#[derive(Debug, Clone)]
pub struct MembershipTracker {
    statuses: Vec<MemberStatus>,
    connected_fired: bool,
    disconnected_fired: bool,
}

impl MembershipTracker {
    pub fn new(members: usize) -> Self {
        Self {
            statuses: vec![MemberStatus::Unknown; members],
            connected_fired: false,
            disconnected_fired: false,
        }
    }

    /// Record a member event and return the aggregate transition it causes.
    pub fn observe(&mut self, event: &SessionEvent) -> Option<AggregateEvent> {
        let id = event.id();
        let Some(status) = self.statuses.get_mut(id) else {
            warn!("[aggregator] event for unknown member {id}");
            return None;
        };

        match event {
            SessionEvent::Connected { .. } => {
                *status = MemberStatus::Connected;
                if self.connected_fired || self.disconnected_fired {
                    return None;
                }
                if self.statuses.iter().all(|s| *s == MemberStatus::Connected) {
                    self.connected_fired = true;
                    return Some(AggregateEvent::Connected);
                }
                None
            }
            SessionEvent::Disconnected { reason, .. } => {
                *status = MemberStatus::Disconnected;
                if self.disconnected_fired {
                    return None;
                }
                self.disconnected_fired = true;
                Some(AggregateEvent::Disconnected { member: id, reason: reason.clone() })
            }
        }
    }

    pub fn status(&self, member: usize) -> Option<MemberStatus> {
        self.statuses.get(member).copied()
    }

    pub fn statuses(&self) -> &[MemberStatus] {
        &self.statuses
    }

    /// `true` between the aggregate `Connected` and `Disconnected`.
    pub fn is_connected(&self) -> bool {
        self.connected_fired && !self.disconnected_fired
    }

    /// `true` once every member has reported its disconnect.
    pub fn all_down(&self) -> bool {
        self.statuses.iter().all(|s| *s == MemberStatus::Disconnected)
    }
}

/// N sessions presented as one logical subscription.
pub struct MultiSocketAggregator {
    sessions: Vec<SocketSession>,
    tracker: Arc<Mutex<MembershipTracker>>,
    supervisor: Option<tokio::task::JoinHandle<()>>,
}

impl MultiSocketAggregator {
    /// Open one session per config. Member ids are reassigned to `0..n` in
    /// config order. Must be called from within a tokio runtime.
    pub fn open(
        configs: Vec<SessionConfig>,
        on_frame: OnFrameCallback,
    ) -> Result<(Self, AggregateEventReceiver), QuayError> {
        if configs.is_empty() {
            return Err(QuayError::Config("aggregator needs at least one endpoint".into()));
        }

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (aggregate_tx, aggregate_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Mutex::new(MembershipTracker::new(configs.len())));

        let sessions: Vec<SocketSession> = configs
            .into_iter()
            .enumerate()
            .map(|(idx, mut cfg)| {
                cfg.id = idx;
                SocketSession::connect(cfg, Arc::clone(&on_frame), session_tx.clone())
            })
            .collect();
        // Only the sessions hold senders, so the supervisor ends with them.
        drop(session_tx);

        let handles: Vec<SessionHandle> = sessions.iter().map(SocketSession::handle).collect();
        info!("[aggregator] opening {} member session(s)", handles.len());

        let supervisor = tokio::spawn(supervise(session_rx, handles, Arc::clone(&tracker), aggregate_tx));

        Ok((Self { sessions, tracker, supervisor: Some(supervisor) }, aggregate_rx))
    }

    /// Send `msg` to every member. Returns `true` only if all accepted it.
    pub async fn send_all(&self, msg: &str) -> bool {
        let mut all_ok = true;
        for session in &self.sessions {
            if !session.send(msg.to_string()).await {
                all_ok = false;
            }
        }
        all_ok
    }

    pub fn member_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn member_status(&self, member: usize) -> Option<MemberStatus> {
        self.tracker.lock().status(member)
    }

    /// Aggregator view of every member, in member order.
    pub fn member_states(&self) -> Vec<MemberStatus> {
        self.tracker.lock().statuses().to_vec()
    }

    /// Session-level state of every member, in member order.
    pub fn session_states(&self) -> Vec<SessionState> {
        self.sessions.iter().map(SocketSession::state).collect()
    }

    pub fn member(&self, member: usize) -> Option<SessionHandle> {
        self.sessions.get(member).map(SocketSession::handle)
    }

    pub fn is_connected(&self) -> bool {
        self.tracker.lock().is_connected()
    }

    /// Ask every member to close.
    pub fn close(&self) {
        for session in &self.sessions {
            session.close();
        }
    }

    /// Close every member and wait for all tasks to finish.
    pub async fn stop(&mut self) {
        for session in &mut self.sessions {
            session.stop().await;
        }
        if let Some(task) = self.supervisor.take() {
            let _ = task.await;
        }
    }
}

/// Drives the tracker from member events and tears siblings down on the
/// first disconnect.
async fn supervise(
    mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    handles: Vec<SessionHandle>,
    tracker: Arc<Mutex<MembershipTracker>>,
    out: mpsc::UnboundedSender<AggregateEvent>,
) {
    while let Some(event) = session_rx.recv().await {
        let (transition, all_down) = {
            let mut t = tracker.lock();
            let transition = t.observe(&event);
            (transition, t.all_down())
        };

        match transition {
            Some(AggregateEvent::Connected) => {
                info!("[aggregator] all {} member(s) connected", handles.len());
                let _ = out.send(AggregateEvent::Connected);
            }
            Some(AggregateEvent::Disconnected { member, reason }) => {
                warn!("[aggregator] member {member} dropped ({reason}), closing the rest");
                for handle in handles.iter().filter(|h| h.id() != member) {
                    handle.close();
                }
                let _ = out.send(AggregateEvent::Disconnected { member, reason });
            }
            None => {}
        }

        if all_down {
            break;
        }
    }
}
