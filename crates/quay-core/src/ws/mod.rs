//! WebSocket sessions and multi-socket aggregation.

pub mod aggregator;
pub mod session;

pub use aggregator::{AggregateEvent, AggregateEventReceiver, MemberStatus, MembershipTracker, MultiSocketAggregator};
pub use session::{
    DisconnectReason, Frame, OnFrameCallback, PingPayload, SessionConfig, SessionEvent, SessionEventReceiver,
    SessionEventSender, SessionHandle, SessionState, SocketSession,
};
