//! Frame types for the Callway protocol.
//!
//! Every frame is a tagged map: the `type` field carries the event name and
//! the remaining fields are the event body. Client frames name a destination
//! user with `to`; the server never trusts a client-supplied sender and adds
//! `from` itself when it forwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of media a call carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Audio => f.write_str("audio"),
            CallType::Video => f.write_str("video"),
        }
    }
}

/// Why a call ended for the peer receiving `call-ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    /// The other participant hung up.
    Hangup,
    /// The other participant's connection went away.
    Disconnected,
}

impl EndReason {
    /// Label used for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Disconnected => "disconnected",
        }
    }
}

/// A STUN/TURN server advertised to clients for building peer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// One or more `stun:`/`turn:` URLs.
    pub urls: Vec<String>,
    /// TURN username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less server with a single URL.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Start a call with `to`.
    #[serde(rename_all = "camelCase")]
    CallUser {
        to: String,
        call_type: CallType,
        /// Display data shown on the callee's incoming-call screen.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_info: Option<Value>,
    },

    /// Accept the ringing call from `to`.
    AcceptCall { to: String },

    /// Decline the ringing call from `to`.
    RejectCall { to: String },

    /// Hang up the call with `to`.
    EndCall { to: String },

    /// Session description offer for `to`.
    Offer { to: String, offer: Value },

    /// Session description answer for `to`.
    Answer { to: String, answer: Value },

    /// Trickled ICE candidate for `to`.
    IceCandidate { to: String, candidate: Value },

    /// Application-level keepalive.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientFrame {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientFrame::CallUser { .. } => "call-user",
            ClientFrame::AcceptCall { .. } => "accept-call",
            ClientFrame::RejectCall { .. } => "reject-call",
            ClientFrame::EndCall { .. } => "end-call",
            ClientFrame::Offer { .. } => "offer",
            ClientFrame::Answer { .. } => "answer",
            ClientFrame::IceCandidate { .. } => "ice-candidate",
            ClientFrame::Ping { .. } => "ping",
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Connection accepted.
    #[serde(rename_all = "camelCase")]
    Connected {
        user_id: String,
        /// Protocol version, `major.minor`.
        version: String,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
        ice_servers: Vec<IceServer>,
    },

    /// Full set of online users.
    OnlineUsers { users: Vec<String> },

    /// Someone is calling.
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        from: String,
        call_type: CallType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_info: Option<Value>,
    },

    /// The callee accepted.
    CallAccepted { from: String },

    /// The callee declined.
    CallRejected { from: String },

    /// The peer left the call.
    CallEnded { from: String, reason: EndReason },

    /// Nobody answered in time.
    CallTimeout { peer: String },

    /// The callee is not connected.
    CallUnavailable { to: String },

    /// The callee is already in a call.
    CallBusy { to: String },

    /// Forwarded session description offer.
    Offer { from: String, offer: Value },

    /// Forwarded session description answer.
    Answer { from: String, answer: Value },

    /// Forwarded ICE candidate.
    IceCandidate { from: String, candidate: Value },

    /// Reply to a client ping.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Non-fatal error report.
    Error { code: u16, message: String },
}

impl ServerFrame {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::OnlineUsers { .. } => "online-users",
            ServerFrame::IncomingCall { .. } => "incoming-call",
            ServerFrame::CallAccepted { .. } => "call-accepted",
            ServerFrame::CallRejected { .. } => "call-rejected",
            ServerFrame::CallEnded { .. } => "call-ended",
            ServerFrame::CallTimeout { .. } => "call-timeout",
            ServerFrame::CallUnavailable { .. } => "call-unavailable",
            ServerFrame::CallBusy { .. } => "call-busy",
            ServerFrame::Offer { .. } => "offer",
            ServerFrame::Answer { .. } => "answer",
            ServerFrame::IceCandidate { .. } => "ice-candidate",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerFrame::Pong { timestamp }
    }
}

/// Error codes carried by [`ServerFrame::Error`].
pub mod error_codes {
    /// The frame could not be decoded.
    pub const MALFORMED_FRAME: u16 = 4000;
    /// The sender is already a participant of another call.
    pub const ALREADY_IN_CALL: u16 = 4009;
    /// The caller named themselves as callee.
    pub const SELF_CALL: u16 = 4010;
    /// A newer connection for the same user took over; this one closes.
    pub const SESSION_REPLACED: u16 = 4011;
}
