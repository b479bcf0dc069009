//! Data models for WaveCall

use serde::{Deserialize, Serialize};

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Voice,
    Video,
}

impl CallMode {
    pub fn has_video(self) -> bool {
        matches!(self, CallMode::Video)
    }
}

/// Where the local user's call currently stands. Idle is both the initial
/// state and the reset state after every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Answered,
    Ended,
    Missed,
    Rejected,
    Failed,
}

impl CallStatus {
    /// A record transitions into a terminal status exactly once.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Missed | CallStatus::Rejected | CallStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    Rejected,
    Busy,
    Timeout,
    ConnectionFailed,
}

/// Durable record of a call's lifecycle and outcome, independent of the
/// live in-memory session. Queryable by caller/receiver for history views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub mode: CallMode,
    pub status: CallStatus,
    pub started_at: i64,
    pub answered_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration_seconds: Option<i64>,
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    CallEnd,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
        mode: CallMode,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    CallEnd {
        reason: EndReason,
        duration_seconds: Option<i64>,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::IceCandidate { .. } => SignalKind::IceCandidate,
            SignalPayload::CallEnd { .. } => SignalKind::CallEnd,
        }
    }
}

/// Append-only signaling message carried between peers by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub signal_id: String,
    pub call_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub payload: SignalPayload,
    pub processed: bool,
    pub created_at: i64,
}

// ============================================================================
// Users
// ============================================================================

/// Lightweight profile of the other party, fetched once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_file_id: Option<String>,
}

impl RemoteProfile {
    pub fn bare(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            avatar_file_id: None,
        }
    }
}

// ============================================================================
// Session snapshot
// ============================================================================

/// Point-in-time view of the local user's call, handed to UI consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub call_id: Option<String>,
    pub mode: Option<CallMode>,
    pub local_user_id: String,
    pub remote_user_id: Option<String>,
    pub remote_profile: Option<RemoteProfile>,
    pub started_at: Option<i64>,
    pub duration_seconds: i64,
    pub muted: bool,
    pub video_disabled: bool,
    pub speaker_on: bool,
    pub last_error: Option<String>,
}
