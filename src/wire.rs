//! Wire shapes for the session protocol: the tagged session-message union and
//! the envelope codec.
//!
//! Messages are serialized with serde into a self-describing tagged form. The
//! codec is symmetric: for every message `m`,
//! `decode_envelope(&encode_envelope(&m)?)? == m`.
//!
//! Nothing here performs I/O; transport hand-off lives in
//! [`crate::transport`].

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::flows::BusinessError;
use crate::types::{NodeId, SessionId};

/// A message exchanged between two flow sessions.
///
/// Every variant carries the session-id the recipient should route on:
/// `SessionInit`/`SessionReject` address the initiator half (the only half
/// that exists before confirmation), everything else the recipient's own id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum SessionMessage {
    /// Opens a session: names the initiating flow class and the protocol
    /// version the initiator speaks. May piggyback the first payload so a
    /// `sendAndReceive` opener costs one message.
    SessionInit {
        initiator_session_id: SessionId,
        flow_class: String,
        flow_version: u32,
        app_id: String,
        first_payload: Option<Value>,
    },
    /// Accepts a session, pairing the confirmer's id with the initiator's and
    /// pinning the version the confirmer actually speaks (possibly lower than
    /// requested).
    SessionConfirm {
        initiator_session_id: SessionId,
        confirmer_session_id: SessionId,
        flow_version: u32,
        app_id: String,
    },
    /// Application payload. `sequence` is per-session, sender-assigned, and
    /// strictly increasing; receivers drop anything at or below the last
    /// delivered sequence.
    SessionData {
        recipient_session_id: SessionId,
        sequence: u64,
        payload: Value,
    },
    /// The sender has finished; no further messages will arrive from it.
    NormalSessionEnd { recipient_session_id: SessionId },
    /// The sender failed. Carries a serialized business exception when the
    /// failure was declared wire-safe, nothing otherwise.
    ErrorSessionEnd {
        recipient_session_id: SessionId,
        error: Option<BusinessError>,
    },
    /// The recipient refused to open the session (unknown flow class,
    /// non-initiating class, ...). Human-readable reason only.
    SessionReject {
        initiator_session_id: SessionId,
        error_message: String,
    },
}

impl SessionMessage {
    /// The session-id a receiving node routes this message on.
    #[must_use]
    pub fn routing_id(&self) -> SessionId {
        match self {
            Self::SessionInit {
                initiator_session_id,
                ..
            }
            | Self::SessionReject {
                initiator_session_id,
                ..
            }
            | Self::SessionConfirm {
                initiator_session_id,
                ..
            } => *initiator_session_id,
            Self::SessionData {
                recipient_session_id,
                ..
            }
            | Self::NormalSessionEnd {
                recipient_session_id,
            }
            | Self::ErrorSessionEnd {
                recipient_session_id,
                ..
            } => *recipient_session_id,
        }
    }

    /// Short tag for logging.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::SessionConfirm { .. } => "session_confirm",
            Self::SessionData { .. } => "session_data",
            Self::NormalSessionEnd { .. } => "normal_session_end",
            Self::ErrorSessionEnd { .. } => "error_session_end",
            Self::SessionReject { .. } => "session_reject",
        }
    }
}

/// A session message addressed to a concrete endpoint.
///
/// `dedup_id` is sender-assigned and stable across restarts: it is derived
/// from checkpointed state (sender session id, message tag, sequence), so a
/// resurrected flow re-publishes byte-identical envelopes and receivers can
/// discard duplicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: NodeId,
    pub destination: NodeId,
    pub dedup_id: String,
    pub message: SessionMessage,
}

impl Envelope {
    /// Build an envelope, deriving the stable dedup id from the sender's
    /// session id and the message itself.
    #[must_use]
    pub fn new(
        origin: NodeId,
        destination: NodeId,
        sender_session: SessionId,
        message: SessionMessage,
    ) -> Self {
        let dedup_id = match &message {
            SessionMessage::SessionData { sequence, .. } => {
                format!("{sender_session}:data:{sequence}")
            }
            SessionMessage::SessionInit { first_payload, .. } => {
                // The piggybacked payload is sequence 1 of the session.
                let suffix = if first_payload.is_some() { ":1" } else { "" };
                format!("{sender_session}:init{suffix}")
            }
            other => format!("{sender_session}:{}", other.tag()),
        };
        Self {
            origin,
            destination,
            dedup_id,
            message,
        }
    }
}

/// Errors from envelope encoding/decoding.
#[derive(Debug, Error, Diagnostic)]
pub enum WireError {
    #[error("envelope could not be encoded: {source}")]
    #[diagnostic(code(ledgerflow::wire::encode))]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("envelope could not be decoded: {source}")]
    #[diagnostic(
        code(ledgerflow::wire::decode),
        help("The bytes did not parse as a session envelope; check the sender's codec version.")
    )]
    Decode {
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize an envelope for the transport.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(envelope).map_err(|source| WireError::Encode { source })
}

/// Parse an envelope received from the transport.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    serde_json::from_slice(bytes).map_err(|source| WireError::Decode { source })
}
