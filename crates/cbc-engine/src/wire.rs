//! Frames exchanged between engines.
//!
//! Every frame is a JSON object `{"version": u16, "body": {...}}`. The
//! version is checked before the body is parsed, so a peer speaking another
//! protocol revision is rejected even if its bodies happen to parse.

use crate::error::WireError;
use bytes::Bytes;
use cbc_core::clock::VectorClock;
use cbc_core::event::{MembershipEvent, Message};
use cbc_core::ids::{GroupId, PeerId};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub version: u16,
    pub body: Body,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    /// First frame an engine sends on a new connection.
    Hello { peer: PeerId, display_name: String },
    ChatEvent { message: Message },
    MembershipEvent { event: MembershipEvent },
    /// The sender's delivered clocks for both streams of `group`.
    BackfillRequest {
        group: GroupId,
        chat: VectorClock,
        membership: VectorClock,
    },
    /// Log entries the requester's clocks did not cover, in log order.
    BackfillResponse {
        group: GroupId,
        chat: Vec<Message>,
        membership: Vec<MembershipEvent>,
    },
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Hello { .. } => "hello",
            Body::ChatEvent { .. } => "chat_event",
            Body::MembershipEvent { .. } => "membership_event",
            Body::BackfillRequest { .. } => "backfill_request",
            Body::BackfillResponse { .. } => "backfill_response",
        }
    }
}

#[derive(Deserialize)]
struct Header {
    version: u16,
}

impl Frame {
    pub fn new(body: Body) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
        let header: Header = serde_json::from_slice(bytes)?;
        if header.version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: header.version,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
