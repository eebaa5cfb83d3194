//! The eight RPC datagram types and their wire form.
//!
//! Messages are paired as four request/response calls. Every datagram
//! carries the header `(from_id, to_id, code)`; a response's code is its
//! request's code plus one. The transport correlates responses with
//! outstanding requests by that header tuple, so the payload types here
//! carry no explicit sequence numbers.

pub mod codec;

use crate::core::identifier::{RemoteNode, SwarmId};

pub use codec::{decode, encode, DecodeError};

/// Wire code of a datagram, one byte 0..=7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    PingRequest = 0,
    PingResponse = 1,
    GetNodeRequest = 2,
    GetNodeResponse = 3,
    GetSwarmRequest = 4,
    GetSwarmResponse = 5,
    GetContentRequest = 6,
    GetContentResponse = 7,
}

impl MessageKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::PingRequest),
            1 => Some(Self::PingResponse),
            2 => Some(Self::GetNodeRequest),
            3 => Some(Self::GetNodeResponse),
            4 => Some(Self::GetSwarmRequest),
            5 => Some(Self::GetSwarmResponse),
            6 => Some(Self::GetContentRequest),
            7 => Some(Self::GetContentResponse),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Responses carry odd codes.
    pub fn is_response(self) -> bool {
        self.code() % 2 == 1
    }

    /// The response kind paired with a request kind.
    pub fn response(self) -> MessageKind {
        debug_assert!(!self.is_response());
        Self::from_code(self.code() + 1).expect("request codes pair with a response")
    }
}

/// The closed sum of RPC message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcPayload {
    PingRequest,
    PingResponse,
    GetNodeRequest { query_id: SwarmId },
    GetNodeResponse { node: RemoteNode },
    GetSwarmRequest,
    GetSwarmResponse { swarm: Vec<RemoteNode> },
    GetContentRequest,
    /// An empty value means "not available here".
    GetContentResponse { value: Vec<u8> },
}

impl RpcPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            RpcPayload::PingRequest => MessageKind::PingRequest,
            RpcPayload::PingResponse => MessageKind::PingResponse,
            RpcPayload::GetNodeRequest { .. } => MessageKind::GetNodeRequest,
            RpcPayload::GetNodeResponse { .. } => MessageKind::GetNodeResponse,
            RpcPayload::GetSwarmRequest => MessageKind::GetSwarmRequest,
            RpcPayload::GetSwarmResponse { .. } => MessageKind::GetSwarmResponse,
            RpcPayload::GetContentRequest => MessageKind::GetContentRequest,
            RpcPayload::GetContentResponse { .. } => MessageKind::GetContentResponse,
        }
    }
}

/// One datagram: addressing header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from_id: SwarmId,
    pub to_id: SwarmId,
    pub payload: RpcPayload,
}

impl Envelope {
    pub fn new(from_id: SwarmId, to_id: SwarmId, payload: RpcPayload) -> Self {
        Self {
            from_id,
            to_id,
            payload,
        }
    }

    /// The matching response envelope, addressed back at the requester.
    pub fn reply(&self, payload: RpcPayload) -> Envelope {
        debug_assert!(payload.kind() == self.payload.kind().response());
        Envelope::new(self.to_id, self.from_id, payload)
    }
}
