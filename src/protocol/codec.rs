//! Big-endian wire codec.
//!
//! Layout: `from_id` (20 bytes), `to_id` (20 bytes), code (1 byte), body.
//! A RemoteNode is its id followed by a 1-byte length-prefixed ASCII
//! `host:port` address; a swarm is a 2-byte count of RemoteNodes; a content
//! value is a 4-byte length plus raw bytes, where length 0 means "not
//! available here".
//!
//! An empty address on the wire names the datagram's sender: pools do not
//! know their external address, so a virtual node naming itself (or a pool
//! naming a hosted node) sends the empty address and the receiver fills in
//! the datagram source.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::core::identifier::{RemoteNode, SwarmId, ID_BYTES};

use super::{Envelope, MessageKind, RpcPayload};

const HEADER_LEN: usize = 2 * ID_BYTES + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram shorter than its declared contents")]
    Truncated,
    #[error("unknown message code {0}")]
    UnknownCode(u8),
    #[error("address is not valid UTF-8")]
    BadAddress,
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
}

/// Serialize one message into a datagram of at most `max_len` bytes.
///
/// A swarm that would overflow is truncated deterministically: members are
/// sorted by address and the lowest-address prefix that fits is kept. A
/// content value that would overflow is replaced by the empty value,
/// signalling "not available here".
pub fn encode(env: &Envelope, max_len: usize) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
    buf.put_slice(env.from_id.0.as_bytes());
    buf.put_slice(env.to_id.0.as_bytes());
    buf.put_u8(env.payload.kind().code());

    match &env.payload {
        RpcPayload::PingRequest
        | RpcPayload::PingResponse
        | RpcPayload::GetSwarmRequest
        | RpcPayload::GetContentRequest => {}
        RpcPayload::GetNodeRequest { query_id } => {
            buf.put_slice(query_id.0.as_bytes());
        }
        RpcPayload::GetNodeResponse { node } => {
            put_remote_node(&mut buf, node);
        }
        RpcPayload::GetSwarmResponse { swarm } => {
            let mut members: Vec<&RemoteNode> = swarm.iter().collect();
            members.sort_by(|a, b| a.address.cmp(&b.address));
            let mut budget = max_len.saturating_sub(HEADER_LEN + 2);
            let mut kept: Vec<&RemoteNode> = Vec::with_capacity(members.len());
            for member in members {
                let size = remote_node_len(member);
                if size > budget || kept.len() == u16::MAX as usize {
                    break;
                }
                budget -= size;
                kept.push(member);
            }
            buf.put_u16(kept.len() as u16);
            for member in kept {
                put_remote_node(&mut buf, member);
            }
        }
        RpcPayload::GetContentResponse { value } => {
            if HEADER_LEN + 4 + value.len() > max_len {
                buf.put_u32(0);
            } else {
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
        }
    }
    buf.to_vec()
}

/// Parse one datagram. `src_address` is the sender's observed `host:port`,
/// substituted for any empty address in the body.
pub fn decode(data: &[u8], src_address: &str) -> Result<Envelope, DecodeError> {
    let mut buf = data;
    let from_id = get_id(&mut buf)?;
    let to_id = get_id(&mut buf)?;
    if buf.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    let code = buf.get_u8();
    let kind = MessageKind::from_code(code).ok_or(DecodeError::UnknownCode(code))?;

    let payload = match kind {
        MessageKind::PingRequest => RpcPayload::PingRequest,
        MessageKind::PingResponse => RpcPayload::PingResponse,
        MessageKind::GetNodeRequest => RpcPayload::GetNodeRequest {
            query_id: get_id(&mut buf)?,
        },
        MessageKind::GetNodeResponse => RpcPayload::GetNodeResponse {
            node: get_remote_node(&mut buf, src_address)?,
        },
        MessageKind::GetSwarmRequest => RpcPayload::GetSwarmRequest,
        MessageKind::GetSwarmResponse => {
            if buf.remaining() < 2 {
                return Err(DecodeError::Truncated);
            }
            let count = buf.get_u16() as usize;
            let mut swarm = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                swarm.push(get_remote_node(&mut buf, src_address)?);
            }
            RpcPayload::GetSwarmResponse { swarm }
        }
        MessageKind::GetContentRequest => RpcPayload::GetContentRequest,
        MessageKind::GetContentResponse => {
            if buf.remaining() < 4 {
                return Err(DecodeError::Truncated);
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(DecodeError::Truncated);
            }
            let mut value = vec![0u8; len];
            buf.copy_to_slice(&mut value);
            RpcPayload::GetContentResponse { value }
        }
    };

    if buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(buf.remaining()));
    }
    Ok(Envelope::new(from_id, to_id, payload))
}

fn get_id(buf: &mut &[u8]) -> Result<SwarmId, DecodeError> {
    if buf.remaining() < ID_BYTES {
        return Err(DecodeError::Truncated);
    }
    let mut raw = [0u8; ID_BYTES];
    buf.copy_to_slice(&mut raw);
    Ok(SwarmId::from_bytes(&raw))
}

fn get_remote_node(buf: &mut &[u8], src_address: &str) -> Result<RemoteNode, DecodeError> {
    let id = get_id(buf)?;
    if buf.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    let address = String::from_utf8(raw).map_err(|_| DecodeError::BadAddress)?;
    let address = if address.is_empty() {
        src_address.to_string()
    } else {
        address
    };
    Ok(RemoteNode::new(id, address))
}

fn put_remote_node(buf: &mut BytesMut, node: &RemoteNode) {
    let addr = node.address.as_bytes();
    debug_assert!(addr.len() <= u8::MAX as usize, "address too long for wire");
    buf.put_slice(node.id.0.as_bytes());
    buf.put_u8(addr.len() as u8);
    buf.put_slice(addr);
}

fn remote_node_len(node: &RemoteNode) -> usize {
    ID_BYTES + 1 + node.address.len()
}
