use std::fmt;

use anyhow::Result;
use thiserror::Error;

/// Fixed ASCII header opening every handshake frame.
pub const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";

/// A handshake frame is exactly 18 header bytes + 10 zero bytes + 4 bytes of
/// big-endian peer id.
pub const HANDSHAKE_LEN: usize = 32;

/// Decoding phase for length-prefixed messages.
///
/// The wire reuses type code 5 for both BITFIELD and PEER_COMPLETED. A
/// bitfield is only ever the first message after the handshake, so the code
/// stays unambiguous as long as the decoder knows which side of that
/// boundary it is on. This is a compatibility constraint of the protocol,
/// not a free choice: both kinds must keep code 5 to interoperate with
/// existing implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Directly after the handshake; only a BITFIELD frame is acceptable.
    Setup,
    /// The steady-state message loop; code 5 means PEER_COMPLETED.
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),           // piece index
    Bitfield(Vec<bool>), // the high bit in the first byte corresponds to piece index 0
    Request(u32),        // piece index
    Piece(u32, Vec<u8>), // piece index, whole piece payload
    PeerCompleted(u32),  // peer id
    Unknown(u8),         // unrecognized type code, payload already consumed
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Choke => {
                write!(f, "choke")
            }
            Message::Unchoke => {
                write!(f, "unchoke")
            }
            Message::Interested => {
                write!(f, "interested")
            }
            Message::NotInterested => {
                write!(f, "not interested")
            }
            Message::Have(piece_idx) => {
                write!(f, "have piece id {piece_idx}")
            }
            Message::Bitfield(bitfield) => {
                let total_have = bitfield
                    .iter()
                    .fold(0, |acc, v| if *v { acc + 1 } else { acc });
                write!(
                    f,
                    "bitfield have {total_have} total: {} (bitfield comes in bytes, number of pieces could be less)",
                    bitfield.len()
                )
            }
            Message::Request(piece_idx) => {
                write!(f, "request piece idx {piece_idx}")
            }
            Message::Piece(piece_idx, data) => {
                write!(f, "piece: piece idx: {piece_idx}, data len: {}", data.len())
            }
            Message::PeerCompleted(peer_id) => {
                write!(f, "peer {peer_id} completed")
            }
            Message::Unknown(type_code) => {
                write!(f, "unknown message type {type_code}")
            }
        }
    }
}

#[trait_variant::make(Send)]
pub trait Protocol {
    /// Sends our handshake, then receives and validates the remote one.
    /// Returns the remote peer id.
    async fn handshake(&mut self, own_peer_id: u32) -> Result<u32>;
}

#[trait_variant::make(Send)]
pub trait ProtocolReadHalf {
    async fn receive(&mut self, phase: Phase) -> Result<Message>;
}

#[trait_variant::make(Send)]
pub trait ProtocolWriteHalf {
    async fn send(&mut self, message: Message) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed handshake: {0}")]
    Handshake(String),
    #[error("broken frame: {0}")]
    Framing(String),
}
