use anyhow::{bail, Result};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
};

use crate::swarm_protocol::wire_protocol::{
    Message, Phase, Protocol, ProtocolReadHalf, ProtocolWriteHalf, WireError, HANDSHAKE_HEADER,
    HANDSHAKE_LEN,
};

const TYPE_CHOKE: u8 = 0;
const TYPE_UNCHOKE: u8 = 1;
const TYPE_INTERESTED: u8 = 2;
const TYPE_NOT_INTERESTED: u8 = 3;
const TYPE_HAVE: u8 = 4;
const TYPE_BITFIELD: u8 = 5;
const TYPE_REQUEST: u8 = 6;
const TYPE_PIECE: u8 = 7;
// PEER_COMPLETED shares code 5 with BITFIELD, disambiguated by Phase.
const TYPE_PEER_COMPLETED: u8 = 5;

pub fn encode_handshake(peer_id: u32) -> [u8; HANDSHAKE_LEN] {
    let mut buf: [u8; HANDSHAKE_LEN] = [0; HANDSHAKE_LEN];
    buf[0..18].copy_from_slice(HANDSHAKE_HEADER);
    // bytes 18..28 stay zero
    buf[28..32].copy_from_slice(&peer_id.to_be_bytes());
    buf
}

pub fn parse_handshake(buf: &[u8]) -> Result<u32> {
    if buf.len() != HANDSHAKE_LEN {
        bail!(WireError::Handshake(format!(
            "expected {HANDSHAKE_LEN} bytes, got {}",
            buf.len()
        )));
    }
    if &buf[0..18] != HANDSHAKE_HEADER {
        bail!(WireError::Handshake(
            "header bytes do not match".to_string()
        ));
    }
    let peer_id = u32::from_be_bytes(buf[28..32].try_into().expect("length checked above"));
    Ok(peer_id)
}

/// Encodes a message as 4-byte big-endian length (type byte + payload),
/// 1 type byte, payload.
pub fn encode_message(message: &Message) -> Vec<u8> {
    match message {
        Message::Choke => frame(TYPE_CHOKE, &[]),
        Message::Unchoke => frame(TYPE_UNCHOKE, &[]),
        Message::Interested => frame(TYPE_INTERESTED, &[]),
        Message::NotInterested => frame(TYPE_NOT_INTERESTED, &[]),
        Message::Have(piece_idx) => frame(TYPE_HAVE, &piece_idx.to_be_bytes()),
        Message::Bitfield(bitfield) => frame(TYPE_BITFIELD, &pack_bits(bitfield)),
        Message::Request(piece_idx) => frame(TYPE_REQUEST, &piece_idx.to_be_bytes()),
        Message::Piece(piece_idx, data) => {
            let mut payload = Vec::with_capacity(4 + data.len());
            payload.extend_from_slice(&piece_idx.to_be_bytes());
            payload.extend_from_slice(data);
            frame(TYPE_PIECE, &payload)
        }
        Message::PeerCompleted(peer_id) => frame(TYPE_PEER_COMPLETED, &peer_id.to_be_bytes()),
        // never produced by this implementation, kept total for symmetry
        Message::Unknown(type_code) => frame(*type_code, &[]),
    }
}

fn frame(type_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    buf.push(type_code);
    buf.extend_from_slice(payload);
    buf
}

/// Decodes the body of a length-prefixed frame once length and type have
/// been read off the stream and the payload fully buffered.
pub fn decode_payload(type_code: u8, payload: Vec<u8>, phase: Phase) -> Result<Message> {
    if phase == Phase::Setup {
        return match type_code {
            TYPE_BITFIELD => Ok(Message::Bitfield(unpack_bits(&payload))),
            other => bail!(WireError::Framing(format!(
                "first message after handshake must be a bitfield, got type {other}"
            ))),
        };
    }
    match type_code {
        TYPE_CHOKE => Ok(Message::Choke),
        TYPE_UNCHOKE => Ok(Message::Unchoke),
        TYPE_INTERESTED => Ok(Message::Interested),
        TYPE_NOT_INTERESTED => Ok(Message::NotInterested),
        TYPE_HAVE => Ok(Message::Have(be_u32(&payload, "have")?)),
        TYPE_PEER_COMPLETED => Ok(Message::PeerCompleted(be_u32(&payload, "peer completed")?)),
        TYPE_REQUEST => Ok(Message::Request(be_u32(&payload, "request")?)),
        TYPE_PIECE => {
            if payload.len() < 4 {
                bail!(WireError::Framing(format!(
                    "piece payload too short: {} bytes",
                    payload.len()
                )));
            }
            let piece_idx = u32::from_be_bytes(payload[0..4].try_into().expect("checked above"));
            Ok(Message::Piece(piece_idx, payload[4..].to_vec()))
        }
        other => Ok(Message::Unknown(other)),
    }
}

fn be_u32(payload: &[u8], what: &str) -> Result<u32> {
    if payload.len() != 4 {
        bail!(WireError::Framing(format!(
            "{what} payload must be 4 bytes, got {}",
            payload.len()
        )));
    }
    Ok(u32::from_be_bytes(payload.try_into().expect(
        "length checked above",
    )))
}

/// Packs booleans into bytes, the high bit of the first byte being index 0.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let total_bytes = bits.len().div_ceil(8);
    let mut buf = vec![0u8; total_bytes];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            buf[i / 8] |= 0b10000000 >> (i % 8);
        }
    }
    buf
}

/// Inverse of [`pack_bits`]; yields `bytes.len() * 8` booleans, trailing
/// padding bits included.
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = vec![false; bytes.len() * 8];
    for i in 0..bits.len() {
        bits[i] = bytes[i / 8] & (0b10000000 >> (i % 8)) != 0;
    }
    bits
}

impl Protocol for TcpStream {
    async fn handshake(&mut self, own_peer_id: u32) -> Result<u32> {
        self.write_all(&encode_handshake(own_peer_id)).await?;
        let mut buf: [u8; HANDSHAKE_LEN] = [0; HANDSHAKE_LEN];
        self.read_exact(&mut buf).await?;
        parse_handshake(&buf)
    }
}

impl ProtocolReadHalf for ReadHalf<TcpStream> {
    async fn receive(&mut self, phase: Phase) -> Result<Message> {
        let mut size_buf: [u8; 4] = [0; 4];
        self.read_exact(&mut size_buf).await?;
        let size = u32::from_be_bytes(size_buf);
        if size == 0 {
            bail!(WireError::Framing(
                "zero-length frame, no type byte".to_string()
            ));
        }

        let mut type_buf: [u8; 1] = [0; 1];
        self.read_exact(&mut type_buf).await?;

        let mut payload = vec![0; (size - 1) as usize];
        self.read_exact(&mut payload).await?;

        decode_payload(type_buf[0], payload, phase)
    }
}

impl ProtocolWriteHalf for WriteHalf<TcpStream> {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.write_all(&encode_message(&message)).await?;
        Ok(())
    }
}
