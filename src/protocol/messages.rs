//! WireGuard message wire formats
//!
//! Every message starts with a 4-byte little-endian type tag:
//! - Type 1: Handshake Initiation (148 bytes)
//! - Type 2: Handshake Response (92 bytes)
//! - Type 3: Cookie Reply (64 bytes)
//! - Type 4: Transport Data (16-byte header + ciphertext + 16-byte tag)

use crate::error::HandshakeError;

/// WireGuard message types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    TransportData = 4,
}

impl TryFrom<u32> for MessageType {
    type Error = HandshakeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeInitiation),
            2 => Ok(Self::HandshakeResponse),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::TransportData),
            _ => Err(HandshakeError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Length of the MAC1 and MAC2 fields that close handshake messages
pub const MAC_LEN: usize = 16;

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

fn check_exact(data: &[u8], expected: usize, msg_type: MessageType) -> Result<(), HandshakeError> {
    if data.len() != expected {
        return Err(HandshakeError::InvalidMessageLength {
            expected,
            got: data.len(),
        });
    }
    let tag = read_u32(data, 0);
    if tag != msg_type as u32 {
        return Err(HandshakeError::InvalidMessageType { msg_type: tag });
    }
    Ok(())
}

/// Handshake Initiation message (148 bytes)
///
/// ```text
/// type(4) | sender_index(4) | ephemeral_public(32) |
/// encrypted_static(48) | encrypted_timestamp(28) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeInitiation {
    pub sender_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; MAC_LEN],
    pub mac2: [u8; MAC_LEN],
}

impl HandshakeInitiation {
    pub const SIZE: usize = 148;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(MessageType::HandshakeInitiation as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        check_exact(data, Self::SIZE, MessageType::HandshakeInitiation)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            ephemeral_public: read_array(data, 8),
            encrypted_static: read_array(data, 40),
            encrypted_timestamp: read_array(data, 88),
            mac1: read_array(data, 116),
            mac2: read_array(data, 132),
        })
    }
}

/// Handshake Response message (92 bytes)
///
/// ```text
/// type(4) | sender_index(4) | receiver_index(4) |
/// ephemeral_public(32) | encrypted_nothing(16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral_public: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; MAC_LEN],
    pub mac2: [u8; MAC_LEN],
}

impl HandshakeResponse {
    pub const SIZE: usize = 92;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(MessageType::HandshakeResponse as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        check_exact(data, Self::SIZE, MessageType::HandshakeResponse)?;
        Ok(Self {
            sender_index: read_u32(data, 4),
            receiver_index: read_u32(data, 8),
            ephemeral_public: read_array(data, 12),
            encrypted_nothing: read_array(data, 44),
            mac1: read_array(data, 60),
            mac2: read_array(data, 76),
        })
    }
}

/// Cookie Reply message (64 bytes)
///
/// ```text
/// type(4) | receiver_index(4) | nonce(24) | encrypted_cookie(32)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(MessageType::CookieReply as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        check_exact(data, Self::SIZE, MessageType::CookieReply)?;
        Ok(Self {
            receiver_index: read_u32(data, 4),
            nonce: read_array(data, 8),
            encrypted_cookie: read_array(data, 32),
        })
    }
}

/// Transport Data header (16 bytes, followed by ciphertext and tag)
///
/// ```text
/// type(4) | receiver_index(4) | counter(8) | encrypted_packet(n+16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;

    /// Header plus an empty (keepalive) payload's tag
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    pub fn build_message(receiver_index: u32, counter: u64, encrypted_payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + encrypted_payload.len());
        buf.extend_from_slice(&(MessageType::TransportData as u32).to_le_bytes());
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(encrypted_payload);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < Self::MIN_SIZE {
            return Err(HandshakeError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }
        let tag = read_u32(data, 0);
        if tag != MessageType::TransportData as u32 {
            return Err(HandshakeError::InvalidMessageType { msg_type: tag });
        }
        Ok(Self {
            receiver_index: read_u32(data, 4),
            counter: read_u64(data, 8),
        })
    }

    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

/// Get the message type from a datagram
pub fn get_message_type(data: &[u8]) -> Result<MessageType, HandshakeError> {
    if data.len() < 4 {
        return Err(HandshakeError::InvalidMessageLength {
            expected: 4,
            got: data.len(),
        });
    }
    MessageType::try_from(read_u32(data, 0))
}

/// Split a handshake message into (bytes covered by mac1, mac1, bytes covered by mac2, mac2)
pub fn mac_regions(msg: &[u8]) -> Option<(&[u8], &[u8], &[u8], &[u8])> {
    let len = msg.len();
    if len < 4 + 2 * MAC_LEN {
        return None;
    }
    let mac1_off = len - 2 * MAC_LEN;
    let mac2_off = len - MAC_LEN;
    Some((
        &msg[..mac1_off],
        &msg[mac1_off..mac2_off],
        &msg[..mac2_off],
        &msg[mac2_off..],
    ))
}

/// The sender index of an initiation or response, which a cookie reply is addressed to
pub fn handshake_sender_index(msg: &[u8]) -> Option<u32> {
    if msg.len() < 8 {
        return None;
    }
    Some(read_u32(msg, 4))
}
