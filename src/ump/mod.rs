//! Universal MIDI Packet handling
//!
//! This module provides the packet type shared by both forwarding directions:
//! - [`UmpPacket`], a fixed four-word buffer whose length comes from its message type
//! - [`packet_words`], the message type to packet length table
//! - [`Transcoder`], conversion between local port bytes and UMP packets
//!
mod transcode;

pub use transcode::{LocalFormat, ToLocal, Transcoder};

/// Packet length in 32-bit words for each message type.
const PACKET_WORDS: [usize; 16] = [1, 1, 1, 2, 2, 4, 1, 1, 2, 2, 2, 3, 3, 4, 4, 4];

/// Largest packet size in words.
pub const MAX_PACKET_WORDS: usize = 4;

/// Returns the packet length in words for a message type.
///
/// Only the low 4 bits of `message_type` are looked at, so every input has an answer.
pub const fn packet_words(message_type: u8) -> usize {
    PACKET_WORDS[(message_type & 0x0F) as usize]
}

/// Message type of a packet, taken from the top nibble of its first word.
pub const fn message_type_of(word: u32) -> u8 {
    (word >> 28) as u8
}

/// UMP message types the bridge distinguishes.
pub mod message_type {
    pub const SYSTEM: u8 = 0x1;
    pub const MIDI1_CHANNEL_VOICE: u8 = 0x2;
    pub const DATA_64: u8 = 0x3;
    pub const MIDI2_CHANNEL_VOICE: u8 = 0x4;
}

/// A single Universal MIDI Packet of one to four words
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UmpPacket {
    words: [u32; MAX_PACKET_WORDS],
}

impl UmpPacket {
    /// Builds a packet from the start of `words`.
    ///
    /// Returns `None` when `words` is shorter than the length its message type requires.
    /// Words past that length are ignored.
    pub fn from_words(words: &[u32]) -> Option<Self> {
        let first = *words.first()?;
        let len = packet_words(message_type_of(first));
        if words.len() < len {
            return None;
        }

        let mut packet = [0u32; MAX_PACKET_WORDS];
        packet[..len].copy_from_slice(&words[..len]);
        Some(Self { words: packet })
    }

    /// Single-word packet.
    pub fn single(word: u32) -> Option<Self> {
        Self::from_words(&[word])
    }

    pub fn message_type(&self) -> u8 {
        message_type_of(self.words[0])
    }

    pub fn group(&self) -> u8 {
        ((self.words[0] >> 24) & 0x0F) as u8
    }

    /// Length in words.
    pub fn len(&self) -> usize {
        packet_words(self.message_type())
    }

    /// Always false: a packet holds at least one word.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn words(&self) -> &[u32] {
        &self.words[..self.len()]
    }

    /// Endpoint discovery and stream configuration messages.
    ///
    /// These belong to the network session and are never handed to the local port.
    pub fn is_endpoint_message(&self) -> bool {
        self.words[0] & 0xFFFF_0000 == 0xF000_0000
    }

    /// Packet words as little-endian bytes, `4 * len()` of them.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words().iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
