//! Network MIDI 2.0 UDP datagram layout
//!
//! A datagram is the "MIDI" signature followed by command packets. Each command packet is a
//! one-word header (code, payload length in words, two command-specific bytes) and its payload.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub const SIGNATURE: u32 = 0x4D49_4449;

/// Longest endpoint name an invitation carries, in bytes
pub const MAX_ENDPOINT_NAME: usize = 98;
/// Longest product instance id an invitation carries, in bytes
pub const MAX_PRODUCT_INSTANCE_ID: usize = 42;

pub mod code {
    pub const INVITATION: u8 = 0x01;
    pub const INVITATION_ACCEPTED: u8 = 0x10;
    pub const INVITATION_PENDING: u8 = 0x11;
    pub const INVITATION_AUTH_REQUIRED: u8 = 0x12;
    pub const INVITATION_USER_AUTH_REQUIRED: u8 = 0x13;
    pub const PING: u8 = 0x20;
    pub const PING_REPLY: u8 = 0x21;
    pub const SESSION_RESET: u8 = 0x82;
    pub const SESSION_RESET_REPLY: u8 = 0x83;
    pub const BYE: u8 = 0xF0;
    pub const BYE_REPLY: u8 = 0xF1;
    pub const UMP_DATA: u8 = 0xFF;
}

pub mod bye_reason {
    pub const USER_TERMINATED: u8 = 0x01;
    pub const TIMEOUT: u8 = 0x04;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram does not start with the MIDI signature")]
    BadSignature,
    #[error("command packet {code:#04x} truncated")]
    Truncated { code: u8 },
}

/// Endpoint identity carried by invitations and their replies
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub endpoint_name: String,
    pub product_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Invitation { identity: Identity, capabilities: u8 },
    InvitationAccepted(Identity),
    InvitationPending(Identity),
    Ping { id: u32 },
    PingReply { id: u32 },
    SessionReset,
    SessionResetReply,
    Bye { reason: u8 },
    ByeReply,
    UmpData { sequence: u16, words: Vec<u32> },
    /// Anything this session does not act on
    Other { code: u8 },
}

fn padded_words(text: &str) -> usize {
    text.len().div_ceil(4)
}

fn put_padded(buf: &mut BytesMut, text: &str) {
    buf.put_slice(text.as_bytes());
    let pad = padded_words(text) * 4 - text.len();
    buf.put_bytes(0, pad);
}

fn put_identity(buf: &mut BytesMut, code: u8, identity: &Identity, capabilities: u8) {
    let name = truncate(&identity.endpoint_name, MAX_ENDPOINT_NAME);
    let pid = truncate(&identity.product_instance_id, MAX_PRODUCT_INSTANCE_ID);
    let name_words = padded_words(name);
    buf.put_u8(code);
    buf.put_u8((name_words + padded_words(pid)) as u8);
    buf.put_u8(name_words as u8);
    buf.put_u8(capabilities);
    put_padded(buf, name);
    put_padded(buf, pid);
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn text_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn identity_from(payload: &[u8], name_words: usize) -> Identity {
    let split = (name_words * 4).min(payload.len());
    Identity {
        endpoint_name: text_field(&payload[..split]),
        product_instance_id: text_field(&payload[split..]),
    }
}

impl Command {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Invitation {
                identity,
                capabilities,
            } => put_identity(buf, code::INVITATION, identity, *capabilities),
            Command::InvitationAccepted(identity) => {
                put_identity(buf, code::INVITATION_ACCEPTED, identity, 0)
            }
            Command::InvitationPending(identity) => {
                put_identity(buf, code::INVITATION_PENDING, identity, 0)
            }
            Command::Ping { id } | Command::PingReply { id } => {
                let c = if matches!(self, Command::Ping { .. }) {
                    code::PING
                } else {
                    code::PING_REPLY
                };
                buf.put_slice(&[c, 1, 0, 0]);
                buf.put_u32(*id);
            }
            Command::SessionReset => buf.put_slice(&[code::SESSION_RESET, 0, 0, 0]),
            Command::SessionResetReply => buf.put_slice(&[code::SESSION_RESET_REPLY, 0, 0, 0]),
            Command::Bye { reason } => buf.put_slice(&[code::BYE, 0, *reason, 0]),
            Command::ByeReply => buf.put_slice(&[code::BYE_REPLY, 0, 0, 0]),
            Command::UmpData { sequence, words } => {
                buf.put_u8(code::UMP_DATA);
                buf.put_u8(words.len() as u8);
                buf.put_u16(*sequence);
                for word in words {
                    buf.put_u32(*word);
                }
            }
            Command::Other { code } => buf.put_slice(&[*code, 0, 0, 0]),
        }
    }
}

/// Builds one datagram from command packets.
pub fn encode_datagram(commands: &[Command]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(SIGNATURE);
    for command in commands {
        command.encode(&mut buf);
    }
    buf
}

/// Splits a datagram into its command packets.
pub fn decode_datagram(mut data: &[u8]) -> Result<Vec<Command>, WireError> {
    if data.len() < 4 || data.get_u32() != SIGNATURE {
        return Err(WireError::BadSignature);
    }

    let mut commands = Vec::new();
    while data.len() >= 4 {
        let c = data.get_u8();
        let len = data.get_u8() as usize * 4;
        let specific = [data.get_u8(), data.get_u8()];
        if data.len() < len {
            return Err(WireError::Truncated { code: c });
        }
        let (mut payload, rest) = data.split_at(len);
        data = rest;

        let command = match c {
            code::INVITATION => Command::Invitation {
                identity: identity_from(payload, specific[0] as usize),
                capabilities: specific[1],
            },
            code::INVITATION_ACCEPTED => {
                Command::InvitationAccepted(identity_from(payload, specific[0] as usize))
            }
            code::INVITATION_PENDING => {
                Command::InvitationPending(identity_from(payload, specific[0] as usize))
            }
            code::PING | code::PING_REPLY if payload.len() >= 4 => {
                let id = payload.get_u32();
                if c == code::PING {
                    Command::Ping { id }
                } else {
                    Command::PingReply { id }
                }
            }
            code::SESSION_RESET => Command::SessionReset,
            code::SESSION_RESET_REPLY => Command::SessionResetReply,
            code::BYE => Command::Bye {
                reason: specific[0],
            },
            code::BYE_REPLY => Command::ByeReply,
            code::UMP_DATA => {
                let mut words = Vec::with_capacity(len / 4);
                while payload.has_remaining() {
                    words.push(payload.get_u32());
                }
                Command::UmpData {
                    sequence: u16::from_be_bytes(specific),
                    words,
                }
            }
            other => Command::Other { code: other },
        };
        commands.push(command);
    }

    Ok(commands)
}
