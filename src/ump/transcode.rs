use super::{message_type, message_type_of, packet_words, UmpPacket};
use log::{debug, trace};
use midi2::channel_voice1::{self, ChannelVoice1};
use midi2::prelude::*;
use midi2::sysex7::Sysex7;
use midi2::system_common::{self, SystemCommon};
use serde::Deserialize;

/// Largest SysEx payload buffered in either direction.
const MAX_SYSEX_BYTES: usize = 64 * 1024;

/// Byte encoding used on a local port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalFormat {
    /// Legacy MIDI 1.0 byte stream
    #[default]
    Midi1,
    /// Raw UMP words, little-endian
    Ump,
}

/// Result of converting a packet for the local port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToLocal {
    /// Bytes to write to the local port
    Bytes(Vec<u8>),
    /// Endpoint management message, owned by the network session
    Filtered,
    /// Part of a SysEx message, written once its last packet arrives
    Held,
    /// The packet has no representation in the local format
    Dropped,
}

/// Converts between local port bytes and UMP packets.
///
/// Device-to-network parsing keeps state between reads so that running status and SysEx
/// split across reads are handled. Network-to-device conversion only keeps state while a
/// multi-packet SysEx message is being collected.
#[derive(Debug, Clone)]
pub struct Transcoder {
    inbound: LocalFormat,
    outbound: LocalFormat,
    group: u8,
    parser: Midi1Parser,
    sysex_words: Vec<u32>,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new(LocalFormat::Midi1, LocalFormat::Ump)
    }
}

impl Transcoder {
    /// `inbound` is what the device sends to the bridge, `outbound` what the bridge writes back.
    pub fn new(inbound: LocalFormat, outbound: LocalFormat) -> Self {
        Self {
            inbound,
            outbound,
            group: 0,
            parser: Midi1Parser::default(),
            sysex_words: Vec::new(),
        }
    }

    /// Sets the UMP group stamped on packets built from MIDI 1.0 bytes.
    pub fn with_group(mut self, group: u8) -> Self {
        self.group = group & 0x0F;
        self
    }

    /// Converts one local read into zero or more packets.
    ///
    /// An empty result means nothing should be forwarded: the bytes were incomplete (and are
    /// kept until the next read) or malformed (and are discarded).
    pub fn local_to_ump(&mut self, bytes: &[u8]) -> Vec<UmpPacket> {
        let mut packets = Vec::new();
        match self.inbound {
            LocalFormat::Midi1 => {
                let group = u4::new(self.group);
                for &byte in bytes {
                    self.parser.feed(byte, group, &mut packets);
                }
            }
            LocalFormat::Ump => decode_ump_bytes(bytes, &mut packets),
        }
        packets
    }

    /// Converts a packet received from the network into local port bytes.
    pub fn ump_to_local(&mut self, packet: &UmpPacket) -> ToLocal {
        if packet.is_endpoint_message() {
            return ToLocal::Filtered;
        }

        if self.outbound == LocalFormat::Ump {
            return ToLocal::Bytes(packet.to_le_bytes());
        }

        let bytes = match packet.message_type() {
            message_type::SYSTEM => system_bytes(packet.words()),
            message_type::MIDI1_CHANNEL_VOICE => channel_voice_bytes(packet.words()),
            message_type::DATA_64 => return self.collect_sysex(packet),
            _ => None,
        };
        match bytes {
            Some(bytes) => ToLocal::Bytes(bytes),
            None => ToLocal::Dropped,
        }
    }

    fn collect_sysex(&mut self, packet: &UmpPacket) -> ToLocal {
        let words = packet.words();
        let status = sysex_status(words[0]);

        if status == SYSEX_COMPLETE || status == SYSEX_START {
            if !self.sysex_words.is_empty() {
                debug!("Unfinished SysEx replaced by a new message");
                self.sysex_words.clear();
            }
            if status == SYSEX_COMPLETE {
                return sysex_to_local(words);
            }
            self.sysex_words.extend_from_slice(words);
            return ToLocal::Held;
        }

        if self.sysex_words.is_empty() {
            debug!("SysEx packet status {:X} without a start, dropped", status);
            return ToLocal::Dropped;
        }
        // Six payload bytes per two-word packet
        if self.sysex_words.len() * 3 >= MAX_SYSEX_BYTES {
            debug!("SysEx longer than {} bytes, dropped", MAX_SYSEX_BYTES);
            self.sysex_words.clear();
            return ToLocal::Dropped;
        }

        self.sysex_words.extend_from_slice(words);
        match status {
            SYSEX_CONTINUE => ToLocal::Held,
            SYSEX_END => {
                let words = std::mem::take(&mut self.sysex_words);
                sysex_to_local(&words)
            }
            _ => {
                self.sysex_words.clear();
                ToLocal::Dropped
            }
        }
    }
}

fn decode_ump_bytes(bytes: &[u8], packets: &mut Vec<UmpPacket>) {
    if bytes.len() % 4 != 0 {
        debug!("Ignoring {} trailing bytes of UMP input", bytes.len() % 4);
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut rest = words.as_slice();
    while !rest.is_empty() {
        match UmpPacket::from_words(rest) {
            Some(packet) => {
                packets.push(packet);
                rest = &rest[packet.len()..];
            }
            None => {
                debug!(
                    "Incomplete UMP packet: type {:X} needs {} words, {} available",
                    message_type_of(rest[0]),
                    packet_words(message_type_of(rest[0])),
                    rest.len()
                );
                break;
            }
        }
    }
}

/// Number of data bytes following a MIDI 1.0 status byte.
fn data_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(2),
        0xC0..=0xDF => Some(1),
        0xF1 | 0xF3 => Some(1),
        0xF2 => Some(2),
        0xF6 | 0xF8 | 0xFA..=0xFC | 0xFE | 0xFF => Some(0),
        _ => None,
    }
}

fn to_u7(byte: u8) -> u7 {
    u7::new(byte & 0x7F)
}

fn to_u14(lsb: u8, msb: u8) -> u14 {
    u14::new(u16::from(lsb & 0x7F) | (u16::from(msb & 0x7F) << 7))
}

fn split_u14(value: u14) -> [u8; 2] {
    let value = u16::from(value);
    [(value & 0x7F) as u8, (value >> 7) as u8]
}

/// First word of a new single-word message after its group and fields are set.
macro_rules! message_word {
    ($ty:ty, $group:expr $(, $setter:ident($value:expr))*) => {{
        let mut message = <$ty>::new();
        message.set_group($group);
        $(message.$setter($value);)*
        message.data()[0]
    }};
}

/// Builds the packet for a complete channel voice or system message.
fn short_message(group: u4, status: u8, data: [u8; 2]) -> Option<UmpPacket> {
    let word = if status < 0xF0 {
        channel_voice_word(group, status, data)
    } else {
        system_word(group, status, data)?
    };
    UmpPacket::single(word)
}

fn channel_voice_word(group: u4, status: u8, [d0, d1]: [u8; 2]) -> u32 {
    use channel_voice1::*;

    let channel = u4::new(status & 0x0F);
    match status & 0xF0 {
        0x80 => message_word!(
            NoteOff<[u32; 4]>,
            group,
            set_channel(channel),
            set_note_number(to_u7(d0)),
            set_velocity(to_u7(d1))
        ),
        0x90 => message_word!(
            NoteOn<[u32; 4]>,
            group,
            set_channel(channel),
            set_note_number(to_u7(d0)),
            set_velocity(to_u7(d1))
        ),
        0xA0 => message_word!(
            KeyPressure<[u32; 4]>,
            group,
            set_channel(channel),
            set_note_number(to_u7(d0)),
            set_pressure(to_u7(d1))
        ),
        0xB0 => message_word!(
            ControlChange<[u32; 4]>,
            group,
            set_channel(channel),
            set_control(to_u7(d0)),
            set_control_data(to_u7(d1))
        ),
        0xC0 => message_word!(
            ProgramChange<[u32; 4]>,
            group,
            set_channel(channel),
            set_program(to_u7(d0))
        ),
        0xD0 => message_word!(
            ChannelPressure<[u32; 4]>,
            group,
            set_channel(channel),
            set_pressure(to_u7(d0))
        ),
        _ => message_word!(
            PitchBend<[u32; 4]>,
            group,
            set_channel(channel),
            set_bend(to_u14(d0, d1))
        ),
    }
}

fn system_word(group: u4, status: u8, [d0, d1]: [u8; 2]) -> Option<u32> {
    use system_common::*;

    let word = match status {
        0xF1 => message_word!(TimeCode<[u32; 4]>, group, set_time_code(to_u7(d0))),
        0xF2 => message_word!(
            SongPositionPointer<[u32; 4]>,
            group,
            set_position(to_u14(d0, d1))
        ),
        0xF3 => message_word!(SongSelect<[u32; 4]>, group, set_song(to_u7(d0))),
        0xF6 => message_word!(TuneRequest<[u32; 4]>, group),
        0xF8 => message_word!(TimingClock<[u32; 4]>, group),
        0xFA => message_word!(Start<[u32; 4]>, group),
        0xFB => message_word!(Continue<[u32; 4]>, group),
        0xFC => message_word!(Stop<[u32; 4]>, group),
        0xFE => message_word!(ActiveSensing<[u32; 4]>, group),
        0xFF => message_word!(Reset<[u32; 4]>, group),
        _ => return None,
    };
    Some(word)
}

fn channel_voice_bytes(words: &[u32]) -> Option<Vec<u8>> {
    let bytes = match ChannelVoice1::<&[u32]>::try_from(words).ok()? {
        ChannelVoice1::NoteOff(m) => vec![
            0x80 | u8::from(m.channel()),
            u8::from(m.note_number()),
            u8::from(m.velocity()),
        ],
        ChannelVoice1::NoteOn(m) => vec![
            0x90 | u8::from(m.channel()),
            u8::from(m.note_number()),
            u8::from(m.velocity()),
        ],
        ChannelVoice1::KeyPressure(m) => vec![
            0xA0 | u8::from(m.channel()),
            u8::from(m.note_number()),
            u8::from(m.pressure()),
        ],
        ChannelVoice1::ControlChange(m) => vec![
            0xB0 | u8::from(m.channel()),
            u8::from(m.control()),
            u8::from(m.control_data()),
        ],
        ChannelVoice1::ProgramChange(m) => {
            vec![0xC0 | u8::from(m.channel()), u8::from(m.program())]
        }
        ChannelVoice1::ChannelPressure(m) => {
            vec![0xD0 | u8::from(m.channel()), u8::from(m.pressure())]
        }
        ChannelVoice1::PitchBend(m) => {
            let [lsb, msb] = split_u14(m.bend());
            vec![0xE0 | u8::from(m.channel()), lsb, msb]
        }
    };
    Some(bytes)
}

fn system_bytes(words: &[u32]) -> Option<Vec<u8>> {
    let bytes = match SystemCommon::<&[u32]>::try_from(words).ok()? {
        SystemCommon::TimeCode(m) => vec![0xF1, u8::from(m.time_code())],
        SystemCommon::SongPositionPointer(m) => {
            let [lsb, msb] = split_u14(m.position());
            vec![0xF2, lsb, msb]
        }
        SystemCommon::SongSelect(m) => vec![0xF3, u8::from(m.song())],
        SystemCommon::TuneRequest(_) => vec![0xF6],
        SystemCommon::TimingClock(_) => vec![0xF8],
        SystemCommon::Start(_) => vec![0xFA],
        SystemCommon::Continue(_) => vec![0xFB],
        SystemCommon::Stop(_) => vec![0xFC],
        SystemCommon::ActiveSensing(_) => vec![0xFE],
        SystemCommon::Reset(_) => vec![0xFF],
        _ => return None,
    };
    Some(bytes)
}

// SysEx7 packet status values
const SYSEX_COMPLETE: u8 = 0x0;
const SYSEX_START: u8 = 0x1;
const SYSEX_CONTINUE: u8 = 0x2;
const SYSEX_END: u8 = 0x3;

fn sysex_status(word: u32) -> u8 {
    ((word >> 20) & 0x0F) as u8
}

/// Splits a SysEx payload (without F0/F7) into two-word packets.
fn sysex_packets(group: u4, payload: &[u8]) -> Vec<UmpPacket> {
    let mut message = Sysex7::<Vec<u32>>::new();
    message.set_payload(payload.iter().map(|&b| to_u7(b)));
    message.set_group(group);
    message
        .data()
        .chunks_exact(2)
        .filter_map(UmpPacket::from_words)
        .collect()
}

fn sysex_to_local(words: &[u32]) -> ToLocal {
    match Sysex7::<&[u32]>::try_from(words) {
        Ok(message) => {
            let mut bytes = vec![0xF0];
            bytes.extend(message.payload().map(u8::from));
            bytes.push(0xF7);
            ToLocal::Bytes(bytes)
        }
        Err(e) => {
            debug!("Malformed SysEx7 message dropped: {:?}", e);
            ToLocal::Dropped
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SysexBuffer {
    payload: Vec<u8>,
    overflowed: bool,
}

/// Streaming MIDI 1.0 byte parser
#[derive(Debug, Clone, Default)]
struct Midi1Parser {
    running_status: Option<u8>,
    pending: Option<u8>,
    data: [u8; 2],
    data_len: usize,
    sysex: Option<SysexBuffer>,
}

impl Midi1Parser {
    fn feed(&mut self, byte: u8, group: u4, out: &mut Vec<UmpPacket>) {
        // Real-time bytes may appear anywhere, even inside other messages
        if byte >= 0xF8 {
            match short_message(group, byte, [0, 0]) {
                Some(packet) => out.push(packet),
                None => trace!("Ignoring undefined real-time byte {:02X}", byte),
            }
            return;
        }

        if byte & 0x80 != 0 {
            self.feed_status(byte, group, out);
        } else {
            self.feed_data(byte, group, out);
        }
    }

    fn finish_sysex(sysex: SysexBuffer, group: u4, out: &mut Vec<UmpPacket>) {
        if sysex.overflowed {
            debug!("SysEx longer than {} bytes, dropped", MAX_SYSEX_BYTES);
            return;
        }
        out.extend(sysex_packets(group, &sysex.payload));
    }

    fn feed_status(&mut self, status: u8, group: u4, out: &mut Vec<UmpPacket>) {
        if let Some(sysex) = self.sysex.take() {
            if status != 0xF7 {
                // Any other status byte ends the SysEx early
                debug!("SysEx interrupted by status {:02X}", status);
            }
            Self::finish_sysex(sysex, group, out);
            if status == 0xF7 {
                return;
            }
        }

        self.data_len = 0;
        match status {
            0xF0 => {
                self.running_status = None;
                self.pending = None;
                self.sysex = Some(SysexBuffer::default());
            }
            0xF7 => {
                trace!("Ignoring stray end of SysEx");
                self.pending = None;
            }
            0xF1..=0xF6 => {
                self.running_status = None;
                match data_len(status) {
                    Some(0) => {
                        self.pending = None;
                        out.extend(short_message(group, status, [0, 0]));
                    }
                    Some(_) => self.pending = Some(status),
                    None => {
                        debug!("Ignoring undefined system common status {:02X}", status);
                        self.pending = None;
                    }
                }
            }
            _ => {
                self.running_status = Some(status);
                self.pending = Some(status);
            }
        }
    }

    fn feed_data(&mut self, byte: u8, group: u4, out: &mut Vec<UmpPacket>) {
        if let Some(sysex) = self.sysex.as_mut() {
            if sysex.payload.len() < MAX_SYSEX_BYTES {
                sysex.payload.push(byte);
            } else {
                sysex.overflowed = true;
            }
            return;
        }

        let status = match self.pending.or(self.running_status) {
            Some(status) => status,
            None => {
                trace!("Dropping data byte {:02X} without status", byte);
                return;
            }
        };
        self.pending = Some(status);

        self.data[self.data_len] = byte;
        self.data_len += 1;
        if Some(self.data_len) == data_len(status) {
            let data = if self.data_len == 1 {
                [self.data[0], 0]
            } else {
                self.data
            };
            out.extend(short_message(group, status, data));
            self.pending = None;
            self.data_len = 0;
        }
    }
}
