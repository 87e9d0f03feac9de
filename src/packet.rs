//! Datagram layout of the bridge's sample stream.
//!
//! Every datagram is a run of host order (little endian) 16 bit words:
//!
//! ```text
//! word 0       frame marker in the low byte
//! word 4, 5    sequence number, low then high
//! word 16      aux mask (low byte), aux phase (high byte)
//! word 18      battery
//! word 19      digital inputs
//! word 20 + i*(ch+2)       aux sample of group i
//! word 22 + i*(ch+2) ..    ch electrode samples of group i
//! ```

use thiserror::Error;

use crate::{buffers::StreamLayout, FRAME_MARKER, HEADER_BYTES};

const SEQ_LO_WORD: usize = 4;
const SEQ_HI_WORD: usize = 5;
const AUX_WORD: usize = 16;
const BATTERY_WORD: usize = 18;
const DIGITAL_WORD: usize = 19;
/// Words ahead of the first aux sample
const GROUP_BASE_WORD: usize = HEADER_BYTES / 2;
/// Electrodes follow the aux word and one unused word
const ELECTRODE_SKIP: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected a {expected} byte datagram, read {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("bad frame marker {0:#04x}")]
    BadFrameMarker(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub frame_marker: u8,
    pub sequence_number: u32,
    pub aux_phase: u8,
    pub aux_mask: u8,
    pub battery_raw: u16,
    pub digital_inputs: u16,
}

/// A validated datagram borrowed from the receive buffer
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    layout: StreamLayout,
    payload: &'a [u8],
}

#[inline]
fn word(bytes: &[u8], idx: usize) -> u16 {
    u16::from_le_bytes([bytes[2 * idx], bytes[2 * idx + 1]])
}

impl<'a> Packet<'a> {
    pub fn layout(&self) -> StreamLayout {
        self.layout
    }

    #[inline]
    fn group_base(&self, group: usize) -> usize {
        GROUP_BASE_WORD + group * self.layout.group_words()
    }

    /// Raw aux word of sample group `group`
    #[inline]
    pub fn aux_word(&self, group: usize) -> u16 {
        word(self.payload, self.group_base(group))
    }

    /// Raw electrode word of `channel` in sample group `group`
    #[inline]
    pub fn electrode_word(&self, group: usize, channel: usize) -> u16 {
        word(self.payload, self.group_base(group) + ELECTRODE_SKIP + channel)
    }
}

/// Validate one datagram and pull out its header
pub fn decode(datagram: &[u8], layout: StreamLayout) -> Result<Packet<'_>, DecodeError> {
    let expected = layout.receive_bytes();
    if datagram.len() != expected {
        return Err(DecodeError::ShortRead {
            expected,
            actual: datagram.len(),
        });
    }
    let frame_marker = (word(datagram, 0) & 0x00ff) as u8;
    if frame_marker != FRAME_MARKER {
        return Err(DecodeError::BadFrameMarker(frame_marker));
    }
    let aux = word(datagram, AUX_WORD);
    let header = PacketHeader {
        frame_marker,
        sequence_number: ((word(datagram, SEQ_HI_WORD) as u32) << 16)
            | word(datagram, SEQ_LO_WORD) as u32,
        aux_mask: (aux & 0x00ff) as u8,
        aux_phase: (aux >> 8) as u8,
        battery_raw: word(datagram, BATTERY_WORD),
        digital_inputs: word(datagram, DIGITAL_WORD),
    };
    Ok(Packet {
        header,
        layout,
        payload: datagram,
    })
}

/// Builds datagrams in the bridge's layout. Used by tests and benches.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    layout: StreamLayout,
    words: Vec<u16>,
}

impl PacketBuilder {
    pub fn new(layout: StreamLayout) -> Self {
        let mut words = vec![0u16; layout.receive_bytes() / 2];
        words[0] = FRAME_MARKER as u16;
        Self { layout, words }
    }

    pub fn frame_word(mut self, w: u16) -> Self {
        self.words[0] = w;
        self
    }

    pub fn sequence(mut self, seq: u32) -> Self {
        self.words[SEQ_LO_WORD] = seq as u16;
        self.words[SEQ_HI_WORD] = (seq >> 16) as u16;
        self
    }

    pub fn aux(mut self, phase: u8, mask: u8) -> Self {
        self.words[AUX_WORD] = ((phase as u16) << 8) | mask as u16;
        self
    }

    pub fn battery(mut self, raw: u16) -> Self {
        self.words[BATTERY_WORD] = raw;
        self
    }

    pub fn digital_inputs(mut self, bits: u16) -> Self {
        self.words[DIGITAL_WORD] = bits;
        self
    }

    pub fn electrode(mut self, group: usize, channel: usize, value: u16) -> Self {
        let idx = GROUP_BASE_WORD + group * self.layout.group_words() + ELECTRODE_SKIP + channel;
        self.words[idx] = value;
        self
    }

    pub fn fill_electrodes(mut self, value: u16) -> Self {
        for group in 0..self.layout.samples_per_packet {
            for ch in 0..self.layout.channel_count {
                self = self.electrode(group, ch, value);
            }
        }
        self
    }

    pub fn aux_sample(mut self, group: usize, value: u16) -> Self {
        self.words[GROUP_BASE_WORD + group * self.layout.group_words()] = value;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
