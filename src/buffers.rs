//! Buffer sizing for one committed stream layout.
//!
//! The receive buffer holds one datagram plus a spare word, so an oversized
//! datagram reads back longer than expected instead of being silently
//! truncated to the right length. The convert buffers hold one
//! packet worth of scaled samples plus the per-sample metadata handed to the sink.

use std::collections::TryReserveError;
use std::mem::size_of;

use thiserror::Error;
use tracing::debug;

use crate::{AUX_CHANNELS, HEADER_BYTES};

/// Sample groups per datagram, indexed by `channel_count / 4 - 1`
const SAMPLES_PER_PACKET: [usize; 8] = [119, 71, 51, 39, 32, 27, 23, 21];

/// Aux ring slots kept per sample group in the scratch buffer
pub const AUX_RING_SLOTS: usize = 4;
/// Slack past the expected datagram size in the receive buffer
pub const RECEIVE_SLACK_BYTES: usize = size_of::<u16>();

/// Number of sample groups the bridge packs into one datagram for `channel_count` channels.
/// Only multiples of 4 up to 32 are valid.
pub fn samples_per_packet(channel_count: usize) -> Option<usize> {
    if channel_count == 0 || channel_count % 4 != 0 {
        return None;
    }
    SAMPLES_PER_PACKET.get(channel_count / 4 - 1).copied()
}

pub fn receive_bytes(channel_count: usize, samples_per_packet: usize) -> usize {
    HEADER_BYTES + (channel_count + 2) * samples_per_packet * size_of::<u16>()
}

pub fn convert_bytes(channel_count: usize, samples_per_packet: usize, aux_enabled: bool) -> usize {
    let aux = if aux_enabled { AUX_CHANNELS } else { 0 };
    (channel_count + aux) * samples_per_packet * size_of::<f32>()
}

pub fn aux_scratch_bytes(samples_per_packet: usize) -> usize {
    samples_per_packet * AUX_RING_SLOTS * size_of::<u16>()
}

/// Shape of the datagrams and blocks for a committed configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLayout {
    pub channel_count: usize,
    pub samples_per_packet: usize,
    pub aux_enabled: bool,
}

impl StreamLayout {
    /// Layout with the bridge's packing for `channel_count`
    pub fn for_channels(channel_count: usize, aux_enabled: bool) -> Option<Self> {
        samples_per_packet(channel_count).map(|samples_per_packet| Self {
            channel_count,
            samples_per_packet,
            aux_enabled,
        })
    }

    /// Words per sample group: aux word, an unused word, then the electrodes
    pub fn group_words(&self) -> usize {
        self.channel_count + 2
    }

    /// Rows in a converted block
    pub fn output_channels(&self) -> usize {
        if self.aux_enabled {
            self.channel_count + AUX_CHANNELS
        } else {
            self.channel_count
        }
    }

    pub fn receive_bytes(&self) -> usize {
        receive_bytes(self.channel_count, self.samples_per_packet)
    }

    pub fn convert_bytes(&self) -> usize {
        convert_bytes(self.channel_count, self.samples_per_packet, self.aux_enabled)
    }

    pub fn aux_scratch_bytes(&self) -> usize {
        aux_scratch_bytes(self.samples_per_packet)
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("could not allocate stream buffers: {0}")]
    Alloc(#[from] TryReserveError),
}

fn zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>, TryReserveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, T::default());
    Ok(v)
}

/// Conversion output for one packet, handed to the sink as a block
#[derive(Debug)]
pub struct BlockBuffers {
    /// Channel-major scaled samples
    pub convert: Vec<f32>,
    /// Aux ring snapshot per sample group
    pub aux_scratch: Vec<u16>,
    pub sample_numbers: Vec<i64>,
    pub timestamps: Vec<f64>,
    pub event_words: Vec<u64>,
}

/// All buffers the decode loop touches for one packet
#[derive(Debug)]
pub struct BufferSet {
    layout: StreamLayout,
    pub receive: Vec<u8>,
    pub block: BlockBuffers,
}

impl BufferSet {
    pub fn new(layout: StreamLayout) -> Result<Self, BufferError> {
        let spp = layout.samples_per_packet;
        Ok(Self {
            layout,
            receive: zeroed(layout.receive_bytes() + RECEIVE_SLACK_BYTES)?,
            block: BlockBuffers {
                convert: zeroed(layout.convert_bytes() / size_of::<f32>())?,
                aux_scratch: zeroed(layout.aux_scratch_bytes() / size_of::<u16>())?,
                sample_numbers: zeroed(spp)?,
                timestamps: zeroed(spp)?,
                event_words: zeroed(spp)?,
            },
        })
    }

    pub fn layout(&self) -> StreamLayout {
        self.layout
    }

    /// Reallocate for a new layout. On failure the current buffers are left untouched.
    /// Taking `&mut self` means no decode loop can be holding these buffers.
    pub fn resize(&mut self, layout: StreamLayout) -> Result<(), BufferError> {
        if layout == self.layout {
            return Ok(());
        }
        let fresh = Self::new(layout)?;
        *self = fresh;
        debug!(
            channels = layout.channel_count,
            samples = layout.samples_per_packet,
            receive_bytes = layout.receive_bytes(),
            convert_bytes = layout.convert_bytes(),
            "Resized stream buffers"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_sizes() {
        assert_eq!(receive_bytes(32, 21), 1468);
        assert_eq!(convert_bytes(32, 21, false), 2688);
        assert_eq!(convert_bytes(32, 21, true), 2940);
        assert_eq!(aux_scratch_bytes(21), 168);
    }

    #[test]
    fn test_packing_table() {
        assert_eq!(samples_per_packet(32), Some(21));
        assert_eq!(samples_per_packet(4), Some(119));
        assert_eq!(samples_per_packet(16), Some(39));
        assert_eq!(samples_per_packet(0), None);
        assert_eq!(samples_per_packet(6), None);
        assert_eq!(samples_per_packet(36), None);
        // every layout fits the same datagram budget
        for ch in (4..=32).step_by(4) {
            let layout = StreamLayout::for_channels(ch, false).unwrap();
            assert!(layout.receive_bytes() <= 1468);
        }
    }

    #[test]
    fn test_buffer_set_lengths() {
        let layout = StreamLayout::for_channels(32, true).unwrap();
        let set = BufferSet::new(layout).unwrap();
        assert_eq!(set.receive.len(), 1468 + RECEIVE_SLACK_BYTES);
        assert_eq!(set.block.convert.len(), 35 * 21);
        assert_eq!(set.block.aux_scratch.len(), 84);
        assert_eq!(set.block.event_words.len(), 21);
    }

    #[test]
    fn test_resize() {
        let mut set = BufferSet::new(StreamLayout::for_channels(32, false).unwrap()).unwrap();
        let layout = StreamLayout::for_channels(8, true).unwrap();
        set.resize(layout).unwrap();
        assert_eq!(set.layout(), layout);
        assert_eq!(set.receive.len(), 40 + 10 * 71 * 2 + RECEIVE_SLACK_BYTES);
        assert_eq!(set.block.convert.len(), 11 * 71);
        assert_eq!(set.block.sample_numbers.len(), 71);
    }
}
