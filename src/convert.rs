//! Scaling raw packet words into float blocks for the sample sink

use crate::{
    buffers::{BlockBuffers, StreamLayout, AUX_RING_SLOTS},
    packet::Packet,
    AUX_CHANNELS, AUX_SCALE_MV, DATA_OFFSET, ELECTRODE_SCALE_UV,
};

#[inline]
pub fn electrode_uv(raw: u16) -> f32 {
    ELECTRODE_SCALE_UV * (raw as f32 - DATA_OFFSET as f32)
}

#[inline]
pub fn aux_mv(raw: u16) -> f32 {
    AUX_SCALE_MV * (raw as f32 - DATA_OFFSET as f32)
}

/// The chip samples its three aux inputs round robin through one slot per frame.
/// Each sample group carries one of them, selected by the rotating aux phase, so
/// every aux channel refreshes at a quarter of the main rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxRing {
    slots: [u16; AUX_RING_SLOTS],
}

impl Default for AuxRing {
    fn default() -> Self {
        Self {
            slots: [DATA_OFFSET; AUX_RING_SLOTS],
        }
    }
}

impl AuxRing {
    pub fn capture(&mut self, phase: usize, raw: u16) {
        self.slots[phase % AUX_RING_SLOTS] = raw;
    }

    pub fn slots(&self) -> [u16; AUX_RING_SLOTS] {
        self.slots
    }

    /// Latest value of each aux input, slot 0 is the chip's command echo
    pub fn channels(&self) -> [u16; AUX_CHANNELS] {
        [self.slots[1], self.slots[2], self.slots[3]]
    }
}

/// Digital input state carried from one packet to the next.
///
/// A block is tagged with the inputs seen in the previous packet's header so
/// event words never change retroactively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLatch {
    carried: u64,
}

impl EventLatch {
    pub fn current(&self) -> u64 {
        self.carried
    }

    /// Latch the inputs of the packet just converted
    pub fn latch(&mut self, digital_inputs: u16) {
        self.carried = digital_inputs as u64;
    }
}

/// One packet of converted samples, borrowed from the session's buffers
#[derive(Debug, Clone, Copy)]
pub struct SampleBlock<'a> {
    pub channels: usize,
    pub samples: usize,
    /// Channel-major, `channels * samples` values
    pub data: &'a [f32],
    pub sample_numbers: &'a [i64],
    pub timestamps: &'a [f64],
    pub event_words: &'a [u64],
    /// Raw aux ring after each sample group, 4 slots per group. Empty without aux.
    pub aux_slots: &'a [u16],
}

impl<'a> SampleBlock<'a> {
    /// All samples of one channel (aux channels follow the electrodes)
    pub fn row(&self, channel: usize) -> &'a [f32] {
        &self.data[channel * self.samples..(channel + 1) * self.samples]
    }
}

/// Per-session conversion state
#[derive(Debug, Clone)]
pub struct SampleConverter {
    layout: StreamLayout,
    sample_rate_hz: f64,
    aux: AuxRing,
    events: EventLatch,
}

impl SampleConverter {
    pub fn new(layout: StreamLayout, sample_rate_hz: f64) -> Self {
        Self {
            layout,
            sample_rate_hz,
            aux: AuxRing::default(),
            events: EventLatch::default(),
        }
    }

    pub fn reset(&mut self) {
        self.aux = AuxRing::default();
        self.events = EventLatch::default();
    }

    pub fn aux_ring(&self) -> &AuxRing {
        &self.aux
    }

    /// Convert `packet` into `bufs`, numbering its samples from `first_sample`
    pub fn convert<'b>(
        &mut self,
        packet: &Packet<'_>,
        first_sample: i64,
        bufs: &'b mut BlockBuffers,
    ) -> SampleBlock<'b> {
        let spp = self.layout.samples_per_packet;
        let channels = self.layout.channel_count;
        let phase = packet.header.aux_phase as usize;
        let events = self.events.current();

        for i in 0..spp {
            for ch in 0..channels {
                bufs.convert[ch * spp + i] = electrode_uv(packet.electrode_word(i, ch));
            }
            if self.layout.aux_enabled {
                self.aux.capture(phase + i, packet.aux_word(i));
                bufs.aux_scratch[i * AUX_RING_SLOTS..(i + 1) * AUX_RING_SLOTS]
                    .copy_from_slice(&self.aux.slots());
                for (k, raw) in self.aux.channels().into_iter().enumerate() {
                    bufs.convert[(channels + k) * spp + i] = aux_mv(raw);
                }
            }
            let n = first_sample + i as i64;
            bufs.sample_numbers[i] = n;
            bufs.timestamps[i] = n as f64 / self.sample_rate_hz;
            bufs.event_words[i] = events;
        }
        self.events.latch(packet.header.digital_inputs);

        let out_channels = self.layout.output_channels();
        let aux_slots: &[u16] = if self.layout.aux_enabled {
            &bufs.aux_scratch[..spp * AUX_RING_SLOTS]
        } else {
            &[]
        };
        SampleBlock {
            channels: out_channels,
            samples: spp,
            data: &bufs.convert[..out_channels * spp],
            sample_numbers: &bufs.sample_numbers,
            timestamps: &bufs.timestamps,
            event_words: &bufs.event_words,
            aux_slots,
        }
    }
}
