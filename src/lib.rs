//! Acquisition front-end for the RCB wireless headstage bridge.
//!
//! The bridge board relays an RHD2000-family amplifier chip over UDP. This
//! crate solves the chip's register image from user intent, then decodes,
//! tracks and scales the datagram stream the bridge produces.

pub mod args;
pub mod buffers;
pub mod capture;
pub mod control;
pub mod convert;
pub mod exfil;
pub mod packet;
pub mod sequence;
pub mod solver;
pub mod telemetry;

/// Default UDP port the bridge streams to
pub const DEFAULT_PORT: u16 = 51234;
/// Low byte of word 0 in every valid datagram
pub const FRAME_MARKER: u8 = 0xC5;
/// Bytes of fixed header ahead of the first sample group
pub const HEADER_BYTES: usize = 40;
/// Electrode LSB in microvolts
pub const ELECTRODE_SCALE_UV: f32 = 0.195;
/// Auxiliary input LSB in millivolts
pub const AUX_SCALE_MV: f32 = 0.0000374;
/// Unsigned-offset zero code of the chip's ADC
pub const DATA_OFFSET: u16 = 32768;
pub const DEFAULT_CHANNELS: usize = 32;
/// Channels reconstructed from the multiplexed auxiliary slot
pub const AUX_CHANNELS: usize = 3;
/// Max channels the amplifier chip exposes
pub const MAX_CHANNELS: usize = 32;
