//! Register image solver for the RHD2000 amplifier behind the bridge.
//!
//! Everything here is a pure function of the user's intent. The bridge board
//! replicates the same timing computation on its side, so the clock divider and
//! the resulting sample rate have to match it bit for bit.

use std::f64::consts::PI;

use thiserror::Error;

use crate::MAX_CHANNELS;

/// Reference clock of the bridge's SPI master
pub const SPI_REFERENCE_HZ: f64 = 4e7;
/// SPI clocks per 16 bit word, including the chip select gap
pub const BITS_PER_WORD: f64 = 16.5;
/// Auxiliary command slots the bridge always adds to each frame
pub const RESERVED_SLOTS: usize = 2;
pub const MIN_DIVIDER: u32 = 2;
/// Inter-word delay when the divider is even
pub const EVEN_WORD_DELAY_S: f64 = 200e-9;
/// Inter-word delay when the divider is odd
pub const ODD_WORD_DELAY_S: f64 = 187.5e-9;
/// Upper bound of the sample rates the bridge offers
pub const MAX_SAMPLE_RATE_HZ: f64 = 30000.0;
/// With every channel enabled the SPI bus tops out below this
pub const FULL_CHANNEL_MAX_RATE_HZ: f64 = 20000.0;
pub const DSP_CUTOFF_RANGE_HZ: (f64, f64) = (0.1, 1000.0);
pub const MAX_PA_ATTENUATION: u8 = 15;

/// Selectable upper (low-pass) corners, indexed like the DAC tables below
pub const UPPER_CORNERS_HZ: [f64; 17] = [
    20000.0, 15000.0, 10000.0, 7500.0, 5000.0, 3000.0, 2500.0, 2000.0, 1500.0, 1000.0, 750.0,
    500.0, 300.0, 250.0, 200.0, 150.0, 100.0,
];

/// Selectable lower (high-pass) corners, indexed like the DAC tables below
pub const LOWER_CORNERS_HZ: [f64; 25] = [
    500.0, 300.0, 250.0, 200.0, 150.0, 100.0, 75.0, 50.0, 30.0, 25.0, 20.0, 15.0, 10.0, 7.5, 5.0,
    3.0, 2.5, 2.0, 1.5, 1.0, 0.75, 0.5, 0.3, 0.25, 0.1,
];

// RHD2000 datasheet, on-chip amplifier bandwidth select
const UPPER_RH1_DAC1: [u8; 17] = [
    0x08, 0x0B, 0x11, 0x16, 0x21, 0x03, 0x0D, 0x1B, 0x01, 0x2E, 0x29, 0x1E, 0x06, 0x2A, 0x18, 0x2C,
    0x26,
];
const UPPER_RH1_DAC2: [u8; 17] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x02, 0x02, 0x03, 0x05, 0x09, 0x0A, 0x0D, 0x11,
    0x1A,
];
const UPPER_RH2_DAC1: [u8; 17] = [
    0x04, 0x08, 0x10, 0x17, 0x25, 0x0D, 0x19, 0x2C, 0x17, 0x1E, 0x24, 0x2B, 0x02, 0x05, 0x07, 0x08,
    0x05,
];
const UPPER_RH2_DAC2: [u8; 17] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x02, 0x03, 0x04, 0x06, 0x0B, 0x0D, 0x10, 0x15,
    0x1F,
];
const LOWER_DAC1: [u8; 25] = [
    0x0D, 0x0F, 0x11, 0x12, 0x15, 0x19, 0x1C, 0x22, 0x2C, 0x30, 0x36, 0x3E, 0x05, 0x12, 0x28, 0x14,
    0x2A, 0x08, 0x09, 0x2C, 0x31, 0x23, 0x01, 0x38, 0x10,
];
const LOWER_DAC2: [u8; 25] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x01, 0x02,
    0x02, 0x03, 0x04, 0x06, 0x09, 0x11, 0x28, 0x36, 0x7C,
];

/// Aux command sequence enable, shared by the second DAC byte of each pair
const AUX_SEQUENCE_BIT: u8 = 0x80;
/// VDD sense enable in register 1
const VDD_SENSE_BIT: u8 = 0x40;

/// (rate below, MUX bias, ADC buffer bias)
const BIAS_STEPS: [(f64, u8, u8); 8] = [
    (3334.0, 40, 32),
    (4001.0, 40, 16),
    (5001.0, 40, 8),
    (6251.0, 32, 8),
    (8001.0, 26, 8),
    (10001.0, 18, 4),
    (12501.0, 16, 3),
    (15001.0, 7, 3),
];
const DEFAULT_BIAS: (u8, u8) = (4, 2);

const DSP_CODES: usize = 15;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("channel count must be a multiple of 4 between 4 and 32, got {0}")]
    ChannelCount(usize),
    #[error("channel window starting at {start} with {count} channels runs past channel 32")]
    ChannelWindow { start: usize, count: usize },
    #[error("desired sample rate {0} Hz is outside (0, 30000]")]
    SampleRate(f64),
    #[error("{channels} channels support at most 20000 Hz, requested {rate} Hz")]
    RateTooHighForChannels { rate: f64, channels: usize },
    #[error("SPI divider for {rate} Hz on {channels} channels would be below 2")]
    DividerUnderflow { rate: f64, channels: usize },
    #[error("DSP cutoff {0} Hz is outside 0.1..=1000 Hz")]
    DspCutoff(f64),
    #[error("filter corner {0} Hz is not a positive frequency")]
    FilterCorner(f64),
    #[error("PA attenuation {0} is outside 0..=15")]
    PaAttenuation(u8),
}

/// What the user asked the headstage to do.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIntent {
    pub desired_sample_rate_hz: f64,
    pub channel_count: usize,
    /// 1-based index of the first enabled amplifier
    pub channel_start: usize,
    /// Amplifier high-pass corner
    pub lower_bandwidth_hz: f64,
    /// Amplifier low-pass corner
    pub upper_bandwidth_hz: f64,
    pub dsp_cutoff_hz: f64,
    pub dsp_enabled: bool,
    pub aux_enabled: bool,
    pub pa_attenuation: u8,
}

impl Default for DeviceIntent {
    fn default() -> Self {
        Self {
            desired_sample_rate_hz: 20000.0,
            channel_count: crate::DEFAULT_CHANNELS,
            channel_start: 1,
            lower_bandwidth_hz: 0.1,
            upper_bandwidth_hz: 7500.0,
            dsp_cutoff_hz: 1.0,
            dsp_enabled: true,
            aux_enabled: false,
            pa_attenuation: 4,
        }
    }
}

impl DeviceIntent {
    /// Check everything the solver assumes about its inputs
    pub fn validate(&self) -> Result<(), ConfigError> {
        let count = self.channel_count;
        if !(4..=MAX_CHANNELS).contains(&count) || count % 4 != 0 {
            return Err(ConfigError::ChannelCount(count));
        }
        if self.channel_start < 1 || self.channel_start + count - 1 > MAX_CHANNELS {
            return Err(ConfigError::ChannelWindow {
                start: self.channel_start,
                count,
            });
        }
        let rate = self.desired_sample_rate_hz;
        if !rate.is_finite() || rate <= 0.0 || rate > MAX_SAMPLE_RATE_HZ {
            return Err(ConfigError::SampleRate(rate));
        }
        if count == MAX_CHANNELS && rate > FULL_CHANNEL_MAX_RATE_HZ {
            return Err(ConfigError::RateTooHighForChannels {
                rate,
                channels: count,
            });
        }
        match raw_divider(rate, count) {
            Some(d) if d >= MIN_DIVIDER as f64 => {}
            _ => {
                return Err(ConfigError::DividerUnderflow {
                    rate,
                    channels: count,
                })
            }
        }
        let (lo, hi) = DSP_CUTOFF_RANGE_HZ;
        if !(lo..=hi).contains(&self.dsp_cutoff_hz) {
            return Err(ConfigError::DspCutoff(self.dsp_cutoff_hz));
        }
        for corner in [self.lower_bandwidth_hz, self.upper_bandwidth_hz] {
            if !corner.is_finite() || corner <= 0.0 {
                return Err(ConfigError::FilterCorner(corner));
            }
        }
        if self.pa_attenuation > MAX_PA_ATTENUATION {
            return Err(ConfigError::PaAttenuation(self.pa_attenuation));
        }
        Ok(())
    }

    /// Validate, then solve
    pub fn solve(&self) -> Result<FrontEndConfig, ConfigError> {
        self.validate()?;
        Ok(FrontEndConfig::solve(self))
    }
}

/// Outcome of the SPI timing inversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSolution {
    pub divider: u32,
    pub achieved_rate_hz: f64,
    pub spi_clock_hz: f64,
}

fn required_bitrate(desired_rate: f64, channel_count: usize) -> f64 {
    let slots = (channel_count + RESERVED_SLOTS) as f64;
    BITS_PER_WORD * slots * desired_rate / (1.0 - 2e-7 * slots * desired_rate)
}

/// Divider before rounding and flooring, `None` when no bitrate can reach the rate
fn raw_divider(desired_rate: f64, channel_count: usize) -> Option<f64> {
    let bitrate = required_bitrate(desired_rate, channel_count);
    (bitrate.is_finite() && bitrate > 0.0).then(|| (SPI_REFERENCE_HZ / bitrate).round())
}

/// Delay between SPI words; the bridge's framing depends on divider parity
pub fn word_delay_s(divider: u32) -> f64 {
    if divider % 2 == 0 {
        EVEN_WORD_DELAY_S
    } else {
        ODD_WORD_DELAY_S
    }
}

/// Find the SPI clock divider closest to `desired_rate` and the sample rate it really yields.
pub fn solve_clock_divider(desired_rate: f64, channel_count: usize) -> ClockSolution {
    let divider = raw_divider(desired_rate, channel_count)
        .map(|d| (d as u32).max(MIN_DIVIDER))
        .unwrap_or(MIN_DIVIDER);
    let spi_clock_hz = SPI_REFERENCE_HZ / divider as f64;
    let slots = (channel_count + RESERVED_SLOTS) as f64;
    let period = slots * (word_delay_s(divider) + BITS_PER_WORD / spi_clock_hz);
    ClockSolution {
        divider,
        achieved_rate_hz: 1.0 / period,
        spi_clock_hz,
    }
}

/// DSP offset removal setting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DspCutoff {
    /// 1..=15
    pub code: u8,
    pub cutoff_hz: f64,
}

impl DspCutoff {
    /// Register 4: ADC output format and DSP offset removal
    pub fn register(&self, dsp_enabled: bool) -> u8 {
        if dsp_enabled {
            0x90 + self.code
        } else {
            0x80 + self.code
        }
    }
}

/// Cutoff frequency for each code, index 0 is code 1
pub fn dsp_cutoff_candidates(sample_rate: f64) -> [f64; DSP_CODES] {
    let mut out = [0f64; DSP_CODES];
    for (i, f) in out.iter_mut().enumerate() {
        let x = 2f64.powi(i as i32 + 1);
        *f = sample_rate * (x / (x - 1.0)).ln() / (2.0 * PI);
    }
    out
}

/// Pick the DSP code whose cutoff is nearest `requested_hz` on a log scale
pub fn select_dsp_cutoff(requested_hz: f64, sample_rate: f64) -> DspCutoff {
    let candidates = dsp_cutoff_candidates(sample_rate);
    let idx = if requested_hz >= candidates[0] {
        0
    } else if requested_hz <= candidates[DSP_CODES - 1] {
        DSP_CODES - 1
    } else {
        let target = requested_hz.log10();
        let mut best = 0;
        let mut best_diff = f64::INFINITY;
        for (i, f) in candidates.iter().enumerate() {
            let diff = (target - f.log10()).abs();
            // Strict so the lowest code wins a tie
            if diff < best_diff {
                best_diff = diff;
                best = i;
            }
        }
        best
    };
    DspCutoff {
        code: idx as u8 + 1,
        cutoff_hz: candidates[idx],
    }
}

fn nearest_corner(table: &[f64], hz: f64) -> usize {
    let target = hz.log10();
    let mut best = 0;
    let mut best_diff = f64::INFINITY;
    for (i, corner) in table.iter().enumerate() {
        let diff = (target - corner.log10()).abs();
        if diff < best_diff {
            best_diff = diff;
            best = i;
        }
    }
    best
}

/// Index into [`UPPER_CORNERS_HZ`] of the supported corner nearest `hz`
pub fn upper_corner_index(hz: f64) -> usize {
    nearest_corner(&UPPER_CORNERS_HZ, hz)
}

/// Index into [`LOWER_CORNERS_HZ`] of the supported corner nearest `hz`
pub fn lower_corner_index(hz: f64) -> usize {
    nearest_corner(&LOWER_CORNERS_HZ, hz)
}

/// Registers 8 through 13. Indices out of range clamp to the last table entry.
pub fn bandwidth_codes(upper_index: usize, lower_index: usize, aux_enabled: bool) -> [u8; 6] {
    let up = upper_index.min(UPPER_CORNERS_HZ.len() - 1);
    let lo = lower_index.min(LOWER_CORNERS_HZ.len() - 1);
    let aux = if aux_enabled { AUX_SEQUENCE_BIT } else { 0 };
    [
        UPPER_RH1_DAC1[up],
        aux | UPPER_RH1_DAC2[up],
        UPPER_RH2_DAC1[up],
        aux | UPPER_RH2_DAC2[up],
        LOWER_DAC1[lo],
        aux | LOWER_DAC2[lo],
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasCodes {
    pub mux_bias: u8,
    pub adc_buffer_bias: u8,
}

impl BiasCodes {
    /// Register 1, with the supply sensor enabled
    pub fn register1(&self) -> u8 {
        VDD_SENSE_BIT | self.adc_buffer_bias
    }

    /// Register 2
    pub fn register2(&self) -> u8 {
        self.mux_bias
    }
}

/// MUX and ADC buffer bias currents for the achieved sample rate
pub fn bias_codes(sample_rate: f64) -> BiasCodes {
    let (mux_bias, adc_buffer_bias) = BIAS_STEPS
        .iter()
        .find(|(below, _, _)| sample_rate < *below)
        .map(|&(_, mux, adc)| (mux, adc))
        .unwrap_or(DEFAULT_BIAS);
    BiasCodes {
        mux_bias,
        adc_buffer_bias,
    }
}

/// Contiguous window of enabled amplifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    /// Callers guarantee `start + count - 1 <= 32`
    pub fn new(count: usize, start: usize) -> Self {
        let ones = (1u64 << count) - 1;
        Self((ones << (start - 1)) as u32)
    }

    /// Recover `(count, start)` from the mask's bit positions
    pub fn window(&self) -> (usize, usize) {
        (
            self.0.count_ones() as usize,
            self.0.trailing_zeros() as usize + 1,
        )
    }

    /// Amplifier power registers 14 through 17
    pub fn power_registers(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Mask as the bridge expects it. The trailing 6 keeps the aux slots in its sequence.
    pub fn token_value(&self) -> String {
        format!("{:X} 6", self.0)
    }
}

pub const REGISTER_COUNT: usize = 18;

/// Registers 0 through 17 of the amplifier chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterImage(pub [u8; REGISTER_COUNT]);

impl Default for RegisterImage {
    fn default() -> Self {
        Self([
            0xDE, // ADC configuration and amplifier fast settle
            0x02, // supply sensor and ADC buffer bias
            0x04, // MUX bias
            0x02, // MUX load, temperature sensor, aux digital output
            0x9C, // ADC output format and DSP offset removal
            0x00, 0x00, 0x00, // impedance check
            0x16, 0x00, 0x17, 0x00, 0x10, 0x7C, // bandwidth DACs
            0xFF, 0xFF, 0xFF, 0xFF, // amplifier power
        ])
    }
}

impl RegisterImage {
    /// Two lowercase hex digits per register plus the zero padding the bridge wants
    pub fn to_hex(&self) -> String {
        let mut s: String = self.0.iter().map(|r| format!("{:02x}", r)).collect();
        s.push_str("00000000");
        s
    }
}

/// Everything the device needs, derived once per commit
#[derive(Debug, Clone, PartialEq)]
pub struct FrontEndConfig {
    pub achieved_sample_rate_hz: f64,
    pub spi_clock_divider: u32,
    pub spi_clock_hz: f64,
    pub registers: RegisterImage,
    pub channel_mask: ChannelMask,
    pub dsp_cutoff: DspCutoff,
    pub upper_corner_index: usize,
    pub lower_corner_index: usize,
}

impl FrontEndConfig {
    /// Solve the register image. Total over validated intents.
    pub fn solve(intent: &DeviceIntent) -> Self {
        let clock = solve_clock_divider(intent.desired_sample_rate_hz, intent.channel_count);
        let rate = clock.achieved_rate_hz;
        let bias = bias_codes(rate);
        let dsp_cutoff = select_dsp_cutoff(intent.dsp_cutoff_hz, rate);
        let upper_corner_index = upper_corner_index(intent.upper_bandwidth_hz);
        let lower_corner_index = lower_corner_index(intent.lower_bandwidth_hz);
        let channel_mask = ChannelMask::new(intent.channel_count, intent.channel_start);

        let mut registers = RegisterImage::default();
        let regs = &mut registers.0;
        regs[1] = bias.register1();
        regs[2] = bias.register2();
        regs[4] = dsp_cutoff.register(intent.dsp_enabled);
        regs[8..14].copy_from_slice(&bandwidth_codes(
            upper_corner_index,
            lower_corner_index,
            intent.aux_enabled,
        ));
        regs[14..18].copy_from_slice(&channel_mask.power_registers());

        Self {
            achieved_sample_rate_hz: rate,
            spi_clock_divider: clock.divider,
            spi_clock_hz: clock.spi_clock_hz,
            registers,
            channel_mask,
            dsp_cutoff,
            upper_corner_index,
            lower_corner_index,
        }
    }
}
