//! Link statistics and battery readings for the operator.
//!
//! The decode thread is the only writer of [`LinkCounters`]; everyone else reads
//! relaxed snapshots of it.

use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crate::sequence::SequenceState;

/// Minimum battery voltage to start or keep streaming
pub const BATTERY_THRESHOLD_V: f32 = 3.6;
/// Margin under the threshold still reported as low instead of failed
pub const BATTERY_LOW_MARGIN_V: f32 = 0.1;

/// ADC reference and divider of the bridge's battery monitor (200k, 100k, 100k)
const BATTERY_ADC_REF_V: f32 = 1.467;
const BATTERY_ADC_COUNTS: f32 = 4096.0;
const BATTERY_DIVIDER: f32 = 40.0 / 9.75;

/// Convert the battery word of a packet header to volts
pub fn battery_volts(raw: u16) -> f32 {
    (0xfff & (raw >> 2)) as f32 * BATTERY_ADC_REF_V / BATTERY_ADC_COUNTS * BATTERY_DIVIDER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryLevel {
    Ok,
    Low,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryStatus {
    pub volts: f32,
    pub level: BatteryLevel,
}

impl BatteryStatus {
    pub fn classify(volts: f32) -> Self {
        let level = if volts > BATTERY_THRESHOLD_V {
            BatteryLevel::Ok
        } else if volts > BATTERY_THRESHOLD_V - BATTERY_LOW_MARGIN_V {
            BatteryLevel::Low
        } else {
            BatteryLevel::Fail
        };
        Self { volts, level }
    }

    pub fn can_stream(&self) -> bool {
        self.level == BatteryLevel::Ok
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            BatteryLevel::Ok => "OK",
            BatteryLevel::Low => "Low",
            BatteryLevel::Fail => "Fail",
        };
        write!(f, "Bat {:.2}V {}", self.volts, level)
    }
}

/// Counters published by the decode thread
#[derive(Debug, Default)]
pub struct LinkCounters {
    hit: AtomicU64,
    miss: AtomicU64,
    delayed: AtomicU64,
    last_sequence: AtomicU32,
    short_reads: AtomicU64,
    bad_frames: AtomicU64,
    battery_raw: AtomicU32,
}

impl LinkCounters {
    pub fn reset(&self) {
        for c in [
            &self.hit,
            &self.miss,
            &self.delayed,
            &self.short_reads,
            &self.bad_frames,
        ] {
            c.store(0, Ordering::Relaxed);
        }
        self.last_sequence.store(0, Ordering::Relaxed);
        self.battery_raw.store(0, Ordering::Relaxed);
    }

    pub fn publish(&self, state: &SequenceState, battery_raw: u16) {
        self.hit.store(state.hit_count, Ordering::Relaxed);
        self.miss.store(state.miss_count, Ordering::Relaxed);
        self.delayed.store(state.delayed_count, Ordering::Relaxed);
        self.last_sequence.store(state.last_sequence, Ordering::Relaxed);
        self.battery_raw.store(battery_raw as u32, Ordering::Relaxed);
    }

    pub fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bad_frame(&self) {
        self.bad_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            hit: self.hit.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            bad_frames: self.bad_frames.load(Ordering::Relaxed),
            battery_raw: self.battery_raw.load(Ordering::Relaxed) as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub hit: u64,
    pub miss: u64,
    pub delayed: u64,
    pub last_sequence: u32,
    pub short_reads: u64,
    pub bad_frames: u64,
    pub battery_raw: u16,
}

impl LinkSnapshot {
    /// Packet delivery ratio in percent. Sequence numbers start at 1.
    pub fn delivery_ratio(&self) -> f32 {
        if self.last_sequence == 0 {
            0.0
        } else {
            self.hit as f32 / self.last_sequence as f32 * 100.0
        }
    }

    /// `None` until a packet has reported a battery reading
    pub fn battery(&self) -> Option<BatteryStatus> {
        (self.battery_raw != 0).then(|| BatteryStatus::classify(battery_volts(self.battery_raw)))
    }
}

impl fmt::Display for LinkSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PDR {:.3}% seq {} good {} miss {} delayed {}",
            self.delivery_ratio(),
            self.last_sequence,
            self.hit,
            self.miss,
            self.delayed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_conversion() {
        // 0xA00 counts is about 3.76 V after the divider
        let v = battery_volts(0xA00 << 2);
        assert!((v - 3.7615).abs() < 1e-3, "{}", v);
        // top two bits are dropped by the 12 bit mask
        assert_eq!(battery_volts(0xC000 | (0xA00 << 2)), v);
    }

    #[test]
    fn test_battery_levels() {
        assert_eq!(BatteryStatus::classify(3.9).level, BatteryLevel::Ok);
        assert_eq!(BatteryStatus::classify(3.55).level, BatteryLevel::Low);
        assert_eq!(BatteryStatus::classify(3.6).level, BatteryLevel::Low);
        assert_eq!(BatteryStatus::classify(3.4).level, BatteryLevel::Fail);
        assert!(!BatteryStatus::classify(3.6).can_stream());
        assert_eq!(BatteryStatus::classify(3.912).to_string(), "Bat 3.91V OK");
    }

    #[test]
    fn test_counters() {
        let counters = LinkCounters::default();
        let state = SequenceState {
            hit_count: 9,
            miss_count: 1,
            last_sequence: 10,
            ..Default::default()
        };
        counters.publish(&state, 0xA00 << 2);
        counters.record_bad_frame();
        let snap = counters.snapshot();
        assert!((snap.delivery_ratio() - 90.0).abs() < 1e-4);
        assert_eq!(snap.bad_frames, 1);
        assert_eq!(snap.battery().unwrap().level, BatteryLevel::Ok);
        counters.reset();
        assert_eq!(counters.snapshot(), LinkSnapshot::default());
        assert_eq!(LinkSnapshot::default().delivery_ratio(), 0.0);
    }
}
