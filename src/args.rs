//! Argument parsing for running from the command line

use std::{net::Ipv4Addr, path::PathBuf};

use clap::Parser;

use crate::{solver::DeviceIntent, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// IP address of the bridge board
    #[clap(short, long)]
    pub device_ip: Ipv4Addr,
    /// IP address of this host, where the bridge should stream to
    #[clap(long)]
    pub host_ip: Ipv4Addr,
    /// Port to capture UDP data from
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    #[clap(value_parser = clap::value_parser!(u16).range(49152..=65535))]
    pub port: u16,
    /// Number of amplifier channels to stream (multiple of 4, up to 32)
    #[clap(short, long, default_value_t = crate::DEFAULT_CHANNELS)]
    pub channels: usize,
    /// First enabled amplifier, 1-based
    #[clap(long, default_value_t = 1)]
    pub start: usize,
    /// Requested sample rate in Hz
    #[clap(short, long, default_value_t = 20000.0)]
    pub rate: f64,
    /// Amplifier low-pass corner in Hz
    #[clap(long, default_value_t = 7500.0)]
    pub upper_hz: f64,
    /// Amplifier high-pass corner in Hz
    #[clap(long, default_value_t = 0.1)]
    pub lower_hz: f64,
    /// On-chip DSP high-pass cutoff in Hz
    #[clap(long, default_value_t = 1.0)]
    pub dsp_cutoff: f64,
    /// Disable the on-chip DSP high-pass filter
    #[clap(long)]
    pub dsp_off: bool,
    /// Stream the three aux inputs after the electrodes
    #[clap(long)]
    pub aux: bool,
    /// Radio power amplifier attenuation step
    #[clap(long, default_value_t = 4)]
    #[clap(value_parser = clap::value_parser!(u8).range(0..=15))]
    pub pa: u8,
    /// Refuse to stream unless the amplifier chip answers
    #[clap(long)]
    pub require_chip: bool,
    /// Write converted blocks as raw f32 into this directory
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// Ring buffer capacity, in blocks
    #[clap(long, default_value_t = 1024)]
    pub capacity: usize,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn intent(&self) -> DeviceIntent {
        DeviceIntent {
            desired_sample_rate_hz: self.rate,
            channel_count: self.channels,
            channel_start: self.start,
            lower_bandwidth_hz: self.lower_hz,
            upper_bandwidth_hz: self.upper_hz,
            dsp_cutoff_hz: self.dsp_cutoff,
            dsp_enabled: !self.dsp_off,
            aux_enabled: self.aux,
            pa_attenuation: self.pa,
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
