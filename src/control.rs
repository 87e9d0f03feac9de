//! Talking to the bridge board's control interface.
//!
//! The bridge takes plain `key=value` tokens over a request/response transport
//! and publishes a status page. The transport itself lives behind
//! [`ControlChannel`]; this module only decides what to send and how to read
//! what comes back.

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    buffers::StreamLayout,
    solver::{ChannelMask, ConfigError, DeviceIntent, FrontEndConfig, RegisterImage},
    telemetry::BatteryStatus,
};

const STREAM_KEY: &str = "__SL_P_ULD";
const HOST_KEY: &str = "__SL_P_UUU";
const PA_KEY: &str = "__SL_P_UPA";
const MASK_KEY: &str = "__SL_P_U00";
const BITRATE_KEY: &str = "__SL_P_URB";
const REGISTER_KEY: &str = "__SL_P_UII";

/// Status page battery reading is off by the divider tolerance
const STATUS_BATTERY_CORRECTION: f32 = 0.995;
/// "INTAN" as the chip returns it over SPI
const CHIP_SIGNATURE: &str = "0049004e00540041004e";
/// Consecutive failed polls before the device counts as lost
pub const LOST_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("status page does not identify a bridge board")]
    NotBridge,
    #[error("status page field '{0}' is malformed")]
    MalformedStatus(&'static str),
    #[error("amplifier chip not found behind the bridge")]
    ChipMissing,
    #[error("{requested} channels requested but the headstage has {max}")]
    TooManyChannels { requested: usize, max: usize },
    #[error("{0}, too low to stream")]
    Battery(BatteryStatus),
    #[error("device {device} and host {host} are not on the same network")]
    NetworkMismatch { device: Ipv4Addr, host: Ipv4Addr },
    #[error("no configuration has been committed")]
    NotConfigured,
    #[error("device stopped answering after {0} polls")]
    Lost(u32),
}

/// Request/response transport to the bridge
pub trait ControlChannel {
    /// Deliver one `key=value` token
    fn post(&mut self, token: &str) -> Result<(), ControlError>;
    /// Fetch the status page, `None` if this channel cannot read it
    fn status_page(&mut self) -> Result<Option<String>, ControlError>;
}

/// Channel that only logs what it would send. Useful when the bridge is driven
/// by another tool and we just want to listen.
#[derive(Debug, Default)]
pub struct LoggingChannel {
    pub sent: Vec<String>,
}

impl ControlChannel for LoggingChannel {
    fn post(&mut self, token: &str) -> Result<(), ControlError> {
        info!(token, "Control token");
        self.sent.push(token.to_owned());
        Ok(())
    }

    fn status_page(&mut self) -> Result<Option<String>, ControlError> {
        Ok(None)
    }
}

pub fn stream_token(on: bool) -> String {
    format!("{}={}", STREAM_KEY, if on { "ON" } else { "OFF" })
}

pub fn host_token(host: SocketAddrV4) -> String {
    format!("{}={}", HOST_KEY, host)
}

pub fn pa_token(attenuation: u8) -> String {
    format!("{}={}", PA_KEY, attenuation)
}

pub fn mask_token(mask: ChannelMask) -> String {
    format!("{}={}", MASK_KEY, mask.token_value())
}

/// The bridge takes whole hertz
pub fn bitrate_token(spi_clock_hz: f64) -> String {
    format!("{}={}", BITRATE_KEY, spi_clock_hz as u32)
}

pub fn register_token(image: &RegisterImage) -> String {
    format!("{}={}", REGISTER_KEY, image.to_hex())
}

/// Tokens for one configuration, in the order the bridge expects them
pub fn configuration_tokens(
    intent: &DeviceIntent,
    config: &FrontEndConfig,
    host: SocketAddrV4,
) -> Vec<String> {
    vec![
        host_token(host),
        pa_token(intent.pa_attenuation),
        mask_token(config.channel_mask),
        bitrate_token(config.spi_clock_hz),
        register_token(&config.registers),
    ]
}

/// Bridge and host must sit on the same /24 to reach each other
pub fn same_network(device: Ipv4Addr, host: Ipv4Addr) -> bool {
    device.octets()[..3] == host.octets()[..3]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChipKind {
    Rhd2132,
    Rhd2216,
    Other(String),
}

impl ChipKind {
    pub fn max_channels(&self) -> Option<usize> {
        match self {
            ChipKind::Rhd2132 => Some(32),
            ChipKind::Rhd2216 => Some(16),
            ChipKind::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub kind: ChipKind,
    pub die_revision: String,
    pub unipolar: bool,
    pub amplifiers: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub battery: BatteryStatus,
    pub chip: Option<ChipInfo>,
}

fn field<'a>(line: Option<&&'a str>, range: std::ops::Range<usize>) -> Option<&'a str> {
    line.and_then(|l| l.get(range))
}

/// Parse the bridge's status page
pub fn parse_status_page(page: &str) -> Result<DeviceStatus, ControlError> {
    let lines: Vec<&str> = page.lines().collect();
    if lines.first() != Some(&"Status code: 200") || lines.get(6) != Some(&"Unknown Token") {
        return Err(ControlError::NotBridge);
    }
    let volts: f32 = field(lines.get(8), 11..15)
        .and_then(|s| s.trim().parse().ok())
        .ok_or(ControlError::MalformedStatus("battery"))?;
    let battery = BatteryStatus::classify(STATUS_BATTERY_CORRECTION * volts);

    let regs = lines.get(12);
    let chip = if field(regs, 8..28) == Some(CHIP_SIGNATURE) {
        let kind = match field(regs, 42..44) {
            Some("01") => ChipKind::Rhd2132,
            Some("02") => ChipKind::Rhd2216,
            other => ChipKind::Other(other.unwrap_or_default().to_owned()),
        };
        let amplifiers = field(regs, 38..40)
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .ok_or(ControlError::MalformedStatus("amplifier count"))?;
        Some(ChipInfo {
            kind,
            die_revision: field(regs, 30..32).unwrap_or_default().to_owned(),
            unipolar: field(regs, 34..36) == Some("01"),
            amplifiers,
        })
    } else {
        None
    };
    Ok(DeviceStatus { battery, chip })
}

impl DeviceStatus {
    /// Check the headstage can run `intent`. Battery is checked at stream start.
    pub fn check(&self, intent: &DeviceIntent, require_chip: bool) -> Result<(), ControlError> {
        match &self.chip {
            None if require_chip => Err(ControlError::ChipMissing),
            None => {
                warn!("Amplifier chip not detected, continuing without it");
                Ok(())
            }
            Some(chip) => match chip.kind.max_channels() {
                Some(max) if intent.channel_count > max => Err(ControlError::TooManyChannels {
                    requested: intent.channel_count,
                    max,
                }),
                _ => Ok(()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Alive,
    Unresponsive(u32),
    Lost,
}

/// Counts consecutive failed status polls while idle
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceWatchdog {
    failures: u32,
}

impl DeviceWatchdog {
    pub fn record(&mut self, alive: bool) -> DeviceHealth {
        if alive {
            self.failures = 0;
            return DeviceHealth::Alive;
        }
        self.failures += 1;
        if self.failures >= LOST_AFTER_FAILURES {
            self.failures = 0;
            DeviceHealth::Lost
        } else {
            DeviceHealth::Unresponsive(self.failures)
        }
    }
}

/// A configuration the device accepted. Immutable; the capture session gets a copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub intent: DeviceIntent,
    pub config: FrontEndConfig,
    pub layout: StreamLayout,
}

/// Device-side state machine: configure, start, stop, poll
pub struct Device<C: ControlChannel> {
    channel: C,
    host: SocketAddrV4,
    require_chip: bool,
    commit: Option<Commit>,
    status: Option<DeviceStatus>,
    /// Latest battery reading, from the status page or the stream
    last_battery: Option<BatteryStatus>,
    watchdog: DeviceWatchdog,
}

impl<C: ControlChannel> Device<C> {
    pub fn new(channel: C, host: SocketAddrV4, require_chip: bool) -> Self {
        Self {
            channel,
            host,
            require_chip,
            commit: None,
            status: None,
            last_battery: None,
            watchdog: DeviceWatchdog::default(),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn commit(&self) -> Option<&Commit> {
        self.commit.as_ref()
    }

    pub fn status(&self) -> Option<&DeviceStatus> {
        self.status.as_ref()
    }

    pub fn last_battery(&self) -> Option<BatteryStatus> {
        self.last_battery
    }

    fn refresh_status(&mut self) -> Result<Option<&DeviceStatus>, ControlError> {
        self.status = match self.channel.status_page()? {
            Some(page) => Some(parse_status_page(&page)?),
            None => None,
        };
        if let Some(status) = &self.status {
            self.last_battery = Some(status.battery);
        }
        Ok(self.status.as_ref())
    }

    /// Solve `intent` and push it to the device. Any failure leaves nothing committed.
    pub fn configure(&mut self, intent: DeviceIntent) -> Result<&Commit, ControlError> {
        self.commit = None;
        let config = intent.solve()?;
        let layout = StreamLayout::for_channels(intent.channel_count, intent.aux_enabled)
            .ok_or(ConfigError::ChannelCount(intent.channel_count))?;
        let require_chip = self.require_chip;
        match self.refresh_status()? {
            Some(status) => {
                status.check(&intent, require_chip)?;
                if status.battery.can_stream() {
                    info!(battery = %status.battery, "Bridge found");
                } else {
                    warn!(battery = %status.battery, "Bridge found, battery too low to stream");
                }
            }
            None => debug!("Control channel has no status page, skipping device checks"),
        }
        for token in configuration_tokens(&intent, &config, self.host) {
            self.channel.post(&token)?;
        }
        info!(
            rate = config.achieved_sample_rate_hz,
            divider = config.spi_clock_divider,
            mask = %format!("{:08X}", config.channel_mask.0),
            registers = %config.registers.to_hex(),
            "Configuration committed"
        );
        self.watchdog = DeviceWatchdog::default();
        let commit = self.commit.insert(Commit {
            intent,
            config,
            layout,
        });
        Ok(&*commit)
    }

    /// Ask the bridge to start streaming the committed configuration
    pub fn start_stream(&mut self) -> Result<Commit, ControlError> {
        let commit = self.commit.clone().ok_or(ControlError::NotConfigured)?;
        if let Some(battery) = self.last_battery {
            if !battery.can_stream() {
                return Err(ControlError::Battery(battery));
            }
        }
        self.channel.post(&stream_token(true))?;
        Ok(commit)
    }

    pub fn stop_stream(&mut self) -> Result<(), ControlError> {
        self.channel.post(&stream_token(false))
    }

    /// Periodic liveness check while idle. Losing the device drops the commit.
    pub fn poll(&mut self) -> Result<DeviceHealth, ControlError> {
        let alive = match self.refresh_status() {
            Ok(_) => true,
            Err(e) => {
                warn!("Status poll failed: {}", e);
                false
            }
        };
        let health = self.watchdog.record(alive);
        if health == DeviceHealth::Lost {
            self.commit = None;
            return Err(ControlError::Lost(LOST_AFTER_FAILURES));
        }
        Ok(health)
    }

    /// Battery from the streamed packets, used to gate the next stream start
    pub fn update_battery(&mut self, battery: BatteryStatus) {
        self.last_battery = Some(battery);
        if let Some(status) = &mut self.status {
            status.battery = battery;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::BatteryLevel;

    fn status_page(battery: &str, chip_id: &str) -> String {
        [
            "Status code: 200",
            "Response headers: ",
            "Server: bridge",
            "Content-Type: text/html",
            "",
            "----",
            "Unknown Token",
            "",
            &format!("Battery V: {} V", battery),
            "",
            "",
            "",
            &format!("Regs 40:0049004e00540041004e, 00, 00, 20, {}", chip_id),
        ]
        .join("\n")
    }

    struct FakeChannel {
        sent: Vec<String>,
        page: Option<String>,
        fail_page: bool,
        fail_after: Option<usize>,
    }

    impl FakeChannel {
        fn new(page: Option<String>) -> Self {
            Self {
                sent: vec![],
                page,
                fail_page: false,
                fail_after: None,
            }
        }
    }

    impl ControlChannel for FakeChannel {
        fn post(&mut self, token: &str) -> Result<(), ControlError> {
            if self.fail_after == Some(self.sent.len()) {
                return Err(ControlError::Unreachable("timed out".into()));
            }
            self.sent.push(token.to_owned());
            Ok(())
        }

        fn status_page(&mut self) -> Result<Option<String>, ControlError> {
            if self.fail_page {
                return Err(ControlError::Unreachable("timed out".into()));
            }
            Ok(self.page.clone())
        }
    }

    fn host() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 102), 51234)
    }

    #[test]
    fn test_tokens() {
        let intent = DeviceIntent::default();
        let config = intent.solve().unwrap();
        let tokens = configuration_tokens(&intent, &config, host());
        assert_eq!(
            tokens,
            vec![
                "__SL_P_UUU=192.168.0.102:51234",
                "__SL_P_UPA=4",
                "__SL_P_U00=FFFFFFFF 6",
                "__SL_P_URB=13333333",
                "__SL_P_UII=de4204029c00000016001700107cffffffff00000000",
            ]
        );
        assert_eq!(stream_token(true), "__SL_P_ULD=ON");
        assert_eq!(stream_token(false), "__SL_P_ULD=OFF");
    }

    #[test]
    fn test_parse_status_page() {
        let status = parse_status_page(&status_page("3.85", "01")).unwrap();
        assert!((status.battery.volts - 3.83075).abs() < 1e-4);
        assert_eq!(status.battery.level, BatteryLevel::Ok);
        let chip = status.chip.unwrap();
        assert_eq!(chip.kind, ChipKind::Rhd2132);
        assert_eq!(chip.amplifiers, 32);
        assert!(!chip.unipolar);
    }

    #[test]
    fn test_parse_status_rejects_other_pages() {
        assert!(matches!(
            parse_status_page("Failed to connect!"),
            Err(ControlError::NotBridge)
        ));
        let page = status_page("x.yz", "01");
        assert!(matches!(
            parse_status_page(&page),
            Err(ControlError::MalformedStatus("battery"))
        ));
    }

    #[test]
    fn test_status_without_chip() {
        let page = status_page("3.85", "01").replace("0049004e", "00000000");
        let status = parse_status_page(&page).unwrap();
        assert!(status.chip.is_none());
        let intent = DeviceIntent::default();
        assert!(status.check(&intent, false).is_ok());
        assert!(matches!(
            status.check(&intent, true),
            Err(ControlError::ChipMissing)
        ));
    }

    #[test]
    fn test_small_chip_limits_channels() {
        let status = parse_status_page(&status_page("3.85", "02")).unwrap();
        let intent = DeviceIntent::default();
        assert!(matches!(
            status.check(&intent, false),
            Err(ControlError::TooManyChannels {
                requested: 32,
                max: 16
            })
        ));
    }

    #[test]
    fn test_configure_and_start() {
        let channel = FakeChannel::new(Some(status_page("3.85", "01")));
        let mut device = Device::new(channel, host(), false);
        assert!(matches!(
            device.start_stream(),
            Err(ControlError::NotConfigured)
        ));
        let commit = device.configure(DeviceIntent::default()).unwrap();
        assert_eq!(commit.layout.samples_per_packet, 21);
        let commit = device.start_stream().unwrap();
        assert_eq!(commit.config.spi_clock_divider, 3);
        assert_eq!(device.channel().sent.len(), 6);
        assert_eq!(device.channel().sent[5], "__SL_P_ULD=ON");
    }

    #[test]
    fn test_low_battery_blocks_start_only() {
        let channel = FakeChannel::new(Some(status_page("3.40", "01")));
        let mut device = Device::new(channel, host(), false);
        device.configure(DeviceIntent::default()).unwrap();
        assert_eq!(device.last_battery().unwrap().level, BatteryLevel::Fail);
        assert!(matches!(
            device.start_stream(),
            Err(ControlError::Battery(_))
        ));
        assert_eq!(device.channel().sent.len(), 5);
    }

    #[test]
    fn test_streamed_battery_gates_start() {
        let mut device = Device::new(LoggingChannel::default(), host(), false);
        device.configure(DeviceIntent::default()).unwrap();
        assert!(device.last_battery().is_none());
        device.update_battery(BatteryStatus::classify(3.2));
        assert!(matches!(
            device.start_stream(),
            Err(ControlError::Battery(b)) if b.level == BatteryLevel::Fail
        ));
        assert!(!device.channel().sent.iter().any(|t| t == "__SL_P_ULD=ON"));

        // a charged reading lets the stream start again
        device.update_battery(BatteryStatus::classify(3.9));
        assert!(device.start_stream().is_ok());
        assert_eq!(device.channel().sent.last().unwrap(), "__SL_P_ULD=ON");
    }

    #[test]
    fn test_failed_token_leaves_nothing_committed() {
        let mut channel = FakeChannel::new(None);
        channel.fail_after = Some(2);
        let mut device = Device::new(channel, host(), false);
        assert!(matches!(
            device.configure(DeviceIntent::default()),
            Err(ControlError::Unreachable(_))
        ));
        assert!(device.commit().is_none());
    }

    #[test]
    fn test_invalid_intent_sends_nothing() {
        let mut device = Device::new(LoggingChannel::default(), host(), false);
        let intent = DeviceIntent {
            channel_start: 5,
            ..Default::default()
        };
        assert!(matches!(
            device.configure(intent),
            Err(ControlError::Config(ConfigError::ChannelWindow { .. }))
        ));
        assert!(device.channel().sent.is_empty());
    }

    #[test]
    fn test_watchdog_loses_device() {
        let mut channel = FakeChannel::new(None);
        channel.fail_page = true;
        let mut device = Device::new(channel, host(), false);
        device.commit = Some(Commit {
            intent: DeviceIntent::default(),
            config: DeviceIntent::default().solve().unwrap(),
            layout: StreamLayout::for_channels(32, false).unwrap(),
        });
        assert_eq!(device.poll().unwrap(), DeviceHealth::Unresponsive(1));
        assert_eq!(device.poll().unwrap(), DeviceHealth::Unresponsive(2));
        assert!(matches!(device.poll(), Err(ControlError::Lost(3))));
        assert!(device.commit().is_none());
    }

    #[test]
    fn test_watchdog_recovers() {
        let mut dog = DeviceWatchdog::default();
        dog.record(false);
        dog.record(false);
        assert_eq!(dog.record(true), DeviceHealth::Alive);
        assert_eq!(dog.record(false), DeviceHealth::Unresponsive(1));
    }

    #[test]
    fn test_same_network() {
        let host = Ipv4Addr::new(192, 168, 0, 102);
        assert!(same_network(Ipv4Addr::new(192, 168, 0, 93), host));
        assert!(!same_network(Ipv4Addr::new(192, 168, 1, 93), host));
    }
}
