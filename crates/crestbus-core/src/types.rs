//! Core types shared by the master and slave sides of the bus.

use std::fmt;
use std::str::FromStr;

/// Family of a slave device.
///
/// The device type selects the configuration template the master runs when
/// the device is configured, and which dim frame layout it understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// 48-channel I/O module.
    Io48,
    /// 8-channel dimmer (short dim frames).
    Dim8,
    /// 8-channel universal dimmer (long dim frames).
    DimU8,
}

impl DeviceType {
    /// Address the device answers to in the reference installation.
    pub fn default_address(&self) -> u8 {
        match self {
            DeviceType::Io48 => 0x11,
            DeviceType::Dim8 => 0x0B,
            DeviceType::DimU8 => 0x0C,
        }
    }

    /// Number of dimmable channels (zero for the I/O module).
    pub fn channel_count(&self) -> u8 {
        match self {
            DeviceType::Io48 => 0,
            DeviceType::Dim8 | DeviceType::DimU8 => 8,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Io48 => "IO-48",
            DeviceType::Dim8 => "DIM8",
            DeviceType::DimU8 => "DIMU8",
        };
        write!(f, "{s}")
    }
}

/// Error returned when a string cannot be parsed into a [`DeviceType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDeviceTypeError(String);

impl fmt::Display for ParseDeviceTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown device type: {}", self.0)
    }
}

impl std::error::Error for ParseDeviceTypeError {}

impl FromStr for DeviceType {
    type Err = ParseDeviceTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "").as_str() {
            "IO48" => Ok(DeviceType::Io48),
            "DIM8" => Ok(DeviceType::Dim8),
            "DIMU8" => Ok(DeviceType::DimU8),
            _ => Err(ParseDeviceTypeError(s.to_string())),
        }
    }
}

/// Liveness/configuration state of a slave as tracked by the master.
///
/// ```text
/// Offline -> PingSent -> Online -> ConfigRequested -> Configuring -> Configured
/// ```
///
/// `Error` is reachable from any state and is terminal until the address is
/// registered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlaveState {
    #[default]
    Offline,
    PingSent,
    Online,
    ConfigRequested,
    Configuring,
    Configured,
    Error,
}

impl SlaveState {
    /// States the round-robin scheduler sends pings in.
    pub fn is_pollable(&self) -> bool {
        matches!(
            self,
            SlaveState::Offline | SlaveState::Online | SlaveState::Configured
        )
    }

    /// States reported as "online" to status readers.
    pub fn is_online(&self) -> bool {
        matches!(self, SlaveState::Online | SlaveState::Configured)
    }

    /// States that belong to a running configuration sequence.
    pub fn is_configuring(&self) -> bool {
        matches!(self, SlaveState::ConfigRequested | SlaveState::Configuring)
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlaveState::Offline => "OFFLINE",
            SlaveState::PingSent => "PING_SENT",
            SlaveState::Online => "ONLINE",
            SlaveState::ConfigRequested => "CONFIG_REQUESTED",
            SlaveState::Configuring => "CONFIGURING",
            SlaveState::Configured => "CONFIGURED",
            SlaveState::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// One step of a device configuration sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ConfigStep {
    #[default]
    None,
    InitSync,
    TimeSync,
    ChannelConfig,
    LoadConfig,
    Finalize,
    Complete,
}

impl fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigStep::None => "NONE",
            ConfigStep::InitSync => "INIT_SYNC",
            ConfigStep::TimeSync => "TIME_SYNC",
            ConfigStep::ChannelConfig => "CHANNEL_CONFIG",
            ConfigStep::LoadConfig => "LOAD_CONFIG",
            ConfigStep::Finalize => "FINALIZE",
            ConfigStep::Complete => "COMPLETE",
        };
        write!(f, "{s}")
    }
}

/// State of the single device emulated on the slave side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Offline,
    Online,
    ProcessingCommand,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Offline => "OFFLINE",
            DeviceState::Online => "ONLINE",
            DeviceState::ProcessingCommand => "PROCESSING",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a transport's monotonic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    /// Frames written completely to the bus.
    pub transmitted: u64,
    /// Inbound frames accepted into the receive queue.
    pub received: u64,
    /// Dropped frames, short writes, lock and queue timeouts.
    pub errors: u64,
    /// Break signals emitted.
    pub breaks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_parse_and_display() {
        assert_eq!("dim8".parse::<DeviceType>().unwrap(), DeviceType::Dim8);
        assert_eq!("DIMU8".parse::<DeviceType>().unwrap(), DeviceType::DimU8);
        assert_eq!("io-48".parse::<DeviceType>().unwrap(), DeviceType::Io48);
        assert!("dmx".parse::<DeviceType>().is_err());
        assert_eq!(DeviceType::Io48.to_string(), "IO-48");
    }

    #[test]
    fn device_type_default_addresses() {
        assert_eq!(DeviceType::Io48.default_address(), 0x11);
        assert_eq!(DeviceType::Dim8.default_address(), 0x0B);
        assert_eq!(DeviceType::DimU8.default_address(), 0x0C);
    }

    #[test]
    fn pollable_states() {
        assert!(SlaveState::Offline.is_pollable());
        assert!(SlaveState::Online.is_pollable());
        assert!(SlaveState::Configured.is_pollable());
        assert!(!SlaveState::PingSent.is_pollable());
        assert!(!SlaveState::ConfigRequested.is_pollable());
        assert!(!SlaveState::Configuring.is_pollable());
        assert!(!SlaveState::Error.is_pollable());
    }

    #[test]
    fn online_states() {
        assert!(SlaveState::Online.is_online());
        assert!(SlaveState::Configured.is_online());
        assert!(!SlaveState::PingSent.is_online());
    }

    #[test]
    fn config_steps_are_ordered() {
        assert!(ConfigStep::None < ConfigStep::InitSync);
        assert!(ConfigStep::Finalize < ConfigStep::Complete);
    }

    #[test]
    fn slave_state_display() {
        assert_eq!(SlaveState::PingSent.to_string(), "PING_SENT");
        assert_eq!(SlaveState::default(), SlaveState::Offline);
    }
}
