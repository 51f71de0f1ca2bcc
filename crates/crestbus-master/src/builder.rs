//! MasterBuilder -- fluent builder for constructing [`BusMaster`] instances.
//!
//! Collects the serial parameters, the polling schedule and the initial
//! slave population, then opens the port and starts the master.
//!
//! # Example
//!
//! ```no_run
//! use crestbus_core::DeviceType;
//! use crestbus_master::MasterBuilder;
//!
//! # async fn example() -> crestbus_core::Result<()> {
//! let master = MasterBuilder::new()
//!     .serial_port("/dev/ttyUSB0")
//!     .default_slave(DeviceType::Dim8)
//!     .default_slave(DeviceType::Io48)
//!     .polling(true)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use crestbus_core::error::{Error, Result};
use crestbus_core::port::BusPort;
use crestbus_core::types::DeviceType;
use crestbus_transport::{HalfDuplexTransport, SerialBus, SerialConfig, TransportConfig};

use crate::master::{BusMaster, MasterTiming};
use crate::registry::{RegistryConfig, SlaveRegistry};

/// Fluent builder for [`BusMaster`].
pub struct MasterBuilder {
    serial_port: Option<String>,
    serial: SerialConfig,
    transport: TransportConfig,
    timing: MasterTiming,
    registry: RegistryConfig,
    slaves: Vec<(u8, DeviceType)>,
    polling: bool,
    event_capacity: usize,
}

impl Default for MasterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterBuilder {
    pub fn new() -> Self {
        MasterBuilder {
            serial_port: None,
            serial: SerialConfig::master(),
            transport: TransportConfig::default(),
            timing: MasterTiming::default(),
            registry: RegistryConfig::default(),
            slaves: Vec::new(),
            polling: false,
            event_capacity: 64,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the line rate (default: 38400).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.serial.baud_rate = baud;
        self
    }

    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }

    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    pub fn timing(mut self, timing: MasterTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Period of the round-robin polling tick (default: 23ms).
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.timing.ping_interval = interval;
        self
    }

    /// How long a slave has to answer a ping (default: 4ms).
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.registry.ping_timeout = timeout;
        self
    }

    /// Consecutive failures after which a slave is parked in the `Error`
    /// state (default: 255).
    pub fn max_errors(mut self, max: u8) -> Self {
        self.registry.max_errors = max;
        self
    }

    /// Register a slave at `address`.
    pub fn slave(mut self, address: u8, device_type: DeviceType) -> Self {
        self.slaves.push((address, device_type));
        self
    }

    /// Register a slave at its device type's default address.
    pub fn default_slave(self, device_type: DeviceType) -> Self {
        let address = device_type.default_address();
        self.slave(address, device_type)
    }

    /// Start polling as soon as the master is built (default: off).
    pub fn polling(mut self, enabled: bool) -> Self {
        self.polling = enabled;
        self
    }

    /// Number of events a lagging subscriber may fall behind by.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build and start a [`BusMaster`] over a caller-provided port.
    ///
    /// This is the entry point for tests (pass a `MockBus` from
    /// `crestbus-test-harness`).
    pub async fn build_with_port(self, port: Box<dyn BusPort>) -> Result<BusMaster> {
        if self.registry.ping_timeout >= self.timing.ping_interval {
            return Err(Error::InvalidParameter(
                "ping_timeout must be shorter than ping_interval".into(),
            ));
        }
        if self.registry.max_errors == 0 {
            return Err(Error::InvalidParameter("max_errors must be at least 1".into()));
        }
        if self.event_capacity == 0 || self.timing.queue_capacity == 0 {
            return Err(Error::InvalidParameter(
                "event and queue capacities must be non-zero".into(),
            ));
        }

        let mut registry = SlaveRegistry::new(self.registry);
        for (address, device_type) in self.slaves {
            registry.add_slave(address, device_type);
        }

        let transport = HalfDuplexTransport::new(port, self.transport);
        let master = BusMaster::new(transport, registry, self.timing, self.event_capacity);
        master.enable_polling(self.polling);
        master.initialize()?;
        Ok(master)
    }

    /// Open the serial port and build a [`BusMaster`] over it.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn build(self) -> Result<BusMaster> {
        let port = self
            .serial_port
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;
        let bus = SerialBus::open(port, self.serial.clone()).await?;
        self.build_with_port(Box::new(bus)).await
    }
}
