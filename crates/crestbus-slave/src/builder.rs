//! SlaveBuilder -- fluent builder for constructing [`BusSlave`] instances.
//!
//! # Example
//!
//! ```no_run
//! use crestbus_slave::SlaveBuilder;
//!
//! # async fn example() -> crestbus_core::Result<()> {
//! let slave = SlaveBuilder::new()
//!     .serial_port("/dev/ttyUSB1")
//!     .address(0x22)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crestbus_core::error::{Error, Result};
use crestbus_core::port::BusPort;
use crestbus_transport::{SerialBus, SerialConfig, SlaveTiming, TimedTransport};

use crate::debounce::{DebounceConfig, SwitchHandler, SwitchInput};
use crate::handler::{DEFAULT_ADDRESS, ProtocolHandler};
use crate::slave::BusSlave;

/// Fluent builder for [`BusSlave`].
pub struct SlaveBuilder {
    serial_port: Option<String>,
    serial: SerialConfig,
    address: u8,
    timing: SlaveTiming,
    switch_input: Option<Box<dyn SwitchInput>>,
    debounce: DebounceConfig,
    event_capacity: usize,
}

impl Default for SlaveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveBuilder {
    pub fn new() -> Self {
        SlaveBuilder {
            serial_port: None,
            serial: SerialConfig::slave(),
            address: DEFAULT_ADDRESS,
            timing: SlaveTiming::default(),
            switch_input: None,
            debounce: DebounceConfig::default(),
            event_capacity: 64,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.serial.baud_rate = baud;
        self
    }

    pub fn serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }

    /// Bus address the device answers to (default: 0x22).
    pub fn address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn timing(mut self, timing: SlaveTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Attach a physical switch; releases toggle the device's switch state.
    pub fn switch_input(mut self, input: Box<dyn SwitchInput>) -> Self {
        self.switch_input = Some(input);
        self
    }

    pub fn debounce(mut self, config: DebounceConfig) -> Self {
        self.debounce = config;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build and start a [`BusSlave`] over a caller-provided port.
    pub async fn build_with_port(self, port: Box<dyn BusPort>) -> Result<BusSlave> {
        if self.address == crestbus_core::protocol::TO_MASTER_PREFIX {
            return Err(Error::InvalidParameter(format!(
                "address 0x{:02X} is reserved for slave-to-master frames",
                self.address
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidParameter("event_capacity must be non-zero".into()));
        }

        let transport = TimedTransport::new(port, self.timing);
        let handler = Arc::new(ProtocolHandler::new(
            self.address,
            transport,
            self.event_capacity,
        ));
        handler.initialize()?;

        let switch = self.switch_input.map(|input| {
            SwitchHandler::spawn(input, handler.clone(), self.debounce, self.event_capacity)
        });
        Ok(BusSlave::new(handler, switch))
    }

    /// Open the serial port and build a [`BusSlave`] over it.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn build(self) -> Result<BusSlave> {
        let port = self
            .serial_port
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for build()".into()))?;
        let bus = SerialBus::open(port, self.serial.clone()).await?;
        self.build_with_port(Box::new(bus)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::ManualSwitch;
    use crestbus_core::types::DeviceState;
    use crestbus_test_harness::MockBus;
    use std::time::Duration;

    #[tokio::test]
    async fn builder_defaults() {
        let slave = SlaveBuilder::new()
            .build_with_port(Box::new(MockBus::new("mock")))
            .await
            .unwrap();
        assert_eq!(slave.address(), 0x22);
        assert!(slave.switch().is_none());
        assert!(slave.handler().is_initialized());
    }

    #[tokio::test]
    async fn builder_serial_port_required_for_build() {
        let result = SlaveBuilder::new().build().await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_rejects_reserved_address() {
        let result = SlaveBuilder::new()
            .address(0x02)
            .build_with_port(Box::new(MockBus::new("mock")))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn builder_with_switch_and_custom_address() {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let slave = SlaveBuilder::new()
            .address(0x30)
            .switch_input(Box::new(ManualSwitch::new()))
            .build_with_port(Box::new(bus))
            .await
            .unwrap();
        assert!(slave.switch().is_some());

        handle.inject(&[0x30, 0x00]);
        let reply = handle.next_written(Duration::from_millis(50)).await;
        assert_eq!(reply, Some(vec![0x02, 0x00]));

        slave.shutdown().await;
        assert_eq!(slave.handler().device_state().await, DeviceState::Offline);
    }
}
