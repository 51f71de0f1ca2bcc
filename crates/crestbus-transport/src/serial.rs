//! Serial port implementation of the bus port traits.
//!
//! [`SerialBus`] drives an RS-485 transceiver attached to a UART, typically a
//! USB adapter that presents a virtual COM port. The transceiver's
//! transmit-enable (DE/RE) pin is wired to RTS; breaks use the UART's own
//! break control.
//!
//! # Example
//!
//! ```no_run
//! use crestbus_transport::{SerialBus, SerialConfig};
//!
//! # async fn example() -> crestbus_core::Result<()> {
//! let bus = SerialBus::open("/dev/ttyUSB0", SerialConfig::master()).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crestbus_core::error::{Error, Result};
use crestbus_core::port::{BusPort, BusReader, BusWriter};
use crestbus_core::timing::BAUD_RATE;

/// Serial line settings. Data bits are always eight on this bus.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Drive RTS low to transmit, for adapters that invert DE.
    pub invert_rts: bool,
}

impl SerialConfig {
    /// Master line settings: 38400 baud, 8N2.
    pub fn master() -> Self {
        SerialConfig {
            baud_rate: BAUD_RATE,
            stop_bits: StopBits::Two,
            parity: Parity::None,
            invert_rts: false,
        }
    }

    /// Slave line settings: 38400 baud, 8N1.
    pub fn slave() -> Self {
        SerialConfig {
            stop_bits: StopBits::One,
            ..Self::master()
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::master()
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

fn line_error(port: &str, what: &str, e: tokio_serial::Error) -> Error {
    tracing::warn!(port = %port, error = %e, "{what} failed");
    Error::Transport(format!("{what} on {port}: {e}"))
}

fn io_error(port: &str, e: std::io::Error) -> Error {
    tracing::error!(port = %port, error = %e, "serial I/O failed");
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => Error::NotConnected,
        _ => Error::Io(e),
    }
}

/// An RS-485 bus on a serial port, with RTS as the direction line.
pub struct SerialBus {
    stream: SerialStream,
    control: Box<dyn SerialPort>,
    port_name: String,
    invert_rts: bool,
}

impl SerialBus {
    /// Open `port` with the given line settings and put the transceiver in
    /// receive mode.
    pub async fn open(port: &str, config: SerialConfig) -> Result<Self> {
        tracing::debug!(
            port = %port,
            baud_rate = config.baud_rate,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            "Opening serial bus"
        );

        let stream = tokio_serial::new(port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                Error::Transport(format!("failed to open serial port {port}: {e}"))
            })?;

        // The stream halves go to the reader and writer; control lines are
        // driven through a cloned handle on the same descriptor.
        let mut control = stream
            .try_clone()
            .map_err(|e| line_error(port, "clone control handle", e))?;

        control
            .write_request_to_send(config.invert_rts)
            .map_err(|e| line_error(port, "release transmit-enable", e))?;
        if let Err(e) = control.write_data_terminal_ready(false) {
            tracing::warn!(port = %port, error = %e, "Failed to de-assert DTR");
        }

        tracing::info!(port = %port, baud_rate = config.baud_rate, "Serial bus opened");

        Ok(SerialBus {
            stream,
            control,
            port_name: port.to_string(),
            invert_rts: config.invert_rts,
        })
    }
}

impl BusPort for SerialBus {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn split(self: Box<Self>) -> (Box<dyn BusReader>, Box<dyn BusWriter>) {
        let SerialBus {
            stream,
            control,
            port_name,
            invert_rts,
        } = *self;
        let (read, write) = tokio::io::split(stream);
        let reader = SerialReader {
            read,
            port_name: port_name.clone(),
        };
        let writer = SerialWriter {
            write,
            control,
            port_name,
            invert_rts,
        };
        (Box::new(reader), Box::new(writer))
    }
}

struct SerialReader {
    read: ReadHalf<SerialStream>,
    port_name: String,
}

#[async_trait]
impl BusReader for SerialReader {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match tokio::time::timeout(timeout, self.read.read(buf)).await {
            Ok(Ok(n)) => {
                tracing::trace!(port = %self.port_name, bytes = n, data = ?&buf[..n], "rx");
                Ok(n)
            }
            Ok(Err(e)) => Err(io_error(&self.port_name, e)),
            Err(_) => Err(Error::Timeout),
        }
    }
}

struct SerialWriter {
    write: WriteHalf<SerialStream>,
    control: Box<dyn SerialPort>,
    port_name: String,
    invert_rts: bool,
}

#[async_trait]
impl BusWriter for SerialWriter {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        tracing::trace!(port = %self.port_name, bytes = data.len(), data = ?data, "tx");
        self.write
            .write(data)
            .await
            .map_err(|e| io_error(&self.port_name, e))
    }

    async fn wait_tx_done(&mut self, timeout: Duration) -> Result<()> {
        // Flushing a serial stream drains the UART (tcdrain on unix).
        match tokio::time::timeout(timeout, self.write.flush()).await {
            Ok(result) => result.map_err(|e| io_error(&self.port_name, e)),
            Err(_) => Err(Error::Timeout),
        }
    }

    fn set_tx_enable(&mut self, enable: bool) -> Result<()> {
        self.control
            .write_request_to_send(enable != self.invert_rts)
            .map_err(|e| line_error(&self.port_name, "set transmit-enable", e))
    }

    fn set_break(&mut self, asserted: bool) -> Result<()> {
        let result = if asserted {
            self.control.set_break()
        } else {
            self.control.clear_break()
        };
        result.map_err(|e| line_error(&self.port_name, "set break", e))
    }
}
