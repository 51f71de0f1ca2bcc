//! Outbound commands and their frame encodings.
//!
//! # Dim frames
//!
//! ```text
//! short  [addr, 0x08, 0x1D, 0x00, rampHi, rampLo, 0x00, level, ch, level]
//! long   [addr, 0x0B, 0x20, 0x01, 0x08, 0x1D, 0x00, rampHi, rampLo, 0x00, level, ch, level]
//! ```
//!
//! The ramp time is carried big-endian in milliseconds. The level appears
//! twice: once as the generic payload byte and once after the channel.

use bytes::{BufMut, Bytes, BytesMut};

use crestbus_core::protocol::{DIM, DIM_U};

/// Length byte of the short dim body.
const SHORT_DIM_LEN: u8 = 0x08;
/// Length byte of the long dim body.
const LONG_DIM_LEN: u8 = 0x0B;
/// Sub-address selecting the dimmer block inside a universal dimmer.
const DIM_U_BLOCK: u8 = 0x01;

/// Frame layout of a dim command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimVariant {
    /// 8-channel dimmers.
    Short,
    /// Universal dimmers: the short body behind a sub-address prefix.
    Long,
}

/// A dimmer level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimCommand {
    pub address: u8,
    pub channel: u8,
    pub level: u8,
    pub ramp_ms: u16,
    pub variant: DimVariant,
}

impl DimCommand {
    pub fn short(address: u8, channel: u8, level: u8, ramp_ms: u16) -> Self {
        DimCommand {
            address,
            channel,
            level,
            ramp_ms,
            variant: DimVariant::Short,
        }
    }

    pub fn long(address: u8, channel: u8, level: u8, ramp_ms: u16) -> Self {
        DimCommand {
            variant: DimVariant::Long,
            ..Self::short(address, channel, level, ramp_ms)
        }
    }

    /// Encode the command into its wire frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(13);
        buf.put_u8(self.address);
        if self.variant == DimVariant::Long {
            buf.put_u8(LONG_DIM_LEN);
            buf.put_u8(DIM_U);
            buf.put_u8(DIM_U_BLOCK);
        }
        buf.put_u8(SHORT_DIM_LEN);
        buf.put_u8(DIM);
        buf.put_u8(0x00);
        buf.put_u16(self.ramp_ms);
        buf.put_u8(0x00);
        buf.put_u8(self.level);
        buf.put_u8(self.channel);
        buf.put_u8(self.level);
        buf.freeze()
    }
}

/// One unit of work for the master's command consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Poll a slave.
    Ping(u8),
    Dim(DimCommand),
    /// Send the next step of the slave's configuration sequence.
    ConfigStep(u8),
    /// Emit a bus-recovery break.
    Break,
}
