//! Frames as they travel over the bus.
//!
//! A frame is whatever contiguous run of bytes was sent or received between
//! two quiet periods on the wire. There is no header, length or checksum to
//! validate, only the bounds on its size.

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Direction of a frame relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// An immutable frame with its capture or submission timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
    timestamp: Instant,
    direction: Direction,
}

impl Frame {
    /// Build a frame, rejecting empty payloads and payloads longer than `max_len`.
    pub fn new(data: &[u8], direction: Direction, max_len: usize) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::EmptyFrame);
        }
        if data.len() > max_len {
            return Err(Error::FrameTooLong {
                len: data.len(),
                max: max_len,
            });
        }
        Ok(Frame {
            bytes: Bytes::copy_from_slice(data),
            timestamp: Instant::now(),
            direction,
        })
    }

    /// Raw frame bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes in the frame.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`: empty frames cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_keeps_bytes_and_direction() {
        let frame = Frame::new(&[0x0B, 0x00], Direction::Outbound, 128).unwrap();
        assert_eq!(frame.bytes(), &[0x0B, 0x00]);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.direction(), Direction::Outbound);
    }

    #[test]
    fn frame_rejects_empty() {
        let result = Frame::new(&[], Direction::Inbound, 128);
        assert!(matches!(result, Err(Error::EmptyFrame)));
    }

    #[test]
    fn frame_rejects_oversized() {
        let data = vec![0u8; 33];
        let result = Frame::new(&data, Direction::Inbound, 32);
        assert!(matches!(result, Err(Error::FrameTooLong { len: 33, max: 32 })));
    }

    #[test]
    fn frame_accepts_max_length() {
        let data = vec![0xAAu8; 32];
        assert!(Frame::new(&data, Direction::Inbound, 32).is_ok());
    }
}
