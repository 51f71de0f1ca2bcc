//! Wire-level constants and the fixed frames shared by master and slave.
//!
//! # Frames
//!
//! ```text
//! ping            master -> slave   [address, 0x00]
//! ping response   slave -> master   [0x02, 0x00]
//! switch command  master -> slave   [address, 0x03, x, x, 0x00 | 0x80, ...]
//! switch ack      slave -> master   [0x02, 0x03, 0x00, 0x00, 0x00 | 0x80]
//! ```
//!
//! Slave-to-master frames carry no source address; they always start with
//! [`TO_MASTER_PREFIX`].

/// First byte of every slave-to-master frame.
pub const TO_MASTER_PREFIX: u8 = 0x02;

/// Ping opcode (and ping response opcode).
pub const PING: u8 = 0x00;

/// Switch command opcode, also used by the slave's acknowledgment.
pub const SWITCH_COMMAND: u8 = 0x03;

/// Configuration request opcode.
pub const CONFIG_REQUEST: u8 = 0x03;

/// Time synchronisation opcode.
pub const TIME_SYNC: u8 = 0x08;

/// Dim opcode.
pub const DIM: u8 = 0x1D;

/// Sub-opcode selecting the universal dimmer family.
pub const DIM_U: u8 = 0x20;

/// Payload byte meaning "on" in switch commands and acks.
pub const SWITCH_ON: u8 = 0x00;

/// Payload byte meaning "off" in switch commands and acks.
pub const SWITCH_OFF: u8 = 0x80;

/// Offset of the on/off byte inside a switch command.
pub const SWITCH_STATE_OFFSET: usize = 4;

/// Maximum frame length accepted by the master.
pub const MASTER_MAX_FRAME_LEN: usize = 128;

/// Maximum frame length accepted by a slave.
pub const SLAVE_MAX_FRAME_LEN: usize = 32;

/// Build the 2-byte ping frame for `address`.
pub fn ping_frame(address: u8) -> [u8; 2] {
    [address, PING]
}

/// The slave's fixed ping acknowledgment.
pub fn ping_response() -> [u8; 2] {
    [TO_MASTER_PREFIX, PING]
}

/// Whether `data` is a ping response from a slave.
pub fn is_ping_response(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == TO_MASTER_PREFIX && data[1] == PING
}

/// Build a 5-byte switch command for `address`.
pub fn switch_command(address: u8, on: bool) -> [u8; 5] {
    [address, SWITCH_COMMAND, 0x00, 0x00, switch_byte(on)]
}

/// The slave's 5-byte acknowledgment echoing the new switch state.
pub fn switch_ack(on: bool) -> [u8; 5] {
    [TO_MASTER_PREFIX, SWITCH_COMMAND, 0x00, 0x00, switch_byte(on)]
}

/// Whether `data` is a switch acknowledgment; returns the reported state.
pub fn parse_switch_ack(data: &[u8]) -> Option<bool> {
    if data.len() < 5 || data[0] != TO_MASTER_PREFIX || data[1] != SWITCH_COMMAND {
        return None;
    }
    match data[SWITCH_STATE_OFFSET] {
        SWITCH_ON => Some(true),
        SWITCH_OFF => Some(false),
        _ => None,
    }
}

fn switch_byte(on: bool) -> u8 {
    if on { SWITCH_ON } else { SWITCH_OFF }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_frame_bytes() {
        assert_eq!(ping_frame(0x0B), [0x0B, 0x00]);
    }

    #[test]
    fn ping_response_recognised() {
        assert!(is_ping_response(&ping_response()));
        assert!(!is_ping_response(&[0x02]));
        assert!(!is_ping_response(&[0x0B, 0x00]));
    }

    #[test]
    fn switch_command_bytes() {
        assert_eq!(switch_command(0x22, true), [0x22, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(switch_command(0x22, false), [0x22, 0x03, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn switch_ack_bytes() {
        assert_eq!(switch_ack(true), [0x02, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(switch_ack(false), [0x02, 0x03, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn parse_switch_ack_states() {
        assert_eq!(parse_switch_ack(&switch_ack(true)), Some(true));
        assert_eq!(parse_switch_ack(&switch_ack(false)), Some(false));
        assert_eq!(parse_switch_ack(&[0x02, 0x03, 0x00, 0x00, 0x42]), None);
        assert_eq!(parse_switch_ack(&[0x02, 0x00]), None);
    }
}
