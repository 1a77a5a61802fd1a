// Motor node contract shared by the platform coordinator and drive implementations

use std::time::Duration;

use crate::can::{BusError, CanFrame};

/// Which half of a wheel module a motor moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Drive,
    Steer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Drive => "drive",
            Role::Steer => "steer",
        }
    }
}

/// The five CANopen communication-object identifiers bound to one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanOpenIds {
    pub tx_pdo1: u16,
    pub tx_pdo2: u16,
    pub rx_pdo2: u16,
    pub tx_sdo: u16,
    pub rx_sdo: u16,
}

impl CanOpenIds {
    /// Predefined connection set for a CANopen node number
    pub const fn from_node_number(node: u16) -> Self {
        Self {
            tx_pdo1: 0x180 + node,
            tx_pdo2: 0x280 + node,
            rx_pdo2: 0x300 + node,
            tx_sdo: 0x580 + node,
            rx_sdo: 0x600 + node,
        }
    }

    /// Node number recovered from the SDO server identifier
    pub fn node_number(&self) -> u16 {
        self.rx_sdo.wrapping_sub(0x600)
    }

    /// True if a frame with this identifier is sent by the node
    pub fn is_inbound(&self, id: u16) -> bool {
        id == self.tx_pdo1 || id == self.tx_pdo2 || id == self.tx_sdo
    }
}

/// Last status reported by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub status_code: i32,
    pub temperature_c: i32,
}

/// Index flag marking a float payload in interpreter frames
pub const FLOAT_FLAG: u16 = 0x4000;

/// Two-letter interpreter command carried on the receive PDO
///
/// `len` is 4 for queries / execute commands and 8 when a value is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolCommand {
    pub len: u8,
    pub major: u8,
    pub minor: u8,
    pub sub_index: u16,
    pub value: i32,
}

impl ProtocolCommand {
    pub const fn set(major: u8, minor: u8, sub_index: u16, value: i32) -> Self {
        Self {
            len: 8,
            major,
            minor,
            sub_index,
            value,
        }
    }

    /// Float-valued set command; bit 14 of the index flags the float encoding
    pub fn set_f32(major: u8, minor: u8, sub_index: u16, value: f32) -> Self {
        Self::set(major, minor, sub_index | FLOAT_FLAG, value.to_bits() as i32)
    }

    pub const fn query(major: u8, minor: u8, sub_index: u16) -> Self {
        Self {
            len: 4,
            major,
            minor,
            sub_index,
            value: 0,
        }
    }

    /// HM[1]=1: arm the homing event
    pub const fn arm_homing() -> Self {
        Self::set(b'H', b'M', 1, 1)
    }

    /// HM[1]: ask whether the homing event has fired
    pub const fn homing_status() -> Self {
        Self::query(b'H', b'M', 1)
    }

    /// Frame payload: [major, minor, index lo, index hi, value LE]
    pub fn encode(&self, id: u16) -> CanFrame {
        let mut data = [0u8; 8];
        data[0] = self.major;
        data[1] = self.minor;
        data[2..4].copy_from_slice(&self.sub_index.to_le_bytes());
        data[4..8].copy_from_slice(&self.value.to_le_bytes());
        CanFrame::new(id, &data[..self.len.min(8) as usize])
    }
}

/// On-device recorder control, forwarded to every node
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderCommand {
    /// Reset and configure the recorder; `gap` is the sampling gap in servo cycles
    Configure { gap: i32 },
    /// Upload recorded `object` sub-index and write it below `destination`
    Readout { object: i32, destination: String },
    /// Abort a running transfer and clear buffers
    Abort,
    /// Report the transfer state
    QueryState,
}

impl RecorderCommand {
    pub fn from_opcode(opcode: i32, param: i32, destination: &str) -> Option<Self> {
        match opcode {
            0 => Some(Self::Configure { gap: param }),
            1 => Some(Self::Readout {
                object: param,
                destination: destination.to_string(),
            }),
            2 => Some(Self::Abort),
            3 => Some(Self::QueryState),
            _ => None,
        }
    }
}

/// Per-node recorder transfer codes
pub const RECORDER_IDLE: i32 = 0;
pub const RECORDER_IN_PROGRESS: i32 = 1;
pub const RECORDER_FAILED: i32 = 2;

/// Error types for a single motor node
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Bus error on node {node}: {source}")]
    Bus {
        node: u16,
        #[source]
        source: BusError,
    },

    #[error("Node {node} reported fault status 0x{status:04X}")]
    Fault { node: u16, status: i32 },
}

/// One physical actuator on the bus
///
/// Commands are fire-and-forget: replies are picked up later when the
/// coordinator offers inbound frames through [`MotorNode::eval_frame`].
pub trait MotorNode: Send {
    fn init(&mut self) -> Result<(), MotorError>;
    fn start(&mut self) -> Result<(), MotorError>;
    fn shutdown(&mut self);

    fn set_velocity(&mut self, rad_s: f64);
    fn request_position_velocity(&mut self);
    /// Gear angle (rad) and rate (rad/s) from the last telemetry
    fn position_velocity(&self) -> (f64, f64);
    /// Angle travelled since the previous call, and rate
    fn delta_position_velocity(&mut self) -> (f64, f64);

    fn request_status(&mut self);
    fn status(&self) -> NodeStatus;

    fn request_torque(&mut self);
    fn torque(&self) -> f64;
    fn set_torque(&mut self, nm: f64);

    fn is_error(&self) -> bool;
    fn last_message_age(&self) -> Duration;
    fn start_watchdog(&mut self, enabled: bool) -> bool;

    fn init_homing(&mut self);
    fn limit_switch_reached(&self) -> bool;
    fn send_protocol_command(&mut self, cmd: ProtocolCommand);

    fn set_recorder(&mut self, cmd: &RecorderCommand) -> i32;

    /// Consume a frame addressed to this node; returns false if it isn't ours
    fn eval_frame(&mut self, frame: &CanFrame) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_number_ids() {
        let ids = CanOpenIds::from_node_number(2);
        assert_eq!(ids.tx_pdo1, 0x182);
        assert_eq!(ids.tx_pdo2, 0x282);
        assert_eq!(ids.rx_pdo2, 0x302);
        assert_eq!(ids.tx_sdo, 0x582);
        assert_eq!(ids.rx_sdo, 0x602);
        assert_eq!(ids.node_number(), 2);
        assert!(ids.is_inbound(0x282));
        assert!(!ids.is_inbound(0x302));
    }

    #[test]
    fn test_protocol_command_layout() {
        let arm = ProtocolCommand::arm_homing().encode(0x301);
        assert_eq!(arm.payload(), &[b'H', b'M', 1, 0, 1, 0, 0, 0]);

        let status = ProtocolCommand::homing_status().encode(0x301);
        assert_eq!(status.payload(), &[b'H', b'M', 1, 0]);
    }

    #[test]
    fn test_recorder_opcodes() {
        assert_eq!(
            RecorderCommand::from_opcode(0, 5, ""),
            Some(RecorderCommand::Configure { gap: 5 })
        );
        assert_eq!(
            RecorderCommand::from_opcode(3, 0, ""),
            Some(RecorderCommand::QueryState)
        );
        assert_eq!(RecorderCommand::from_opcode(99, 0, ""), None);
    }
}
