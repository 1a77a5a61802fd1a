// Motor layer for the drive chain
//
// Provides:
// - The motor node contract the platform coordinator drives
// - Drive-train parameters and unit conversions
// - The Elmo Harmonica CANopen drive

pub mod drive_param;
pub mod harmonica;
mod node;

pub use drive_param::DriveParam;
pub use harmonica::HarmonicaDrive;
pub use node::{
    CanOpenIds, FLOAT_FLAG, MotorError, MotorNode, NodeStatus, ProtocolCommand, RECORDER_FAILED,
    RECORDER_IDLE, RECORDER_IN_PROGRESS, RecorderCommand, Role,
};
