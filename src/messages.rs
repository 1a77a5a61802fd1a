// Message types for the runtime

use serde::{Deserialize, Serialize};

// Command from teleop/planner -> runtime, one per joint
// A payload on the command topic is a JSON array of these
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct JointCommand {
    pub node_id: u8,
    pub vel_rad_s: f64,
}

pub type JointCommands = Vec<JointCommand>;

// Telemetry from runtime -> consumers, one per present joint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct JointState {
    pub node_id: u8,
    pub pos_rad: f64,
    pub vel_rad_s: f64,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlatformHealth {
    Ok,
    CmdStale,
    Fault,
    Unhomed,
}
