// On-device recorder control, broadcast to every present node

use tracing::{debug, warn};

use super::Platform;
use crate::motor::RecorderCommand;

/// Returned for an opcode outside 0..=3
pub const RECORDER_UNKNOWN_OPCODE: i32 = -1;

impl Platform {
    /// Forward `cmd` to every node and fold their return codes
    ///
    /// Readout reports the most severe node state, a state query the sum over
    /// all nodes. Configure and abort always report 0.
    pub fn recorder(&self, cmd: &RecorderCommand) -> i32 {
        let mut codes = Vec::new();
        self.for_each_node(|_, n| codes.push(n.set_recorder(cmd)));
        debug!("Recorder {:?} returned {:?}", cmd, codes);

        match cmd {
            RecorderCommand::Configure { .. } | RecorderCommand::Abort => 0,
            RecorderCommand::Readout { .. } => codes.into_iter().max().unwrap_or(0),
            RecorderCommand::QueryState => codes.into_iter().sum(),
        }
    }

    /// Numeric entry point: 0 configure, 1 readout, 2 abort, 3 query
    pub fn recorder_opcode(&self, opcode: i32, param: i32, destination: &str) -> i32 {
        match RecorderCommand::from_opcode(opcode, param, destination) {
            Some(cmd) => self.recorder(&cmd),
            None => {
                warn!("Unknown recorder opcode {}", opcode);
                RECORDER_UNKNOWN_OPCODE
            }
        }
    }
}
