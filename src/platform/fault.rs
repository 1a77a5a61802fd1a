// Platform fault latch
//
// The latch is set while any node reports an internal error or has been
// silent longer than the communication timeout. It only clears on a check
// where every node is healthy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health of one present node at the time of a check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeHealth {
    pub slot: usize,
    pub in_error: bool,
    pub last_message_age: Duration,
}

/// Why the latch is set
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultCause {
    NodeError { slot: usize },
    CommunicationTimeout { slot: usize, age: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultLatch {
    #[default]
    Healthy,
    Latched,
}

impl FaultLatch {
    pub fn is_latched(&self) -> bool {
        *self == FaultLatch::Latched
    }

    /// First fault in a health snapshot; internal errors take precedence over timeouts
    pub fn cause(snapshot: &[NodeHealth], timeout: Duration) -> Option<FaultCause> {
        snapshot
            .iter()
            .find(|h| h.in_error)
            .map(|h| FaultCause::NodeError { slot: h.slot })
            .or_else(|| {
                snapshot
                    .iter()
                    .find(|h| h.last_message_age > timeout)
                    .map(|h| FaultCause::CommunicationTimeout {
                        slot: h.slot,
                        age: h.last_message_age,
                    })
            })
    }

    /// Next latch state for a snapshot
    pub fn evaluate(snapshot: &[NodeHealth], timeout: Duration) -> FaultLatch {
        match Self::cause(snapshot, timeout) {
            Some(_) => FaultLatch::Latched,
            None => FaultLatch::Healthy,
        }
    }
}
