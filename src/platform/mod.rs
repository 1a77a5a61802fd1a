// Platform coordinator for the wheel modules
//
// Owns the bus handle and every motor node. All access to node state goes
// through one lock: dispatch of inbound frames and every routed command
// hold it for their full duration, so they never interleave.

mod fault;
mod homing;
mod recorder;
mod topology;

use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use fault::{FaultCause, FaultLatch, NodeHealth};
pub use homing::{HomingParams, HomingPhase, HomingSession, compensation_factor, zero_position_rate};
pub use recorder::RECORDER_UNKNOWN_OPCODE;
pub use topology::{
    DEFAULT_NODE_NUMBERS, MotorSlot, PlatformConfig, PlatformGeometry, PlatformTopology,
    SlotConfig, node_id, normalize_node_count,
};

use crate::can::{COB_HEARTBEAT, COB_NMT, CanFrame, SharedBus};
use crate::motor::{MotorNode, NodeStatus};

/// NMT "start remote node", broadcast to all nodes
const NMT_START_ALL: [u8; 2] = [0x01, 0x00];

/// Heartbeat state byte: operational
const HEARTBEAT_OPERATIONAL: u8 = 0x05;

/// Everything guarded by the platform lock
pub struct PlatformState {
    pub topology: PlatformTopology,
    pub fault: FaultLatch,
}

/// The platform coordinator
pub struct Platform {
    bus: SharedBus,
    state: Mutex<PlatformState>,
    can_timeout: Duration,
    homing: HomingParams,
}

impl Platform {
    pub fn new(topology: PlatformTopology, bus: SharedBus, can_timeout: Duration) -> Self {
        Self {
            bus,
            state: Mutex::new(PlatformState {
                topology,
                fault: FaultLatch::Healthy,
            }),
            can_timeout,
            homing: HomingParams::default(),
        }
    }

    /// Build the topology with Harmonica drives and bind it to `bus`
    pub fn from_config(config: &PlatformConfig, bus: SharedBus) -> Self {
        let topology = PlatformTopology::build_harmonica(config, &bus);
        Self::new(topology, bus, config.can_timeout)
    }

    pub fn with_homing_params(mut self, homing: HomingParams) -> Self {
        self.homing = homing;
        self
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().topology.node_count()
    }

    pub fn wheel_count(&self) -> usize {
        self.state.lock().topology.wheel_count()
    }

    pub fn present_count(&self) -> usize {
        self.state.lock().topology.present_count()
    }

    /// Logical ids of all present nodes, in slot order
    pub fn present_ids(&self) -> Vec<u8> {
        self.state
            .lock()
            .topology
            .slots
            .iter()
            .filter(|s| s.is_present())
            .map(|s| s.node_id)
            .collect()
    }

    fn transmit(&self, frame: CanFrame) -> bool {
        match self.bus.lock().transmit(&frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send frame 0x{:03X}: {}", frame.id, e);
                false
            }
        }
    }

    fn receive(&self) -> Option<CanFrame> {
        match self.bus.lock().try_receive() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Bus receive failed: {}", e);
                None
            }
        }
    }

    /// Read every pending frame and hand it to the nodes
    ///
    /// Returns the number of frames processed. Frames no node claims are
    /// logged and dropped.
    pub fn drain_and_dispatch(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;

        // The bus lock is released before nodes see the frame; they transmit through it
        while let Some(frame) = self.receive() {
            count += 1;
            let mut claimed = false;
            for (_, node) in state.topology.present_nodes_mut() {
                claimed |= node.eval_frame(&frame);
            }
            if !claimed {
                warn!("Received CAN message with unknown identifier 0x{:03X}", frame.id);
            }
        }
        count
    }

    /// Discard everything pending on the bus without dispatching it
    fn flush_bus(&self) -> usize {
        let mut dropped = 0;
        while self.receive().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Flushed {} frames from the bus", dropped);
        }
        dropped
    }

    /// Refresh the fault latch from node health and return it
    pub fn check_fault(&self) -> bool {
        let mut state = self.state.lock();
        let snapshot: Vec<NodeHealth> = state
            .topology
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                s.node.as_ref().map(|node| NodeHealth {
                    slot,
                    in_error: node.is_error(),
                    last_message_age: node.last_message_age(),
                })
            })
            .collect();

        let next = FaultLatch::evaluate(&snapshot, self.can_timeout);
        let cause = FaultLatch::cause(&snapshot, self.can_timeout);

        match (state.fault, cause) {
            (FaultLatch::Healthy, Some(FaultCause::NodeError { slot })) => {
                warn!("Motor {} error, platform fault latched", slot);
            }
            (FaultLatch::Healthy, Some(FaultCause::CommunicationTimeout { slot, age })) => {
                warn!(
                    "Timeout CAN motor {} (no message for {:.1}s), platform fault latched",
                    slot,
                    age.as_secs_f64()
                );
            }
            (FaultLatch::Latched, None) => info!("All motors healthy, platform fault cleared"),
            _ => {}
        }

        state.fault = next;
        next.is_latched()
    }

    fn read_node<R>(&self, id: u8, default: R, f: impl FnOnce(&dyn MotorNode) -> R) -> R {
        let state = self.state.lock();
        state.topology.node_by_id(id).map(f).unwrap_or(default)
    }

    fn with_node<R>(&self, id: u8, default: R, f: impl FnOnce(&mut dyn MotorNode) -> R) -> R {
        let mut state = self.state.lock();
        match state.topology.node_by_id_mut(id) {
            Some(node) => f(node.as_mut()),
            None => default,
        }
    }

    fn for_each_node(&self, mut f: impl FnMut(usize, &mut dyn MotorNode)) {
        let mut state = self.state.lock();
        for (slot, node) in state.topology.present_nodes_mut() {
            f(slot, node.as_mut());
        }
    }

    // === Command routing ===

    /// Command a gear velocity; forced to zero while the fault latch is set
    pub fn set_velocity(&self, id: u8, rad_s: f64) {
        let mut state = self.state.lock();
        let rad_s = if state.fault.is_latched() { 0.0 } else { rad_s };
        if let Some(node) = state.topology.node_by_id_mut(id) {
            node.set_velocity(rad_s);
        }
    }

    pub fn request_position_velocity(&self, id: u8) {
        self.with_node(id, (), |n| n.request_position_velocity());
    }

    /// Angle (rad) and rate (rad/s) from the last dispatched telemetry
    pub fn position_velocity(&self, id: u8) -> (f64, f64) {
        self.read_node(id, (0.0, 0.0), |n| n.position_velocity())
    }

    pub fn delta_position_velocity(&self, id: u8) -> (f64, f64) {
        self.with_node(id, (0.0, 0.0), |n| n.delta_position_velocity())
    }

    pub fn request_status(&self) {
        self.for_each_node(|_, n| n.request_status());
    }

    pub fn status(&self, id: u8) -> NodeStatus {
        self.read_node(id, NodeStatus::default(), |n| n.status())
    }

    pub fn request_torque(&self) {
        self.for_each_node(|_, n| n.request_torque());
    }

    pub fn torque(&self, id: u8) -> f64 {
        self.read_node(id, 0.0, |n| n.torque())
    }

    pub fn set_torque(&self, id: u8, nm: f64) {
        self.with_node(id, (), |n| n.set_torque(nm));
    }

    // === Platform-wide control ===

    /// Restart every node and zero its velocity
    pub fn reset(&self) -> bool {
        let mut all_ok = true;
        self.for_each_node(|slot, n| match n.start() {
            Ok(()) => n.set_velocity(0.0),
            Err(e) => {
                warn!("Resetting of motor {} failed: {}", slot, e);
                all_ok = false;
            }
        });
        all_ok
    }

    pub fn shutdown(&self) {
        info!("Shutting down platform");
        self.for_each_node(|_, n| n.shutdown());
    }

    pub fn start_watchdog(&self, enabled: bool) -> bool {
        let mut all_ok = true;
        self.for_each_node(|_, n| all_ok &= n.start_watchdog(enabled));
        all_ok
    }

    /// Put every node on the network into operational state
    pub fn send_net_start(&self) -> bool {
        self.transmit(CanFrame::new(COB_NMT, &NMT_START_ALL))
    }

    /// Host heartbeat watched by the drives' watchdogs
    pub fn send_heartbeat(&self) -> bool {
        self.transmit(CanFrame::new(COB_HEARTBEAT, &[HEARTBEAT_OPERATIONAL]))
    }
}
