// In-memory bus and motor node for unit tests

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::can::{BusError, BusTransport, COB_SYNC, CanFrame, SharedBus};
use crate::config::JsonConfig;
use crate::motor::{
    CanOpenIds, MotorError, MotorNode, NodeStatus, ProtocolCommand, RecorderCommand,
};
use crate::platform::{HomingParams, Platform, PlatformConfig, PlatformTopology};

/// Bus that replays queued frames and records everything sent
#[derive(Debug, Default)]
pub struct MockBus {
    pub pending: VecDeque<CanFrame>,
    pub sent: Vec<CanFrame>,
}

impl BusTransport for MockBus {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        self.sent.push(*frame);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, BusError> {
        Ok(self.pending.pop_front())
    }
}

/// Observable state behind a [`MockNode`]
#[derive(Debug)]
pub struct MockNodeState {
    pub ids: CanOpenIds,
    pub init_ok: bool,
    pub start_ok: bool,
    pub init_calls: u32,
    pub start_calls: u32,
    pub shut_down: bool,

    pub velocity: f64,
    pub velocities: Vec<f64>,
    /// `actual_position` integrates each commanded velocity over this step
    pub sim_dt: f64,
    pub actual_position: f64,
    /// Last reported position; refreshed only when a requested sample is dispatched
    pub position: f64,
    pub delta_position: f64,
    pub position_requests: u32,

    pub status: NodeStatus,
    pub status_requests: u32,
    pub torque: f64,
    pub torque_requests: u32,

    pub error: bool,
    pub age: Duration,
    pub watchdog: Vec<bool>,

    pub homing_inited: bool,
    pub homing_polls: u32,
    /// Limit switch reports reached after this many status queries
    pub limit_after_polls: Option<u32>,
    pub limit_switch: bool,
    pub protocol: Vec<ProtocolCommand>,

    pub recorder_code: i32,
    pub recorder: Vec<RecorderCommand>,
    pub frames: Vec<CanFrame>,
}

impl MockNodeState {
    fn new(ids: CanOpenIds) -> Self {
        Self {
            ids,
            init_ok: true,
            start_ok: true,
            init_calls: 0,
            start_calls: 0,
            shut_down: false,
            velocity: 0.0,
            velocities: Vec::new(),
            sim_dt: 0.0,
            actual_position: 0.0,
            position: 0.0,
            delta_position: 0.0,
            position_requests: 0,
            status: NodeStatus::default(),
            status_requests: 0,
            torque: 0.0,
            torque_requests: 0,
            error: false,
            age: Duration::ZERO,
            watchdog: Vec::new(),
            homing_inited: false,
            homing_polls: 0,
            limit_after_polls: None,
            limit_switch: false,
            protocol: Vec::new(),
            recorder_code: 0,
            recorder: Vec::new(),
            frames: Vec::new(),
        }
    }
}

/// Node whose position samples travel over a [`MockBus`] as TxPDO1 frames
pub struct MockNode {
    state: Arc<Mutex<MockNodeState>>,
    bus: Option<Arc<Mutex<MockBus>>>,
}

impl MockNode {
    pub fn new(ids: CanOpenIds) -> (Self, Arc<Mutex<MockNodeState>>) {
        let state = Arc::new(Mutex::new(MockNodeState::new(ids)));
        (
            Self {
                state: state.clone(),
                bus: None,
            },
            state,
        )
    }

    /// Answer position requests by queueing a TxPDO1 frame on `bus`
    pub fn with_bus(ids: CanOpenIds, bus: Arc<Mutex<MockBus>>) -> (Self, Arc<Mutex<MockNodeState>>) {
        let (mut node, state) = Self::new(ids);
        node.bus = Some(bus);
        (node, state)
    }
}

impl MotorNode for MockNode {
    fn init(&mut self) -> Result<(), MotorError> {
        let mut s = self.state.lock();
        s.init_calls += 1;
        if s.init_ok {
            Ok(())
        } else {
            Err(MotorError::Fault {
                node: s.ids.node_number(),
                status: 0x02,
            })
        }
    }

    fn start(&mut self) -> Result<(), MotorError> {
        let mut s = self.state.lock();
        s.start_calls += 1;
        if s.start_ok {
            Ok(())
        } else {
            Err(MotorError::Fault {
                node: s.ids.node_number(),
                status: 0x04,
            })
        }
    }

    fn shutdown(&mut self) {
        self.state.lock().shut_down = true;
    }

    fn set_velocity(&mut self, rad_s: f64) {
        let mut s = self.state.lock();
        let dt = s.sim_dt;
        s.actual_position += rad_s * dt;
        s.velocity = rad_s;
        s.velocities.push(rad_s);
    }

    fn request_position_velocity(&mut self) {
        let mut s = self.state.lock();
        s.position_requests += 1;
        if let Some(bus) = &self.bus {
            bus.lock().pending.push_back(CanFrame::new(s.ids.tx_pdo1, &[0; 8]));
        }
    }

    fn position_velocity(&self) -> (f64, f64) {
        let s = self.state.lock();
        (s.position, s.velocity)
    }

    fn delta_position_velocity(&mut self) -> (f64, f64) {
        let s = self.state.lock();
        (s.delta_position, s.velocity)
    }

    fn request_status(&mut self) {
        self.state.lock().status_requests += 1;
    }

    fn status(&self) -> NodeStatus {
        self.state.lock().status
    }

    fn request_torque(&mut self) {
        self.state.lock().torque_requests += 1;
    }

    fn torque(&self) -> f64 {
        self.state.lock().torque
    }

    fn set_torque(&mut self, nm: f64) {
        self.state.lock().torque = nm;
    }

    fn is_error(&self) -> bool {
        self.state.lock().error
    }

    fn last_message_age(&self) -> Duration {
        self.state.lock().age
    }

    fn start_watchdog(&mut self, enabled: bool) -> bool {
        self.state.lock().watchdog.push(enabled);
        true
    }

    fn init_homing(&mut self) {
        let mut s = self.state.lock();
        s.homing_inited = true;
        s.limit_switch = false;
    }

    fn limit_switch_reached(&self) -> bool {
        self.state.lock().limit_switch
    }

    fn send_protocol_command(&mut self, cmd: ProtocolCommand) {
        let mut s = self.state.lock();
        if cmd == ProtocolCommand::homing_status() {
            s.homing_polls += 1;
            if s.limit_after_polls.is_some_and(|n| s.homing_polls >= n) {
                s.limit_switch = true;
            }
        }
        s.protocol.push(cmd);
    }

    fn set_recorder(&mut self, cmd: &RecorderCommand) -> i32 {
        let mut s = self.state.lock();
        s.recorder.push(cmd.clone());
        s.recorder_code
    }

    fn eval_frame(&mut self, frame: &CanFrame) -> bool {
        let mut s = self.state.lock();
        if !s.ids.is_inbound(frame.id) {
            return false;
        }
        if frame.id == s.ids.tx_pdo1 {
            s.position = s.actual_position;
        }
        s.frames.push(*frame);
        true
    }
}

/// Complete platform configuration document; all four wheel sections are
/// always present so any node count resolves.
pub fn platform_json(number_of_motors: i64) -> Value {
    let mut root = json!({
        "config": { "number_of_motors": number_of_motors },
        "geom": { "radius_wheel_mm": 60, "dist_steer_axis_to_drive_wheel_mm": 30 },
        "drive_prms": {}
    });

    for n in 1..=4 {
        root["config"][format!("wheel{}_drive_motor", n)] = json!(1);
        root["config"][format!("wheel{}_steer_motor", n)] = json!(1);
        root["drive_prms"][format!("wheel{}_steer_drive_coupling", n)] = json!(0.5);
        for (section, steer) in [(format!("drive{}", n), false), (format!("steer{}", n), true)] {
            let sign = if steer { -1 } else { 1 };
            root[section] = json!({
                "enc_incr_per_rev_mot": 4096,
                "vel_meas_frq_hz": 1.0,
                "belt_ratio": 2.0,
                "gear_ratio": 37.0,
                "sign": sign,
                "vel_max_enc_incr_s": 1_000_000.0,
                "acc_incr_s2": 1_000_000.0,
                "dec_incr_s2": 1_000_000.0,
                "enc_offset_incr": 0,
                "is_steering": steer
            });
        }
    }
    root
}

/// Homing timing with every delay removed
pub fn fast_homing() -> HomingParams {
    HomingParams {
        net_start_settle: Duration::ZERO,
        watchdog_on_settle: Duration::ZERO,
        watchdog_off_settle: Duration::ZERO,
        init_settle: Duration::ZERO,
        move_settle: Duration::ZERO,
        poll_interval: Duration::ZERO,
        ..HomingParams::default()
    }
}

pub type MockHandles = Vec<Arc<Mutex<MockNodeState>>>;

/// Platform of mock nodes built from a configuration document
///
/// The returned handles are indexed by slot. Absent slots get a handle that
/// no node is attached to.
pub fn mock_platform_from(json: Value) -> (Platform, Arc<Mutex<MockBus>>, MockHandles) {
    let config = PlatformConfig::from_source(&JsonConfig::from_value(json)).unwrap();
    let mock = Arc::new(Mutex::new(MockBus::default()));
    let bus: SharedBus = mock.clone();

    let mut attached = Vec::new();
    let topology = PlatformTopology::build(&config, &bus, |slot, _| {
        let (node, state) = MockNode::with_bus(slot.ids, mock.clone());
        attached.push((slot.node_id, state));
        Box::new(node) as Box<dyn MotorNode>
    });

    let handles = config
        .slots
        .iter()
        .map(|slot| {
            attached
                .iter()
                .find(|(id, _)| *id == slot.node_id)
                .map(|(_, state)| state.clone())
                .unwrap_or_else(|| Arc::new(Mutex::new(MockNodeState::new(slot.ids))))
        })
        .collect();

    let platform = Platform::new(topology, bus, config.can_timeout).with_homing_params(fast_homing());
    (platform, mock, handles)
}

pub fn mock_platform(number_of_motors: i64) -> (Platform, Arc<Mutex<MockBus>>, MockHandles) {
    mock_platform_from(platform_json(number_of_motors))
}

/// Bus answering like a set of Harmonica drives
///
/// Jog velocities (JV) integrate into the encoder position once per SYNC,
/// each SYNC is answered with a TxPDO1 per node, HM[1] queries report the
/// homing event as fired, and SR queries return `status_register`.
#[derive(Debug, Default)]
pub struct SimulatedDrives {
    pub sent: Vec<CanFrame>,
    pending: VecDeque<CanFrame>,
    /// Encoder position per node number (incr)
    pub positions: BTreeMap<u16, f64>,
    velocities: BTreeMap<u16, i32>,
    /// Time advanced per SYNC (s)
    pub sample_dt: f64,
    pub status_register: i32,
    pub syncs: u32,
}

impl SimulatedDrives {
    pub fn new(nodes: &[u16], sample_dt: f64) -> Self {
        Self {
            positions: nodes.iter().map(|&n| (n, 0.0)).collect(),
            sample_dt,
            ..Self::default()
        }
    }

    fn reply(&mut self, node: u16, cmd: [u8; 2], index: u16, value: i32) {
        let mut data = [cmd[0], cmd[1], 0, 0, 0, 0, 0, 0];
        data[2..4].copy_from_slice(&index.to_le_bytes());
        data[4..8].copy_from_slice(&value.to_le_bytes());
        self.pending.push_back(CanFrame::new(0x280 + node, &data));
    }
}

impl BusTransport for SimulatedDrives {
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError> {
        self.sent.push(*frame);

        if frame.id == COB_SYNC {
            self.syncs += 1;
            let dt = self.sample_dt;
            for (node, pos) in self.positions.iter_mut() {
                let vel = self.velocities.get(node).copied().unwrap_or(0);
                *pos += vel as f64 * dt;
                let mut data = [0u8; 8];
                data[0..4].copy_from_slice(&(pos.round() as i32).to_le_bytes());
                data[4..8].copy_from_slice(&vel.to_le_bytes());
                self.pending.push_back(CanFrame::new(0x180 + node, &data));
            }
            return Ok(());
        }

        if (0x301..=0x37F).contains(&frame.id) && frame.len >= 4 {
            let node = frame.id - 0x300;
            let cmd = [frame.data[0], frame.data[1]];
            let index = u16::from_le_bytes([frame.data[2], frame.data[3]]);
            let value = i32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
            match (&cmd, frame.len, index) {
                (b"JV", 8, _) => {
                    self.velocities.insert(node, value);
                }
                (b"HM", 4, 1) => self.reply(node, cmd, 1, 0),
                (b"SR", 4, _) => {
                    let sr = self.status_register;
                    self.reply(node, cmd, 0, sr);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, BusError> {
        Ok(self.pending.pop_front())
    }
}

/// Platform of Harmonica drives on a [`SimulatedDrives`] bus
pub fn simulated_platform(number_of_motors: i64, sample_dt: f64) -> (Platform, Arc<Mutex<SimulatedDrives>>) {
    let config = PlatformConfig::from_source(&JsonConfig::from_value(platform_json(number_of_motors))).unwrap();
    let nodes: Vec<u16> = config.slots.iter().map(|s| s.ids.node_number()).collect();
    let sim = Arc::new(Mutex::new(SimulatedDrives::new(&nodes, sample_dt)));
    let bus: SharedBus = sim.clone();
    let platform = Platform::from_config(&config, bus).with_homing_params(fast_homing());
    (platform, sim)
}
