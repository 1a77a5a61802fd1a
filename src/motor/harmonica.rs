// Elmo Harmonica drive amplifier on CANopen
//
// Commands go out as binary-interpreter frames on RxPDO2:
//   [c0, c1, index lo, index hi, value (4 bytes LE)]   length 4 = query/execute, 8 = set
// Replies come back on TxPDO2 with the same layout.
// TxPDO1 carries [position i32 LE, velocity i32 LE] and is sent on every SYNC.
// Watchdog and recorder readout use SDO transfers on the node's SDO channel.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::drive_param::DriveParam;
use super::node::{
    CanOpenIds, FLOAT_FLAG, MotorError, MotorNode, NodeStatus, ProtocolCommand, RECORDER_FAILED,
    RECORDER_IDLE, RECORDER_IN_PROGRESS, RecorderCommand,
};
use crate::can::{COB_SYNC, CanFrame, SharedBus};

/// Status register bits 1..3 hold the drive fault code
const SR_FAULT_MASK: i32 = 0x000E;

/// Unit mode 2: speed control
const UNIT_MODE_SPEED: i32 = 2;

/// Digital input used as homing event when none is configured
const DEFAULT_HOMING_DIG_IN: i32 = 11;

/// Host heartbeat supervised by the drive
const HEARTBEAT_CONSUMER_MS: i32 = 1000;
const HOST_NODE_ID: i32 = 0;

/// Recorder object and interpreter values
const RECORDER_OBJECT: u16 = 0x2030;
const RECORDER_STOP: i32 = 0;
const RECORDER_START_NOW: i32 = 2;

/// SDO command specifiers
const SDO_DOWNLOAD_4: u8 = 0x23;
const SDO_UPLOAD_INIT: u8 = 0x40;
const SDO_UPLOAD_SEGMENT: u8 = 0x60;
const SDO_ABORT: u8 = 0x80;
const SDO_ABORT_GENERAL: u32 = 0x0800_0000;

/// State of a recorder upload
#[derive(Debug)]
enum RecorderTransfer {
    Idle,
    Uploading {
        object: u8,
        destination: PathBuf,
        toggle: bool,
        data: Vec<u8>,
    },
    Failed,
}

/// One Harmonica drive bound to its identifiers and the shared bus
pub struct HarmonicaDrive {
    ids: CanOpenIds,
    params: DriveParam,
    bus: SharedBus,

    pos_gear_rad: f64,
    vel_gear_rad_s: f64,
    last_delta_pos_rad: f64,
    status: NodeStatus,
    current_a: f64,

    homing_armed: bool,
    limit_switch: bool,
    last_message: Instant,
    recorder: RecorderTransfer,
}

impl HarmonicaDrive {
    pub fn new(ids: CanOpenIds, params: DriveParam, bus: SharedBus) -> Self {
        Self {
            ids,
            params,
            bus,
            pos_gear_rad: 0.0,
            vel_gear_rad_s: 0.0,
            last_delta_pos_rad: 0.0,
            status: NodeStatus::default(),
            current_a: 0.0,
            homing_armed: false,
            limit_switch: false,
            last_message: Instant::now(),
            recorder: RecorderTransfer::Idle,
        }
    }

    fn node(&self) -> u16 {
        self.ids.node_number()
    }

    fn send(&self, frame: CanFrame) -> Result<(), MotorError> {
        self.bus
            .lock()
            .transmit(&frame)
            .map_err(|source| MotorError::Bus {
                node: self.node(),
                source,
            })
    }

    /// Send and only log a failure; used by the fire-and-forget commands
    fn send_logged(&self, frame: CanFrame) {
        if let Err(e) = self.send(frame) {
            warn!("{}", e);
        }
    }

    fn interpreter(&self, cmd: ProtocolCommand) -> Result<(), MotorError> {
        self.send(cmd.encode(self.ids.rx_pdo2))
    }

    fn sdo_download(&self, index: u16, sub: u8, value: i32) -> Result<(), MotorError> {
        let mut data = [SDO_DOWNLOAD_4, 0, 0, sub, 0, 0, 0, 0];
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[4..8].copy_from_slice(&value.to_le_bytes());
        self.send(CanFrame::new(self.ids.rx_sdo, &data))
    }

    fn sdo_upload_init(&self, index: u16, sub: u8) -> Result<(), MotorError> {
        let mut data = [SDO_UPLOAD_INIT, 0, 0, sub, 0, 0, 0, 0];
        data[1..3].copy_from_slice(&index.to_le_bytes());
        self.send(CanFrame::new(self.ids.rx_sdo, &data))
    }

    fn sdo_upload_segment(&self, toggle: bool) -> Result<(), MotorError> {
        let cmd = SDO_UPLOAD_SEGMENT | if toggle { 0x10 } else { 0x00 };
        self.send(CanFrame::new(self.ids.rx_sdo, &[cmd, 0, 0, 0, 0, 0, 0, 0]))
    }

    fn sdo_abort(&self, index: u16, sub: u8) {
        let mut data = [SDO_ABORT, 0, 0, sub, 0, 0, 0, 0];
        data[1..3].copy_from_slice(&index.to_le_bytes());
        data[4..8].copy_from_slice(&SDO_ABORT_GENERAL.to_le_bytes());
        self.send_logged(CanFrame::new(self.ids.rx_sdo, &data));
    }

    fn eval_pdo1(&mut self, frame: &CanFrame) {
        if frame.len < 8 {
            debug!("Node {}: short TxPDO1 ({} bytes)", self.node(), frame.len);
            return;
        }
        let pos = i32::from_le_bytes([frame.data[0], frame.data[1], frame.data[2], frame.data[3]]);
        let vel = i32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
        self.pos_gear_rad = self.params.pos_mot_incr_to_gear_rad(pos);
        self.vel_gear_rad_s = self.params.vel_mot_meas_to_gear_rad_s(vel);
    }

    fn eval_interpreter_reply(&mut self, frame: &CanFrame) {
        if frame.len < 4 {
            return;
        }
        let cmd = [frame.data[0], frame.data[1]];
        let raw_index = u16::from_le_bytes([frame.data[2], frame.data[3]]);
        let index = raw_index & 0x3FFF;
        let bytes = [frame.data[4], frame.data[5], frame.data[6], frame.data[7]];
        let value = if raw_index & FLOAT_FLAG != 0 {
            f32::from_le_bytes(bytes) as f64
        } else {
            i32::from_le_bytes(bytes) as f64
        };

        match (&cmd, index) {
            (b"SR", _) => {
                let sr = value as i32;
                if sr & SR_FAULT_MASK != 0 && self.status.status_code & SR_FAULT_MASK == 0 {
                    warn!("Node {}: status register fault 0x{:04X}", self.node(), sr);
                }
                self.status.status_code = sr;
            }
            (b"TI", 1) => self.status.temperature_c = value as i32,
            (b"IQ", _) => self.current_a = value,
            (b"HM", 1) => {
                // HM[1] falls back to 0 once the homing event has fired
                if self.homing_armed && value as i32 == 0 {
                    self.limit_switch = true;
                    self.homing_armed = false;
                }
            }
            _ => debug!(
                "Node {}: interpreter reply {}{}[{}] = {}",
                self.node(),
                cmd[0] as char,
                cmd[1] as char,
                index,
                value
            ),
        }
    }

    fn eval_sdo(&mut self, frame: &CanFrame) {
        if frame.len < 1 {
            return;
        }
        let head = frame.data[0];

        if head == SDO_ABORT {
            let code = u32::from_le_bytes([frame.data[4], frame.data[5], frame.data[6], frame.data[7]]);
            warn!("Node {}: SDO transfer aborted (0x{:08X})", self.node(), code);
            if matches!(self.recorder, RecorderTransfer::Uploading { .. }) {
                self.recorder = RecorderTransfer::Failed;
            }
            return;
        }

        let RecorderTransfer::Uploading {
            object,
            toggle,
            data,
            ..
        } = &mut self.recorder
        else {
            return;
        };

        match head >> 5 {
            // Initiate upload response
            2 => {
                if head & 0x02 != 0 {
                    let unused = if head & 0x01 != 0 { ((head >> 2) & 0x03) as usize } else { 0 };
                    data.extend_from_slice(&frame.data[4..8 - unused]);
                    self.finish_upload();
                } else {
                    *toggle = false;
                    if let Err(e) = self.sdo_upload_segment(false) {
                        warn!("{}", e);
                        self.recorder = RecorderTransfer::Failed;
                    }
                }
            }
            // Upload segment response
            0 => {
                let object = *object;
                let seg_toggle = head & 0x10 != 0;
                if seg_toggle != *toggle {
                    warn!("Node {}: SDO toggle mismatch on recorder object {}", self.node(), object);
                    self.sdo_abort(RECORDER_OBJECT, object);
                    self.recorder = RecorderTransfer::Failed;
                    return;
                }
                let unused = ((head >> 1) & 0x07) as usize;
                data.extend_from_slice(&frame.data[1..8 - unused]);
                if head & 0x01 != 0 {
                    self.finish_upload();
                } else {
                    *toggle = !*toggle;
                    let next = *toggle;
                    if let Err(e) = self.sdo_upload_segment(next) {
                        warn!("{}", e);
                        self.recorder = RecorderTransfer::Failed;
                    }
                }
            }
            // Download acknowledgements need no action
            _ => {}
        }
    }

    fn finish_upload(&mut self) {
        let transfer = std::mem::replace(&mut self.recorder, RecorderTransfer::Idle);
        let RecorderTransfer::Uploading {
            object,
            destination,
            data,
            ..
        } = transfer
        else {
            return;
        };

        match write_samples(&destination, self.node(), object, &data) {
            Ok(path) => info!(
                "Node {}: recorder object {} written to {}",
                self.node(),
                object,
                path.display()
            ),
            Err(e) => {
                warn!("Node {}: failed to write recorder data: {}", self.node(), e);
                self.recorder = RecorderTransfer::Failed;
            }
        }
    }
}

/// Write recorded bytes as one little-endian i32 sample per line
fn write_samples(dir: &Path, node: u16, object: u8, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("recorder_{}_{}.csv", node, object));
    let body: String = data
        .chunks_exact(4)
        .map(|c| format!("{}\n", i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        .collect();
    std::fs::write(&path, body)?;
    Ok(path)
}

impl MotorNode for HarmonicaDrive {
    fn init(&mut self) -> Result<(), MotorError> {
        info!(
            "Initializing node {} ({})",
            self.node(),
            if self.params.is_steer { "steer" } else { "drive" }
        );
        // Motor off before changing the unit mode
        self.interpreter(ProtocolCommand::set(b'M', b'O', 0, 0))?;
        self.interpreter(ProtocolCommand::set(b'U', b'M', 0, UNIT_MODE_SPEED))?;
        self.interpreter(ProtocolCommand::set(b'A', b'C', 0, self.params.acc_incr_s2 as i32))?;
        self.interpreter(ProtocolCommand::set(b'D', b'C', 0, self.params.dec_incr_s2 as i32))?;
        self.interpreter(ProtocolCommand::set(b'S', b'P', 0, self.params.vel_max_enc_incr_s as i32))?;
        if !self.params.is_steer {
            // Drive wheels count from wherever they are; steer zero comes from homing
            let zero = self.params.pos_gear_rad_to_mot_incr(0.0);
            self.interpreter(ProtocolCommand::set(b'P', b'X', 0, zero))?;
        }
        // TxPDO1 transmission type 1: every SYNC
        self.sdo_download(0x1800, 2, 1)?;
        self.interpreter(ProtocolCommand::query(b'S', b'R', 0))?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), MotorError> {
        if self.status.status_code & SR_FAULT_MASK != 0 {
            return Err(MotorError::Fault {
                node: self.node(),
                status: self.status.status_code,
            });
        }
        self.interpreter(ProtocolCommand::set(b'M', b'O', 0, 1))?;
        self.interpreter(ProtocolCommand::query(b'S', b'R', 0))?;
        Ok(())
    }

    fn shutdown(&mut self) {
        info!("Shutting down node {}", self.node());
        self.send_logged(ProtocolCommand::set(b'M', b'O', 0, 0).encode(self.ids.rx_pdo2));
    }

    fn set_velocity(&mut self, rad_s: f64) {
        let incr_s = self.params.vel_gear_rad_s_to_mot_incr_s(rad_s);
        self.send_logged(ProtocolCommand::set(b'J', b'V', 0, incr_s).encode(self.ids.rx_pdo2));
        self.send_logged(ProtocolCommand::query(b'B', b'G', 0).encode(self.ids.rx_pdo2));
    }

    fn request_position_velocity(&mut self) {
        self.send_logged(CanFrame::new(COB_SYNC, &[]));
    }

    fn position_velocity(&self) -> (f64, f64) {
        (self.pos_gear_rad, self.vel_gear_rad_s)
    }

    fn delta_position_velocity(&mut self) -> (f64, f64) {
        let delta = self.pos_gear_rad - self.last_delta_pos_rad;
        self.last_delta_pos_rad = self.pos_gear_rad;
        (delta, self.vel_gear_rad_s)
    }

    fn request_status(&mut self) {
        self.send_logged(ProtocolCommand::query(b'S', b'R', 0).encode(self.ids.rx_pdo2));
        self.send_logged(ProtocolCommand::query(b'T', b'I', 1).encode(self.ids.rx_pdo2));
    }

    fn status(&self) -> NodeStatus {
        self.status
    }

    fn request_torque(&mut self) {
        self.send_logged(ProtocolCommand::query(b'I', b'Q', 0).encode(self.ids.rx_pdo2));
    }

    fn torque(&self) -> f64 {
        self.params.current_to_torque_nm(self.current_a)
    }

    fn set_torque(&mut self, nm: f64) {
        let amps = self.params.torque_nm_to_current(nm) as f32;
        self.send_logged(ProtocolCommand::set_f32(b'T', b'C', 0, amps).encode(self.ids.rx_pdo2));
    }

    fn is_error(&self) -> bool {
        self.status.status_code & SR_FAULT_MASK != 0
    }

    fn last_message_age(&self) -> Duration {
        self.last_message.elapsed()
    }

    fn start_watchdog(&mut self, enabled: bool) -> bool {
        let result = if enabled {
            // Supervise the host heartbeat, stop and quick-stop when it is lost
            self.sdo_download(0x1016, 1, (HOST_NODE_ID << 16) | HEARTBEAT_CONSUMER_MS)
                .and_then(|_| self.sdo_download(0x1029, 1, 2))
                .and_then(|_| self.sdo_download(0x6007, 0, 3))
                .and_then(|_| self.sdo_download(0x2F21, 0, 0x08))
        } else {
            self.sdo_download(0x1016, 1, 0)
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn init_homing(&mut self) {
        let event = self.params.homing_dig_in.unwrap_or(DEFAULT_HOMING_DIG_IN);
        self.homing_armed = false;
        self.limit_switch = false;
        for cmd in [
            ProtocolCommand::set(b'H', b'M', 1, 0),
            ProtocolCommand::set(b'H', b'M', 2, 0),
            ProtocolCommand::set(b'H', b'M', 3, event),
            ProtocolCommand::set(b'H', b'M', 4, 2),
            ProtocolCommand::set(b'H', b'M', 5, 0),
        ] {
            self.send_logged(cmd.encode(self.ids.rx_pdo2));
        }
    }

    fn limit_switch_reached(&self) -> bool {
        self.limit_switch
    }

    fn send_protocol_command(&mut self, cmd: ProtocolCommand) {
        if cmd == ProtocolCommand::arm_homing() {
            self.homing_armed = true;
        }
        self.send_logged(cmd.encode(self.ids.rx_pdo2));
    }

    fn set_recorder(&mut self, cmd: &RecorderCommand) -> i32 {
        match cmd {
            RecorderCommand::Configure { gap } => {
                for c in [
                    ProtocolCommand::set(b'R', b'R', 0, RECORDER_STOP),
                    ProtocolCommand::set(b'R', b'G', 0, *gap),
                    ProtocolCommand::set(b'R', b'R', 0, RECORDER_START_NOW),
                ] {
                    self.send_logged(c.encode(self.ids.rx_pdo2));
                }
                self.recorder = RecorderTransfer::Idle;
                RECORDER_IDLE
            }
            RecorderCommand::Readout {
                object,
                destination,
            } => match self.recorder {
                RecorderTransfer::Uploading { .. } => RECORDER_IN_PROGRESS,
                RecorderTransfer::Failed => RECORDER_FAILED,
                RecorderTransfer::Idle => {
                    let object = (*object).clamp(0, u8::MAX as i32) as u8;
                    match self.sdo_upload_init(RECORDER_OBJECT, object) {
                        Ok(()) => {
                            self.recorder = RecorderTransfer::Uploading {
                                object,
                                destination: PathBuf::from(destination),
                                toggle: false,
                                data: Vec::new(),
                            };
                            RECORDER_IN_PROGRESS
                        }
                        Err(e) => {
                            warn!("{}", e);
                            self.recorder = RecorderTransfer::Failed;
                            RECORDER_FAILED
                        }
                    }
                }
            },
            RecorderCommand::Abort => {
                if let RecorderTransfer::Uploading { object, .. } = self.recorder {
                    self.sdo_abort(RECORDER_OBJECT, object);
                }
                self.recorder = RecorderTransfer::Idle;
                RECORDER_IDLE
            }
            RecorderCommand::QueryState => match self.recorder {
                RecorderTransfer::Idle => RECORDER_IDLE,
                RecorderTransfer::Uploading { .. } => RECORDER_IN_PROGRESS,
                RecorderTransfer::Failed => RECORDER_FAILED,
            },
        }
    }

    fn eval_frame(&mut self, frame: &CanFrame) -> bool {
        if !self.ids.is_inbound(frame.id) {
            return false;
        }
        self.last_message = Instant::now();

        if frame.id == self.ids.tx_pdo1 {
            self.eval_pdo1(frame);
        } else if frame.id == self.ids.tx_pdo2 {
            self.eval_interpreter_reply(frame);
        } else {
            self.eval_sdo(frame);
        }
        true
    }
}
