// Platform topology: which motors exist, how they are addressed, and their parameters
//
// Slot 2i is the drive motor of wheel i, slot 2i+1 its steer motor.
// Everything here is read once at startup and never mutated afterwards.

use std::time::Duration;
use tracing::{info, warn};

use crate::can::SharedBus;
use crate::config::{ConfigError, ConfigSource, DEFAULT_CAN_TIMEOUT};
use crate::motor::{CanOpenIds, DriveParam, HarmonicaDrive, MotorNode, Role};

pub const MAX_NODES: usize = 8;
pub const DEFAULT_NODES: usize = 8;

/// CANopen node numbers per wheel as (drive, steer)
pub const DEFAULT_NODE_NUMBERS: [(u16, u16); MAX_NODES / 2] = [(2, 1), (4, 3), (8, 7), (6, 5)];

/// Logical identifier of a wheel's drive or steer motor
pub const fn node_id(wheel: usize, role: Role) -> u8 {
    match role {
        Role::Drive => (2 * wheel) as u8,
        Role::Steer => (2 * wheel + 1) as u8,
    }
}

/// Accept 2, 4, 6 or 8 nodes; anything else falls back to 8
pub fn normalize_node_count(requested: i64) -> usize {
    match requested {
        2 | 4 | 6 | 8 => requested as usize,
        _ => {
            warn!(
                "Unsupported number of motors {}, using {}",
                requested, DEFAULT_NODES
            );
            DEFAULT_NODES
        }
    }
}

/// Configuration of one slot, before any node is constructed
#[derive(Debug, Clone, PartialEq)]
pub struct SlotConfig {
    pub wheel: usize,
    pub role: Role,
    pub node_id: u8,
    pub has_motor: bool,
    pub ids: CanOpenIds,
    pub params: DriveParam,
}

/// Wheel-module geometry used for the steer/drive coupling
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformGeometry {
    pub wheel_radius_mm: f64,
    pub steer_axis_offset_mm: f64,
    /// One coupling ratio per wheel
    pub coupling: Vec<f64>,
}

/// Everything the coordinator needs from the configuration source
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformConfig {
    pub slots: Vec<SlotConfig>,
    pub geometry: PlatformGeometry,
    pub can_timeout: Duration,
}

impl PlatformConfig {
    pub fn node_count(&self) -> usize {
        self.slots.len()
    }

    pub fn wheel_count(&self) -> usize {
        self.slots.len() / 2
    }

    /// Read the platform description; a missing mandatory key is fatal
    pub fn from_source(src: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let node_count = normalize_node_count(src.required_i64("config", "number_of_motors")?);
        let wheel_count = node_count / 2;

        if let Some(wheels) = src.get_i64("config", "number_of_wheels")? {
            if wheels as usize != wheel_count {
                warn!(
                    "number_of_wheels = {} ignored, {} motors give {} wheels",
                    wheels, node_count, wheel_count
                );
            }
        }

        let mut coupling = Vec::with_capacity(wheel_count);
        let mut slots = Vec::with_capacity(node_count);

        for wheel in 0..wheel_count {
            let n = wheel + 1;
            coupling.push(src.required_f64("drive_prms", &format!("wheel{}_steer_drive_coupling", n))?);

            let (drive_node, steer_node) = DEFAULT_NODE_NUMBERS[wheel];
            for (role, node_number, section) in [
                (Role::Drive, drive_node, format!("drive{}", n)),
                (Role::Steer, steer_node, format!("steer{}", n)),
            ] {
                let tag = format!("w{}_{}", n, role.as_str());
                let has_motor =
                    src.required_bool("config", &format!("wheel{}_{}_motor", n, role.as_str()))?;
                let ids = read_ids(src, &tag, CanOpenIds::from_node_number(node_number))?;
                let params = read_drive_param(src, &section)?;

                slots.push(SlotConfig {
                    wheel,
                    role,
                    node_id: node_id(wheel, role),
                    has_motor,
                    ids,
                    params,
                });
            }
        }

        let geometry = PlatformGeometry {
            wheel_radius_mm: src.required_f64("geom", "radius_wheel_mm")?,
            steer_axis_offset_mm: src.required_f64("geom", "dist_steer_axis_to_drive_wheel_mm")?,
            coupling,
        };

        let can_timeout = Duration::from_secs_f64(src.optional_f64(
            "config",
            "can_timeout_s",
            DEFAULT_CAN_TIMEOUT.as_secs_f64(),
        )?);

        Ok(Self {
            slots,
            geometry,
            can_timeout,
        })
    }
}

/// Identifiers default to the predefined table, each overridable by key
fn read_ids(src: &dyn ConfigSource, tag: &str, defaults: CanOpenIds) -> Result<CanOpenIds, ConfigError> {
    let id = |kind: &str, default: u16| -> Result<u16, ConfigError> {
        let value = src.optional_i64("can_open_ids", &format!("{}_{}", kind, tag), default as i64)?;
        u16::try_from(value)
            .ok()
            .filter(|v| *v <= 0x7FF)
            .ok_or_else(|| ConfigError::WrongType {
                section: "can_open_ids".to_string(),
                key: format!("{}_{}", kind, tag),
                expected: "11-bit identifier",
            })
    };

    Ok(CanOpenIds {
        tx_pdo1: id("tx_pdo1", defaults.tx_pdo1)?,
        tx_pdo2: id("tx_pdo2", defaults.tx_pdo2)?,
        rx_pdo2: id("rx_pdo2", defaults.rx_pdo2)?,
        tx_sdo: id("tx_sdo", defaults.tx_sdo)?,
        rx_sdo: id("rx_sdo", defaults.rx_sdo)?,
    })
}

fn read_drive_param(src: &dyn ConfigSource, section: &str) -> Result<DriveParam, ConfigError> {
    Ok(DriveParam {
        enc_incr_per_rev_mot: src.required_i64(section, "enc_incr_per_rev_mot")? as i32,
        vel_meas_frq_hz: src.required_f64(section, "vel_meas_frq_hz")?,
        belt_ratio: src.required_f64(section, "belt_ratio")?,
        gear_ratio: src.required_f64(section, "gear_ratio")?,
        sign: src.required_i64(section, "sign")? as i32,
        vel_max_enc_incr_s: src.required_f64(section, "vel_max_enc_incr_s")?,
        acc_incr_s2: src.required_f64(section, "acc_incr_s2")?,
        dec_incr_s2: src.required_f64(section, "dec_incr_s2")?,
        enc_offset_incr: src.required_i64(section, "enc_offset_incr")? as i32,
        is_steer: src.required_bool(section, "is_steering")?,
        current_to_torque: src.optional_f64(section, "current_to_torque", 0.0)?,
        curr_max: src.optional_f64(section, "curr_max", 0.0)?,
        homing_dig_in: src.get_i64(section, "homing_dig_in")?.map(|v| v as i32),
    })
}

/// One physical motor position on the platform
pub struct MotorSlot {
    pub wheel: usize,
    pub role: Role,
    pub node_id: u8,
    pub ids: CanOpenIds,
    pub params: DriveParam,
    pub node: Option<Box<dyn MotorNode>>,
}

impl MotorSlot {
    pub fn is_present(&self) -> bool {
        self.node.is_some()
    }
}

/// Ordered slots plus geometry, bound to one transport
pub struct PlatformTopology {
    pub slots: Vec<MotorSlot>,
    pub geometry: PlatformGeometry,
}

impl PlatformTopology {
    /// Build with Harmonica drives for every present slot
    pub fn build_harmonica(config: &PlatformConfig, bus: &SharedBus) -> Self {
        Self::build(config, bus, |slot, bus| {
            Box::new(HarmonicaDrive::new(slot.ids, slot.params.clone(), bus)) as Box<dyn MotorNode>
        })
    }

    /// Build with nodes produced by `factory`, which receives a bus clone per node
    pub fn build<F>(config: &PlatformConfig, bus: &SharedBus, mut factory: F) -> Self
    where
        F: FnMut(&SlotConfig, SharedBus) -> Box<dyn MotorNode>,
    {
        let slots = config
            .slots
            .iter()
            .map(|slot| {
                let node = if slot.has_motor {
                    info!(
                        "Wheel {} {} motor present (node id {}, TxPDO1 0x{:03X})",
                        slot.wheel + 1,
                        slot.role.as_str(),
                        slot.node_id,
                        slot.ids.tx_pdo1
                    );
                    Some(factory(slot, bus.clone()))
                } else {
                    info!("Wheel {} {} motor not present", slot.wheel + 1, slot.role.as_str());
                    None
                };
                MotorSlot {
                    wheel: slot.wheel,
                    role: slot.role,
                    node_id: slot.node_id,
                    ids: slot.ids,
                    params: slot.params.clone(),
                    node,
                }
            })
            .collect();

        Self {
            slots,
            geometry: config.geometry.clone(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.slots.len()
    }

    pub fn wheel_count(&self) -> usize {
        self.slots.len() / 2
    }

    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_present()).count()
    }

    /// Drive slot index of `wheel`
    pub fn drive_index(wheel: usize) -> usize {
        2 * wheel
    }

    /// Steer slot index of `wheel`
    pub fn steer_index(wheel: usize) -> usize {
        2 * wheel + 1
    }

    pub fn present_nodes_mut(&mut self) -> impl Iterator<Item = (usize, &mut Box<dyn MotorNode>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.node.as_mut().map(|n| (i, n)))
    }

    /// Node of the slot whose logical id is `id`, if present
    pub fn node_by_id(&self, id: u8) -> Option<&dyn MotorNode> {
        self.slots
            .iter()
            .find(|s| s.node_id == id)
            .and_then(|s| s.node.as_deref())
    }

    pub fn node_by_id_mut(&mut self, id: u8) -> Option<&mut Box<dyn MotorNode>> {
        self.slots
            .iter_mut()
            .find(|s| s.node_id == id)
            .and_then(|s| s.node.as_mut())
    }
}
