// Startup homing of the steer motors
//
// Every steer motor is driven toward its limit switch, the switch position
// becomes its zero, and a proportional loop then brings all wheels back to
// zero angle. Drive motors follow their steer motor scaled by the wheel's
// compensation factor so the contact point does not roll while steering.

use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Platform, PlatformState, PlatformTopology};
use crate::motor::{MotorNode, ProtocolCommand};

/// Gains and timing of the homing sequence
#[derive(Debug, Clone, PartialEq)]
pub struct HomingParams {
    /// Steer rate while searching for the limit switch (rad/s)
    pub home_vel_rad_s: f64,
    /// Proportional gain of the zero-angle loop (1/s)
    pub gain: f64,
    /// A wheel counts as zeroed below this angle (rad)
    pub tolerance_rad: f64,
    /// Limit switch polls before homing gives up
    pub max_iterations: u32,
    pub poll_interval: Duration,
    pub net_start_settle: Duration,
    pub watchdog_on_settle: Duration,
    pub watchdog_off_settle: Duration,
    pub init_settle: Duration,
    pub move_settle: Duration,
}

impl Default for HomingParams {
    fn default() -> Self {
        Self {
            home_vel_rad_s: -1.0,
            gain: 2.5,
            tolerance_rad: 0.03,
            max_iterations: 1000,
            poll_interval: Duration::from_millis(20),
            net_start_settle: Duration::from_millis(100),
            watchdog_on_settle: Duration::from_millis(10),
            watchdog_off_settle: Duration::from_millis(100),
            init_settle: Duration::from_millis(10),
            move_settle: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingPhase {
    Init,
    Compensation,
    SyncStart,
    LimitSwitch,
    ZeroConvergence,
    Done,
    Failed,
}

/// Progress of one homing run
#[derive(Debug, Clone)]
pub struct HomingSession {
    pub phase: HomingPhase,
    pub factors: Vec<f64>,
    pub limit_reached: Vec<bool>,
    pub iterations: u32,
}

impl HomingSession {
    pub fn new(wheels: usize) -> Self {
        Self {
            phase: HomingPhase::Init,
            factors: vec![0.0; wheels],
            limit_reached: vec![false; wheels],
            iterations: 0,
        }
    }

    fn enter(&mut self, phase: HomingPhase) {
        debug!("Homing phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}

/// Drive rate per unit of steer rate that keeps the contact point fixed
pub fn compensation_factor(coupling: f64, steer_axis_offset_mm: f64, wheel_radius_mm: f64) -> f64 {
    -coupling + steer_axis_offset_mm / wheel_radius_mm
}

/// Steer rate toward zero angle, and whether the angle is within tolerance
pub fn zero_position_rate(angle_rad: f64, gain: f64, tolerance_rad: f64) -> (f64, bool) {
    let error = -angle_rad;
    if error.abs() < tolerance_rad {
        (0.0, true)
    } else {
        (gain * error, false)
    }
}

fn command_wheel(state: &mut PlatformState, wheel: usize, steer_rad_s: f64, drive_rad_s: f64) {
    let slots = &mut state.topology.slots;
    if let Some(node) = slots[PlatformTopology::steer_index(wheel)].node.as_mut() {
        node.set_velocity(steer_rad_s);
    }
    if let Some(node) = slots[PlatformTopology::drive_index(wheel)].node.as_mut() {
        node.set_velocity(drive_rad_s);
    }
}

fn steer_node(state: &mut PlatformState, wheel: usize) -> Option<&mut Box<dyn MotorNode>> {
    state.topology.slots[PlatformTopology::steer_index(wheel)]
        .node
        .as_mut()
}

impl Platform {
    /// Start the network, initialize every node, and home all steer motors
    ///
    /// Returns true only if every node initialized and every wheel reached
    /// its limit switch in time. Node watchdogs are enabled on return either way.
    pub fn init_and_home(&self) -> bool {
        let p = self.homing.clone();

        info!("Starting CANopen network");
        self.send_net_start();
        thread::sleep(p.net_start_settle);

        // Cycle the watchdogs once so a stale configuration is cleared
        info!("Initializing watchdogs");
        self.start_watchdog(true);
        thread::sleep(p.watchdog_on_settle);
        self.start_watchdog(false);
        thread::sleep(p.watchdog_off_settle);

        let homed = self.home(&p);

        self.start_watchdog(true);
        homed
    }

    /// Initialize nodes and run homing; false if anything fails
    pub fn home(&self, p: &HomingParams) -> bool {
        let (configured, present, wheels) = {
            let state = self.state.lock();
            (
                state.topology.node_count(),
                state.topology.present_count(),
                state.topology.wheel_count(),
            )
        };
        let mut session = HomingSession::new(wheels);

        if present != configured {
            warn!(
                "Only {} of {} motors present, homing needs all of them",
                present, configured
            );
            session.enter(HomingPhase::Failed);
            return false;
        }

        if !self.init_wheels(wheels, p) {
            session.enter(HomingPhase::Failed);
            return false;
        }

        session.enter(HomingPhase::Compensation);
        {
            let state = self.state.lock();
            let geom = &state.topology.geometry;
            for (wheel, factor) in session.factors.iter_mut().enumerate() {
                *factor = compensation_factor(
                    geom.coupling[wheel],
                    geom.steer_axis_offset_mm,
                    geom.wheel_radius_mm,
                );
                debug!("Wheel {} compensation factor {:.4}", wheel + 1, factor);
            }
        }

        session.enter(HomingPhase::SyncStart);
        {
            let mut state = self.state.lock();
            for wheel in 0..wheels {
                if let Some(steer) = steer_node(&mut state, wheel) {
                    steer.init_homing();
                }
            }
            for wheel in 0..wheels {
                let rate = p.home_vel_rad_s;
                command_wheel(&mut state, wheel, rate, rate * session.factors[wheel]);
            }
        }
        thread::sleep(p.move_settle);
        self.flush_bus();

        session.enter(HomingPhase::LimitSwitch);
        if !self.seek_limit_switches(&mut session, p) {
            let mut state = self.state.lock();
            for wheel in 0..wheels {
                command_wheel(&mut state, wheel, 0.0, 0.0);
            }
            error!(
                "Homing timed out after {} iterations, wheels reached: {:?}",
                session.iterations, session.limit_reached
            );
            session.enter(HomingPhase::Failed);
            return false;
        }
        self.sample_steer_positions(wheels);

        session.enter(HomingPhase::ZeroConvergence);
        self.converge_to_zero(&session, p);

        {
            let mut state = self.state.lock();
            for wheel in 0..wheels {
                command_wheel(&mut state, wheel, 0.0, 0.0);
            }
        }
        session.enter(HomingPhase::Done);
        info!("All {} wheels homed", wheels);
        true
    }

    fn init_wheels(&self, wheels: usize, p: &HomingParams) -> bool {
        let mut all_ok = true;

        for wheel in 0..wheels {
            let slots = [PlatformTopology::drive_index(wheel), PlatformTopology::steer_index(wheel)];
            let mut ok = [false; 2];

            let mut state = self.state.lock();
            for (i, slot) in slots.into_iter().enumerate() {
                if let Some(node) = state.topology.slots[slot].node.as_mut() {
                    ok[i] = match node.init() {
                        Ok(()) => true,
                        Err(e) => {
                            debug!("{}", e);
                            false
                        }
                    };
                }
            }
            drop(state);
            thread::sleep(p.init_settle);

            let mut state = self.state.lock();
            for (i, slot) in slots.into_iter().enumerate() {
                if let Some(node) = state.topology.slots[slot].node.as_mut() {
                    if let Err(e) = node.start() {
                        debug!("{}", e);
                        ok[i] = false;
                    }
                    node.set_velocity(0.0);
                }
            }
            drop(state);

            match ok {
                [true, true] => info!("Initialization of wheel {} OK", wheel + 1),
                [false, true] => warn!("Initialization of wheel {} DRIVE failed", wheel + 1),
                [true, false] => warn!("Initialization of wheel {} STEER failed", wheel + 1),
                [false, false] => warn!("Initialization of wheel {} both motors failed", wheel + 1),
            }
            all_ok &= ok == [true, true];
        }

        if !all_ok {
            error!("Initialization of motors failed, homing aborted");
        }
        all_ok
    }

    /// Poll the limit switches until all are reached; false on timeout
    fn seek_limit_switches(&self, session: &mut HomingSession, p: &HomingParams) -> bool {
        let wheels = session.limit_reached.len();
        {
            let mut state = self.state.lock();
            for wheel in 0..wheels {
                if let Some(steer) = steer_node(&mut state, wheel) {
                    steer.send_protocol_command(ProtocolCommand::arm_homing());
                }
            }
        }

        loop {
            {
                let mut state = self.state.lock();
                for wheel in 0..wheels {
                    if let Some(steer) = steer_node(&mut state, wheel) {
                        steer.send_protocol_command(ProtocolCommand::homing_status());
                    }
                }
            }

            self.drain_and_dispatch();

            let all_reached = {
                let mut state = self.state.lock();
                for wheel in 0..wheels {
                    let reached = steer_node(&mut state, wheel)
                        .map(|n| n.limit_switch_reached())
                        .unwrap_or(false);
                    if reached {
                        command_wheel(&mut state, wheel, 0.0, 0.0);
                        if !session.limit_reached[wheel] {
                            info!("Wheel {} reached its limit switch", wheel + 1);
                        }
                        session.limit_reached[wheel] = true;
                    }
                }
                session.limit_reached.iter().all(|r| *r)
            };

            session.iterations += 1;
            if all_reached {
                return true;
            }
            if session.iterations >= p.max_iterations {
                return false;
            }
            thread::sleep(p.poll_interval);
        }
    }

    /// Request fresh steer telemetry and dispatch the replies
    fn sample_steer_positions(&self, wheels: usize) {
        {
            let mut state = self.state.lock();
            for wheel in 0..wheels {
                if let Some(steer) = steer_node(&mut state, wheel) {
                    steer.request_position_velocity();
                }
            }
        }
        self.drain_and_dispatch();
    }

    /// Proportional loop driving every steer angle to zero
    ///
    /// Every angle read follows a request for a new sample and its dispatch.
    fn converge_to_zero(&self, session: &HomingSession, p: &HomingParams) {
        let wheels = session.factors.len();
        loop {
            let all_zeroed = {
                let mut state = self.state.lock();
                let mut all_zeroed = true;
                for wheel in 0..wheels {
                    let angle = steer_node(&mut state, wheel)
                        .map(|n| n.position_velocity().0)
                        .unwrap_or(0.0);
                    let (rate, zeroed) = zero_position_rate(angle, p.gain, p.tolerance_rad);
                    command_wheel(&mut state, wheel, rate, rate * session.factors[wheel]);
                    all_zeroed &= zeroed;
                }
                all_zeroed
            };
            if all_zeroed {
                break;
            }

            thread::sleep(p.poll_interval);
            self.sample_steer_positions(wheels);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        fast_homing, mock_platform, mock_platform_from, platform_json, simulated_platform,
    };
    use crate::motor::DriveParam;
    use serde_json::json;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_compensation_factor() {
        assert_close(compensation_factor(0.5, 30.0, 60.0), 0.0);
        assert_close(compensation_factor(0.25, 30.0, 60.0), 0.25);
        assert_close(compensation_factor(0.0, 40.0, 80.0), 0.5);
    }

    #[test]
    fn test_zero_position_rate() {
        let (rate, zeroed) = zero_position_rate(-0.1, 2.5, 0.03);
        assert_close(rate, 0.25);
        assert!(!zeroed);

        let (rate, zeroed) = zero_position_rate(0.2, 2.5, 0.03);
        assert_close(rate, -0.5);
        assert!(!zeroed);

        assert_eq!(zero_position_rate(0.02, 2.5, 0.03), (0.0, true));
        assert_eq!(zero_position_rate(-0.029, 2.5, 0.03), (0.0, true));
    }

    fn limit_after(nodes: &[std::sync::Arc<parking_lot::Mutex<crate::testing::MockNodeState>>], polls: u32) {
        for steer in nodes.iter().skip(1).step_by(2) {
            let mut s = steer.lock();
            s.limit_after_polls = Some(polls);
            s.sim_dt = 0.2;
        }
    }

    #[test]
    fn test_homing_succeeds() {
        let (platform, _, nodes) = mock_platform(4);
        limit_after(&nodes, 3);

        assert!(platform.init_and_home());

        for (slot, node) in nodes.iter().enumerate() {
            let s = node.lock();
            assert_eq!(s.init_calls, 1, "slot {}", slot);
            assert_eq!(s.start_calls, 1);
            assert_eq!(s.watchdog, vec![true, false, true]);
            assert_eq!(s.velocities.last(), Some(&0.0));
        }

        let steer = nodes[1].lock();
        assert!(steer.homing_inited);
        assert_eq!(steer.protocol[0], ProtocolCommand::arm_homing());
        assert_eq!(steer.homing_polls, 3);
        assert!(steer.actual_position.abs() < 0.03);
        assert_eq!(steer.position, steer.actual_position);
        assert_eq!(steer.position_requests, 4);
        // Search rate, then the proportional loop halving the error
        assert_close(steer.velocities[1], -1.0);
        assert!(steer.velocities.iter().any(|v| (v - 0.5).abs() < 1e-9));
        assert!(steer.velocities.iter().any(|v| (v - 0.25).abs() < 1e-9));
    }

    #[test]
    fn test_drive_follows_compensation_factor() {
        let mut json = platform_json(2);
        json["drive_prms"]["wheel1_steer_drive_coupling"] = json!(0.25);
        let (platform, _, nodes) = mock_platform_from(json);
        limit_after(&nodes, 1);

        assert!(platform.init_and_home());
        let drive = nodes[0].lock();
        // start zero, search rate scaled by 0.25
        assert_close(drive.velocities[1], -0.25);
    }

    #[test]
    fn test_homing_times_out() {
        let (platform, _, nodes) = mock_platform(4);
        let platform = platform.with_homing_params(HomingParams {
            max_iterations: 5,
            ..fast_homing()
        });

        assert!(!platform.init_and_home());
        for node in &nodes {
            let s = node.lock();
            assert_eq!(s.velocities.last(), Some(&0.0));
            assert_eq!(s.watchdog.last(), Some(&true));
        }
        assert_eq!(nodes[1].lock().homing_polls, 5);
    }

    #[test]
    fn test_init_failure_aborts_homing() {
        let (platform, _, nodes) = mock_platform(4);
        limit_after(&nodes, 1);
        nodes[2].lock().init_ok = false;

        assert!(!platform.init_and_home());
        // Remaining wheels are still initialized, but nobody is armed
        assert_eq!(nodes[3].lock().init_calls, 1);
        assert!(nodes[1].lock().protocol.is_empty());
        assert_eq!(nodes[0].lock().watchdog.last(), Some(&true));
    }

    #[test]
    fn test_missing_motor_skips_homing() {
        let mut json = platform_json(4);
        json["config"]["wheel2_steer_motor"] = json!(0);
        let (platform, _, nodes) = mock_platform_from(json);

        assert!(!platform.init_and_home());
        assert_eq!(nodes[0].lock().init_calls, 0);
        assert_eq!(nodes[0].lock().watchdog, vec![true, false, true]);
    }

    #[test]
    fn test_homing_converges_on_sampled_steer_angle() {
        let (platform, sim) = simulated_platform(2, 0.2);
        // Steer (node 1) starts half a radian away from its zero
        let steer_params = DriveParam {
            enc_incr_per_rev_mot: 4096,
            belt_ratio: 2.0,
            gear_ratio: 37.0,
            sign: -1,
            ..DriveParam::default()
        };
        let start_incr = steer_params.pos_gear_rad_to_mot_incr(0.5);
        sim.lock().positions.insert(1, start_incr as f64);

        assert!(platform.init_and_home());

        let (angle, _) = platform.position_velocity(1);
        assert!(angle.abs() < 0.03, "steer left at {}", angle);
        let sim = sim.lock();
        assert!(sim.syncs >= 4, "only {} SYNC requests", sim.syncs);
        let actual = steer_params.pos_mot_incr_to_gear_rad(sim.positions[&1].round() as i32);
        assert!(actual.abs() < 0.03, "steer actually at {}", actual);
    }
}
