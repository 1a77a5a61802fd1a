// Drive-train parameters and unit conversions
// Converts between gear-side units (rad, rad/s, Nm) and motor-side encoder increments.

use std::f64::consts::PI;

/// Mechanical and limit parameters of one motor
#[derive(Debug, Clone, PartialEq)]
pub struct DriveParam {
    /// Encoder increments per motor revolution
    pub enc_incr_per_rev_mot: i32,
    /// Velocity measurement frequency; measured velocity is in increments per period
    pub vel_meas_frq_hz: f64,
    pub belt_ratio: f64,
    pub gear_ratio: f64,
    /// +1 or -1, mounting direction
    pub sign: i32,
    /// Units: increments/second
    pub vel_max_enc_incr_s: f64,
    /// Units: increments/second^2
    pub acc_incr_s2: f64,
    /// Units: increments/second^2
    pub dec_incr_s2: f64,
    pub enc_offset_incr: i32,
    pub is_steer: bool,
    /// Nm per A, 0.0 when not configured
    pub current_to_torque: f64,
    /// A, 0.0 when not configured
    pub curr_max: f64,
    pub homing_dig_in: Option<i32>,
}

impl Default for DriveParam {
    fn default() -> Self {
        Self {
            enc_incr_per_rev_mot: 4096,
            vel_meas_frq_hz: 1.0,
            belt_ratio: 1.0,
            gear_ratio: 1.0,
            sign: 1,
            vel_max_enc_incr_s: 0.0,
            acc_incr_s2: 0.0,
            dec_incr_s2: 0.0,
            enc_offset_incr: 0,
            is_steer: false,
            current_to_torque: 0.0,
            curr_max: 0.0,
            homing_dig_in: None,
        }
    }
}

impl DriveParam {
    /// Motor increments per gear radian (sign not applied)
    fn incr_per_rad_gear(&self) -> f64 {
        self.enc_incr_per_rev_mot as f64 * self.gear_ratio * self.belt_ratio / (2.0 * PI)
    }

    fn sign(&self) -> f64 {
        if self.sign < 0 { -1.0 } else { 1.0 }
    }

    /// Encoder position (incr) to gear angle (rad), offset removed
    pub fn pos_mot_incr_to_gear_rad(&self, incr: i32) -> f64 {
        self.sign() * (incr as f64 - self.enc_offset_incr as f64) / self.incr_per_rad_gear()
    }

    /// Gear angle (rad) to encoder position (incr), offset applied
    pub fn pos_gear_rad_to_mot_incr(&self, rad: f64) -> i32 {
        (self.sign() * rad * self.incr_per_rad_gear()).round() as i32 + self.enc_offset_incr
    }

    /// Gear rate (rad/s) to motor rate (incr/s), clamped to the velocity limit
    pub fn vel_gear_rad_s_to_mot_incr_s(&self, rad_s: f64) -> i32 {
        let mut incr_s = self.sign() * rad_s * self.incr_per_rad_gear();
        if self.vel_max_enc_incr_s > 0.0 {
            incr_s = incr_s.clamp(-self.vel_max_enc_incr_s, self.vel_max_enc_incr_s);
        }
        incr_s.round() as i32
    }

    /// Measured velocity (increments per measurement period) to gear rate (rad/s)
    pub fn vel_mot_meas_to_gear_rad_s(&self, incr_per_period: i32) -> f64 {
        self.sign() * incr_per_period as f64 * self.vel_meas_frq_hz / self.incr_per_rad_gear()
    }

    /// Active current (A) to gear torque (Nm)
    pub fn current_to_torque_nm(&self, amps: f64) -> f64 {
        self.sign() * amps * self.current_to_torque
    }

    /// Gear torque (Nm) to current command (A), clamped to the current limit
    ///
    /// Returns 0 when no current-to-torque scale is configured.
    pub fn torque_nm_to_current(&self, nm: f64) -> f64 {
        if self.current_to_torque == 0.0 {
            return 0.0;
        }
        let mut amps = self.sign() * nm / self.current_to_torque;
        if self.curr_max > 0.0 {
            amps = amps.clamp(-self.curr_max, self.curr_max);
        }
        amps
    }
}
