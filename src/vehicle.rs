use crate::config::VehicleConfig;
use crate::types::{CanFrame, can_ids, encoding};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_RPM: i32 = 8000;
pub const MAX_GEAR: i32 = 5;
pub const MAX_BRAKE: i32 = 100;

/// Driving mode of the simulated vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleMode {
    Idle,
    Accelerating,
    Cruising,
    Braking,
    AnomalyReaction,
}

impl VehicleMode {
    /// Token used on the status line
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleMode::Idle => "IDLE",
            VehicleMode::Accelerating => "ACCELERATING",
            VehicleMode::Cruising => "CRUISING",
            VehicleMode::Braking => "BRAKING",
            VehicleMode::AnomalyReaction => "ANOMALY_REACTION",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "IDLE" => Some(VehicleMode::Idle),
            "ACCELERATING" => Some(VehicleMode::Accelerating),
            "CRUISING" => Some(VehicleMode::Cruising),
            "BRAKING" => Some(VehicleMode::Braking),
            "ANOMALY_REACTION" => Some(VehicleMode::AnomalyReaction),
            _ => None,
        }
    }
}

impl fmt::Display for VehicleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only copy of the vehicle state handed to ECUs and the status line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub mode: VehicleMode,
    pub rpm: u16,
    pub gear: u8,
    pub brake_pedal: u8,
    /// Simulated seconds since the model was created
    pub elapsed: f64,
}

impl Default for VehicleSnapshot {
    fn default() -> Self {
        Self {
            mode: VehicleMode::Idle,
            rpm: 800,
            gear: 0,
            brake_pedal: 0,
            elapsed: 0.0,
        }
    }
}

impl VehicleSnapshot {
    pub fn is_braking(&self) -> bool {
        self.brake_pedal > 0
    }
}

/// Vehicle behaviour state machine.
///
/// Only `tick` mutates the state. The model keeps its own clock (the sum of
/// the `dt` values it was ticked with), so a seeded model replays identically.
pub struct VehicleModel {
    config: VehicleConfig,
    mode: VehicleMode,
    rpm: i32,
    gear: i32,
    brake_pedal: i32,
    cruise_timer: f64,
    anomaly_timer: f64,
    elapsed: f64,
    rng: StdRng,
}

impl VehicleModel {
    pub fn new(config: VehicleConfig) -> Self {
        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let idle_rpm = config.idle_rpm;
        Self {
            config,
            mode: VehicleMode::Idle,
            rpm: idle_rpm,
            gear: 0,
            brake_pedal: 0,
            cruise_timer: 0.0,
            anomaly_timer: 0.0,
            elapsed: 0.0,
            rng,
        }
    }

    /// Start the model in a given mode instead of Idle (scenario setup)
    pub fn with_state(config: VehicleConfig, mode: VehicleMode, rpm: u16, gear: u8) -> Self {
        let mut model = Self::new(config);
        model.mode = mode;
        model.rpm = (rpm as i32).clamp(0, MAX_RPM);
        model.gear = (gear as i32).clamp(0, MAX_GEAR);
        model
    }

    pub fn mode(&self) -> VehicleMode {
        self.mode
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            mode: self.mode,
            rpm: self.rpm.clamp(0, MAX_RPM) as u16,
            gear: self.gear.clamp(0, MAX_GEAR) as u8,
            brake_pedal: self.brake_pedal.clamp(0, MAX_BRAKE) as u8,
            elapsed: self.elapsed,
        }
    }

    /// Advance the model by `dt` seconds.
    ///
    /// `observed_gear` is the most recent gear value seen on the bus, which
    /// may disagree with the model's own gear when the bus is being forged.
    pub fn tick(&mut self, dt: f64, observed_gear: Option<u8>) -> VehicleSnapshot {
        let dt = dt.max(0.0);
        self.elapsed += dt;
        let observed = observed_gear.map(i32::from);

        // Internal gear says top gear, bus says otherwise
        if self.gear == MAX_GEAR && observed == Some(2) {
            self.mode = VehicleMode::AnomalyReaction;
            self.anomaly_timer = 0.0;
        }

        match self.mode {
            VehicleMode::Idle => self.tick_idle(),
            VehicleMode::Accelerating => self.tick_accelerating(),
            VehicleMode::Cruising => self.tick_cruising(dt),
            VehicleMode::Braking => self.tick_braking(),
            VehicleMode::AnomalyReaction => self.tick_anomaly(dt, observed),
        }

        self.rpm = self.rpm.clamp(0, MAX_RPM);
        self.gear = self.gear.clamp(0, MAX_GEAR);
        self.brake_pedal = self.brake_pedal.clamp(0, MAX_BRAKE);
        self.snapshot()
    }

    fn chance(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p.clamp(0.0, 1.0))
    }

    fn jitter(&mut self, low: i32, high: i32) -> i32 {
        if low >= high {
            return low;
        }
        self.rng.gen_range(low..=high)
    }

    fn tick_idle(&mut self) {
        let c = &self.config;
        let (base, spread, p) = (c.idle_rpm, c.idle_jitter, c.p_start_accelerating);
        self.gear = 0;
        self.rpm = base + self.jitter(-spread, spread);
        if self.chance(p) {
            self.mode = VehicleMode::Accelerating;
        }
    }

    fn tick_accelerating(&mut self) {
        let c = &self.config;
        self.rpm += c.accel_step;
        if self.rpm > c.upshift_rpm && self.gear < MAX_GEAR {
            self.gear += 1;
            self.rpm -= c.upshift_drop;
        } else if self.gear == 0 {
            self.gear = 1;
        }

        if self.gear == MAX_GEAR && self.rpm > c.cruise_rpm {
            self.mode = VehicleMode::Cruising;
            self.cruise_timer = 0.0;
        }
    }

    fn tick_cruising(&mut self, dt: f64) {
        self.gear = MAX_GEAR;
        self.cruise_timer += dt;

        let c = &self.config;
        let oscillation = (self.elapsed * 0.5).sin() * c.cruise_oscillation;
        let (base, spread, step) = (c.cruise_rpm, c.cruise_jitter, c.cruise_step);
        let (dwell, p) = (c.cruise_dwell_secs, c.p_start_braking);
        let target = base as f64 + oscillation + self.jitter(-spread, spread) as f64;
        if (self.rpm as f64) < target {
            self.rpm += step;
        } else {
            self.rpm -= step;
        }

        if self.cruise_timer > dwell || self.chance(p) {
            self.mode = VehicleMode::Braking;
        }
    }

    fn tick_braking(&mut self) {
        let c = &self.config;
        self.rpm -= c.brake_step;
        self.brake_pedal = MAX_BRAKE;
        if self.rpm < c.downshift_rpm && self.gear > 0 {
            self.gear -= 1;
            self.rpm += c.downshift_bump;
        }
        if self.gear == 0 || self.rpm < c.idle_rpm {
            self.mode = VehicleMode::Idle;
            self.rpm = c.idle_rpm;
            self.brake_pedal = 0;
        }
    }

    fn tick_anomaly(&mut self, dt: f64, observed: Option<i32>) {
        let (redline, spread) = (self.config.redline_rpm, self.config.redline_jitter);
        self.gear = 2;
        self.rpm = redline + self.jitter(0, spread);
        self.brake_pedal = 0;

        self.anomaly_timer += dt;
        let bus_recovered = observed == Some(MAX_GEAR);
        if (bus_recovered && self.anomaly_timer > self.config.anomaly_min_secs)
            || self.anomaly_timer > self.config.anomaly_timeout_secs
        {
            self.recover();
        }
    }

    fn recover(&mut self) {
        self.mode = VehicleMode::Cruising;
        self.rpm = self.config.cruise_rpm;
        self.gear = MAX_GEAR;
        self.anomaly_timer = 0.0;
        self.cruise_timer = 0.0;
    }
}

/// Verdict on one observed gear change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShiftVerdict {
    Plausible,
    Suspicious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShiftEvent {
    pub from: u8,
    pub to: u8,
    pub rpm: u16,
    pub verdict: ShiftVerdict,
}

/// Passive physics check on bus traffic: does each observed gear change
/// happen at an engine speed the drivetrain could produce?
///
/// Upshifts are plausible above 2000 RPM (the shift point minus the
/// post-shift drop); downshifts below 3500 RPM.
#[derive(Debug, Default)]
pub struct ShiftMonitor {
    last_rpm: u16,
    last_gear: Option<u8>,
    pub plausible: u64,
    pub suspicious: u64,
}

impl ShiftMonitor {
    pub const UPSHIFT_MIN_RPM: u16 = 2000;
    pub const DOWNSHIFT_MAX_RPM: u16 = 3500;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, frame: &CanFrame) -> Option<ShiftEvent> {
        if frame.id == can_ids::ENGINE_RPM {
            if let Some(rpm) = encoding::decode_rpm(&frame.data) {
                self.last_rpm = rpm;
            }
            return None;
        }
        if frame.id != can_ids::TRANSMISSION {
            return None;
        }
        let gear = encoding::decode_gear(&frame.data)?;
        let previous = self.last_gear.replace(gear)?;
        if previous == gear {
            return None;
        }

        let plausible = if gear > previous {
            self.last_rpm > Self::UPSHIFT_MIN_RPM
        } else {
            self.last_rpm < Self::DOWNSHIFT_MAX_RPM
        };
        let verdict = if plausible {
            self.plausible += 1;
            ShiftVerdict::Plausible
        } else {
            self.suspicious += 1;
            ShiftVerdict::Suspicious
        };
        Some(ShiftEvent {
            from: previous,
            to: gear,
            rpm: self.last_rpm,
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> VehicleConfig {
        VehicleConfig {
            seed: Some(7),
            ..VehicleConfig::default()
        }
    }

    #[test]
    fn test_idle_rpm_stays_in_band() {
        let mut model = VehicleModel::new(VehicleConfig {
            p_start_accelerating: 0.0,
            ..seeded()
        });
        for _ in 0..200 {
            let s = model.tick(0.1, Some(0));
            assert_eq!(s.mode, VehicleMode::Idle);
            assert_eq!(s.gear, 0);
            assert!((750..=850).contains(&s.rpm), "idle rpm {} out of band", s.rpm);
        }
    }

    #[test]
    fn test_braking_downshifts_to_idle() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Braking, 1600, 1);
        let s = model.tick(0.1, None);
        // 1600 - 200 = 1400 < 1500: gear 0, then idle reset
        assert_eq!(s.mode, VehicleMode::Idle);
        assert_eq!(s.rpm, 800);
        assert_eq!(s.brake_pedal, 0);
    }

    #[test]
    fn test_braking_holds_pedal() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Braking, 3000, 4);
        let s = model.tick(0.1, None);
        assert_eq!(s.mode, VehicleMode::Braking);
        assert_eq!(s.brake_pedal, 100);
        assert_eq!(s.rpm, 2800);
    }

    #[test]
    fn test_accelerating_upshifts_above_threshold() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Accelerating, 3600, 1);
        let s = model.tick(0.1, Some(1));
        assert_eq!(s.gear, 2);
        assert_eq!(s.rpm, 2720);
        assert_eq!(s.mode, VehicleMode::Accelerating);
    }

    #[test]
    fn test_top_gear_above_cruise_rpm_starts_cruising() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Accelerating, 2150, 5);
        let s = model.tick(0.1, Some(5));
        assert_eq!(s.mode, VehicleMode::Cruising);
        assert_eq!(s.gear, 5);
    }

    #[test]
    fn test_forged_gear_two_in_top_gear_triggers_reaction() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Cruising, 2200, 5);
        let s = model.tick(0.1, Some(2));
        assert_eq!(s.mode, VehicleMode::AnomalyReaction);
        assert_eq!(s.gear, 2);
        assert!((7000..=7500).contains(&s.rpm), "redline rpm {}", s.rpm);
    }

    #[test]
    fn test_bus_recovery_needs_strictly_more_than_min_secs() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Cruising, 2200, 5);
        assert_eq!(model.tick(0.5, Some(2)).mode, VehicleMode::AnomalyReaction);
        // Timer sits at exactly 2.0s after three more ticks: not yet
        for _ in 0..3 {
            assert_eq!(model.tick(0.5, Some(5)).mode, VehicleMode::AnomalyReaction);
        }
        assert_eq!(model.tick(0.5, Some(5)).mode, VehicleMode::Cruising);
    }

    #[test]
    fn test_anomaly_times_out_without_bus_recovery() {
        let mut model =
            VehicleModel::with_state(seeded(), VehicleMode::Cruising, 2200, 5);
        assert_eq!(model.tick(0.1, Some(2)).mode, VehicleMode::AnomalyReaction);

        // Bus silent on gear: only the 4s fail-safe releases it
        let mut ticks = 0;
        while model.mode() == VehicleMode::AnomalyReaction {
            model.tick(0.1, None);
            ticks += 1;
            assert!(ticks < 100, "anomaly reaction never timed out");
        }
        assert!(ticks >= 35, "released after {} ticks", ticks);
        let s = model.snapshot();
        assert_eq!((s.mode, s.gear, s.rpm), (VehicleMode::Cruising, 5, 2200));
    }

    #[test]
    fn test_anomaly_recovers_early_when_bus_shows_top_gear() {
        let config = VehicleConfig {
            p_start_braking: 0.0,
            ..seeded()
        };
        let mut model = VehicleModel::with_state(config, VehicleMode::Cruising, 2200, 5);
        model.tick(0.1, Some(2));
        for _ in 0..25 {
            model.tick(0.1, Some(5));
        }
        assert_eq!(model.mode(), VehicleMode::Cruising);
    }

    #[test]
    fn test_clamped_at_all_times() {
        let mut model = VehicleModel::new(VehicleConfig {
            redline_rpm: 7900,
            redline_jitter: 500,
            ..seeded()
        });
        let inputs = [None, Some(2), Some(5), Some(0)];
        for i in 0..2000 {
            let s = model.tick(0.05, inputs[i % inputs.len()]);
            assert!(s.rpm <= 8000);
            assert!(s.gear <= 5);
            assert!(s.brake_pedal <= 100);
        }
    }

    #[test]
    fn test_mode_tokens_round_trip() {
        for mode in [
            VehicleMode::Idle,
            VehicleMode::Accelerating,
            VehicleMode::Cruising,
            VehicleMode::Braking,
            VehicleMode::AnomalyReaction,
        ] {
            assert_eq!(VehicleMode::from_token(mode.as_str()), Some(mode));
        }
    }

    fn rpm_frame(rpm: u16) -> CanFrame {
        CanFrame::new(
            can_ids::ENGINE_RPM,
            encoding::encode_rpm(rpm).to_vec(),
            "Engine".into(),
            0.0,
        )
    }

    fn gear_frame(gear: u8) -> CanFrame {
        CanFrame::new(
            can_ids::TRANSMISSION,
            encoding::encode_gear(gear).to_vec(),
            "Trans".into(),
            0.0,
        )
    }

    #[test]
    fn test_shift_monitor_flags_lugging_upshift() {
        let mut monitor = ShiftMonitor::new();
        assert_eq!(monitor.observe(&gear_frame(1)), None);

        monitor.observe(&rpm_frame(2600));
        let up = monitor.observe(&gear_frame(2)).unwrap();
        assert_eq!(up.verdict, ShiftVerdict::Plausible);

        monitor.observe(&rpm_frame(1200));
        let lugging = monitor.observe(&gear_frame(3)).unwrap();
        assert_eq!(lugging.verdict, ShiftVerdict::Suspicious);

        monitor.observe(&rpm_frame(7200));
        let money_shift = monitor.observe(&gear_frame(2)).unwrap();
        assert_eq!(money_shift.verdict, ShiftVerdict::Suspicious);

        assert_eq!((monitor.plausible, monitor.suspicious), (1, 2));
    }
}
