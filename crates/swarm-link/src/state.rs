use std::time::{Duration, Instant};

/// Per-vehicle liveness as seen by the MAVLink reader.
#[derive(Debug, Clone, Default)]
pub struct VehicleStatus {
    pub last_heartbeat: Option<Instant>,
}

impl VehicleStatus {
    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }
}

/// Pre-flight checks folded into one readiness answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Health {
    pub gyro_ok: bool,
    pub accel_ok: bool,
    pub mag_ok: bool,
    pub global_position_ok: bool,
    pub home_position_ok: bool,
}

impl Health {
    pub fn all_ok(&self) -> bool {
        self.gyro_ok
            && self.accel_ok
            && self.mag_ok
            && self.global_position_ok
            && self.home_position_ok
    }
}
