use serde::{Deserialize, Serialize};

/// One point of a flight plan, altitude relative to home.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
    pub relative_altitude: f32,
}

impl Waypoint {
    pub fn new(latitude: f64, longitude: f64, relative_altitude: f32) -> Self {
        Self { latitude, longitude, relative_altitude }
    }
}

/// Ordered waypoints. An empty plan is a legal value but is never flown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionPlan {
    waypoints: Vec<Waypoint>,
}

impl MissionPlan {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        Self { waypoints }
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }
}
