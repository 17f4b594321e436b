pub mod doctor;
pub mod error;
pub mod mission;
pub mod plan;
pub mod registry;
pub mod telemetry;

pub use error::{CoreError, MissionStep};
pub use mission::{MissionController, MissionState, MissionStatus, SequenceId};
pub use registry::{FleetRegistry, Vehicle, VehicleHandle, VehicleId};
pub use telemetry::TelemetryCache;

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct MissionConfig {
    /// Readiness check interval while a start sequence waits for the vehicle.
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,

    /// Give up on a start sequence when the vehicle is still not ready.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
}

fn default_readiness_poll_ms() -> u64 { 1000 }
fn default_readiness_timeout_ms() -> u64 { 60_000 }

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            readiness_poll_ms: default_readiness_poll_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
        }
    }
}

impl MissionConfig {
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
