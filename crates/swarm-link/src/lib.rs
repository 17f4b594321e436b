pub mod link;
pub mod mav;
pub mod sim;
pub mod state;

pub use link::{ActionControl, LinkError, MissionControl, TelemetrySource, VehicleLink};

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// MAVLink connection URLs, one hub per entry. Examples:
    /// "udpin:0.0.0.0:14540", "tcpout:127.0.0.1:5760", "serial:/dev/ttyUSB0:57600"
    #[serde(default)]
    pub addresses: Vec<String>,

    /// MAVLink ids we present as (ground station side)
    #[serde(default = "default_sys_id")]
    pub sys_id: u8,
    #[serde(default = "default_comp_id")]
    pub comp_id: u8,

    /// How long to wait for COMMAND_ACK / mission protocol replies.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Ground station heartbeat rate.
    #[serde(default = "default_heartbeat_hz")]
    pub heartbeat_hz: f32,
}

fn default_sys_id() -> u8 { 245 }
fn default_comp_id() -> u8 { 190 }
fn default_command_timeout_ms() -> u64 { 5000 }
fn default_heartbeat_hz() -> f32 { 1.0 }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            sys_id: default_sys_id(),
            comp_id: default_comp_id(),
            command_timeout_ms: default_command_timeout_ms(),
            heartbeat_hz: default_heartbeat_hz(),
        }
    }
}

impl LinkConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.heartbeat_hz.max(0.2))
    }
}
