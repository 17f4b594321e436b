//! Vehicle link contract.
//!
//! The rest of the gateway only sees these traits. A link is split by capability:
//! telemetry streams, mission control and vehicle actions. `VehicleLink` bundles
//! all three with an identity so the registry can hold `Arc<dyn VehicleLink>`.

use std::time::Duration;

use async_trait::async_trait;
use swarm_proto::{Altitude, Battery, Heading, MissionPlan, MissionProgress, Position};
use thiserror::Error;
use tokio::sync::watch;

/// Failure of a single link call. Callers treat it as opaque and terminal for
/// the step that produced it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("{command} rejected by vehicle: {result}")]
    Rejected { command: &'static str, result: String },

    #[error("{command}: no reply from vehicle")]
    Timeout { command: &'static str },

    #[error("link transport: {0}")]
    Transport(String),

    #[error("link closed")]
    Closed,
}

/// Telemetry push streams. Each receiver always holds the latest value, so a
/// slow reader skips intermediate values instead of queueing them.
pub trait TelemetrySource: Send + Sync {
    fn subscribe_position(&self) -> watch::Receiver<Position>;
    fn subscribe_mission_progress(&self) -> watch::Receiver<MissionProgress>;
    fn subscribe_battery(&self) -> watch::Receiver<Battery>;
    fn subscribe_altitude(&self) -> watch::Receiver<Altitude>;
    fn subscribe_heading(&self) -> watch::Receiver<Heading>;

    /// Readiness check gating mission start.
    fn health_all_ok(&self) -> bool;
}

#[async_trait]
pub trait MissionControl: Send + Sync {
    async fn upload_mission(&self, plan: &MissionPlan) -> Result<(), LinkError>;
    /// Starts the uploaded mission, or resumes it from the current item.
    async fn start_mission(&self) -> Result<(), LinkError>;
    async fn pause_mission(&self) -> Result<(), LinkError>;
    async fn clear_mission(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait ActionControl: Send + Sync {
    async fn arm(&self) -> Result<(), LinkError>;
}

pub trait VehicleLink: TelemetrySource + MissionControl + ActionControl + 'static {
    /// Stable name of the physical connection, e.g. "udpin:0.0.0.0:14540/sys1".
    fn link_id(&self) -> &str;

    /// Time since the vehicle last proved it is alive, if it ever did.
    fn heartbeat_age(&self) -> Option<Duration>;
}
