pub mod mission;
pub mod telemetry;

pub use mission::{MissionPlan, Waypoint};
pub use telemetry::{Altitude, Battery, Heading, MissionProgress, Position, TelemetrySnapshot};
