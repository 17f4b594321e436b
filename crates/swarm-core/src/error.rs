use std::fmt;
use std::time::Duration;

use swarm_link::LinkError;
use thiserror::Error;

use crate::registry::VehicleId;

/// Vehicle interaction a mission command was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionStep {
    Upload,
    Arm,
    Start,
    Pause,
    Resume,
    Clear,
}

impl fmt::Display for MissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MissionStep::Upload => "upload_mission",
            MissionStep::Arm => "arm",
            MissionStep::Start => "start_mission",
            MissionStep::Pause => "pause_mission",
            MissionStep::Resume => "resume_mission",
            MissionStep::Clear => "clear_mission",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("cannot reach vehicle link {address}: {reason}")]
    Connection { address: String, reason: String },

    #[error("no vehicle discovered within {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("no vehicle connected")]
    NoVehicles,

    #[error("vehicle not ready after {0:?}")]
    NotReady(Duration),

    #[error("{step} failed: {source}")]
    Command {
        step: MissionStep,
        #[source]
        source: LinkError,
    },

    #[error("mission plan has no waypoints")]
    EmptyPlan,

    #[error("vehicle {0} already has a mission sequence in flight")]
    SequenceActive(VehicleId),

    #[error("unknown vehicle {0}")]
    NotFound(VehicleId),
}

impl CoreError {
    pub(crate) fn command(step: MissionStep) -> impl FnOnce(LinkError) -> CoreError {
        move |source| CoreError::Command { step, source }
    }
}
