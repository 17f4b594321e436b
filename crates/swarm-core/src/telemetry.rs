//! Per-vehicle latest-value telemetry.
//!
//! Each facet has its own slot and its own forwarding task, so a burst of
//! position updates never delays battery or heading. Readers copy a value out
//! under a short read lock and never observe a half-written record.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use swarm_link::TelemetrySource;
use swarm_proto::{Altitude, Battery, Heading, MissionProgress, Position, TelemetrySnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

type Slot<T> = Arc<RwLock<T>>;

#[derive(Default)]
pub struct TelemetryCache {
    position: Slot<Position>,
    progress: Slot<MissionProgress>,
    battery: Slot<Battery>,
    altitude: Slot<Altitude>,
    heading: Slot<Heading>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn read<T: Copy>(slot: &Slot<T>) -> T {
    *slot.read().unwrap_or_else(PoisonError::into_inner)
}

fn forward<T>(facet: &'static str, mut rx: watch::Receiver<T>, slot: Slot<T>) -> JoinHandle<()>
where
    T: Copy + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let value = *rx.borrow_and_update();
            *slot.write().unwrap_or_else(PoisonError::into_inner) = value;
            if rx.changed().await.is_err() {
                trace!(facet, "telemetry stream ended");
                break;
            }
        }
    })
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every stream of `link`. Must run inside a tokio runtime.
    pub fn wire(&self, link: &dyn TelemetrySource) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(forward("position", link.subscribe_position(), self.position.clone()));
        tasks.push(forward("mission_progress", link.subscribe_mission_progress(), self.progress.clone()));
        tasks.push(forward("battery", link.subscribe_battery(), self.battery.clone()));
        tasks.push(forward("altitude", link.subscribe_altitude(), self.altitude.clone()));
        tasks.push(forward("heading", link.subscribe_heading(), self.heading.clone()));
    }

    pub fn position(&self) -> Position {
        read(&self.position)
    }

    pub fn mission_progress(&self) -> MissionProgress {
        read(&self.progress)
    }

    pub fn battery(&self) -> Battery {
        read(&self.battery)
    }

    pub fn altitude(&self) -> Altitude {
        read(&self.altitude)
    }

    pub fn heading(&self) -> Heading {
        read(&self.heading)
    }

    /// Facets are read one after another; the snapshot is per-facet consistent only.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            position: self.position(),
            mission_progress: self.mission_progress(),
            battery: self.battery(),
            altitude: self.altitude(),
            heading: self.heading(),
        }
    }
}

impl Drop for TelemetryCache {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}
