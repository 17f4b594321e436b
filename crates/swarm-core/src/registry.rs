//! Fleet registry: every vehicle the gateway has ever discovered.
//!
//! Records are append-only. A vehicle that goes quiet keeps its id and its last
//! telemetry; liveness is read from the link's heartbeat age.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use swarm_link::mav::MavHub;
use swarm_link::{LinkConfig, VehicleLink};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::mission::MissionController;
use crate::telemetry::TelemetryCache;
use crate::{now_unix_ms, MissionConfig};

/// Registry-assigned handle, starting at 1 in discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VehicleId(u32);

impl VehicleId {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VehicleId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(VehicleId)
    }
}

pub struct Vehicle {
    id: VehicleId,
    link: Arc<dyn VehicleLink>,
    telemetry: TelemetryCache,
    mission: MissionController,
    discovered_unix_ms: i64,
}

pub type VehicleHandle = Arc<Vehicle>;

impl Vehicle {
    pub fn id(&self) -> VehicleId {
        self.id
    }

    pub fn link_id(&self) -> &str {
        self.link.link_id()
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.link.heartbeat_age()
    }

    pub fn telemetry(&self) -> &TelemetryCache {
        &self.telemetry
    }

    pub fn mission(&self) -> &MissionController {
        &self.mission
    }

    pub fn discovered_unix_ms(&self) -> i64 {
        self.discovered_unix_ms
    }
}

pub struct FleetRegistry {
    vehicles: RwLock<Vec<VehicleHandle>>,
    count: watch::Sender<usize>,
    mission_cfg: MissionConfig,
}

impl FleetRegistry {
    pub fn new(mission_cfg: MissionConfig) -> Self {
        Self { vehicles: RwLock::new(Vec::new()), count: watch::channel(0).0, mission_cfg }
    }

    /// Adds a vehicle and wires its telemetry. A link that is already known
    /// keeps its existing id. Must run inside a tokio runtime.
    pub fn register(&self, link: Arc<dyn VehicleLink>) -> VehicleId {
        let mut vehicles = self.vehicles.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(known) = vehicles.iter().find(|v| v.link_id() == link.link_id()) {
            warn!(vehicle = %known.id, link = link.link_id(), "link announced twice; keeping existing record");
            return known.id;
        }

        let id = VehicleId(vehicles.len() as u32 + 1);
        let telemetry = TelemetryCache::new();
        telemetry.wire(link.as_ref());
        let mission = MissionController::new(id, link.clone(), self.mission_cfg.clone());
        info!(vehicle = %id, link = link.link_id(), "vehicle registered");

        vehicles.push(Arc::new(Vehicle {
            id,
            link,
            telemetry,
            mission,
            discovered_unix_ms: now_unix_ms(),
        }));
        self.count.send_replace(vehicles.len());
        id
    }

    /// Ids in discovery order.
    pub fn list(&self) -> Vec<VehicleId> {
        self.vehicles.read().unwrap_or_else(PoisonError::into_inner).iter().map(|v| v.id).collect()
    }

    pub fn vehicles(&self) -> Vec<VehicleHandle> {
        self.vehicles.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: VehicleId) -> Result<VehicleHandle, CoreError> {
        let vehicles = self.vehicles.read().unwrap_or_else(PoisonError::into_inner);
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|i| vehicles.get(i))
            .cloned()
            .ok_or(CoreError::NotFound(id))
    }

    /// Earliest discovered vehicle, target of the unscoped endpoints.
    pub fn first(&self) -> Result<VehicleHandle, CoreError> {
        let vehicles = self.vehicles.read().unwrap_or_else(PoisonError::into_inner);
        vehicles.first().cloned().ok_or(CoreError::NoVehicles)
    }

    pub async fn wait_for_vehicle(&self, timeout: Duration) -> Result<VehicleId, CoreError> {
        let mut rx = self.count.subscribe();
        let seen = tokio::time::timeout(timeout, rx.wait_for(|n| *n > 0))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !seen {
            return Err(CoreError::DiscoveryTimeout(timeout));
        }
        self.first().map(|v| v.id)
    }

    /// Registers every link announced on `rx` until all senders are gone.
    pub async fn run_discovery(self: Arc<Self>, mut rx: mpsc::Receiver<Arc<dyn VehicleLink>>) {
        while let Some(link) = rx.recv().await {
            self.register(link);
        }
        info!("discovery channel closed");
    }

    /// Opens one MAVLink hub per configured address and feeds their
    /// discoveries into this registry. The hubs stop when dropped.
    pub fn connect(self: &Arc<Self>, cfg: &LinkConfig) -> Result<Vec<MavHub>, CoreError> {
        let (tx, rx) = mpsc::channel(16);
        let mut hubs = Vec::with_capacity(cfg.addresses.len());
        for address in &cfg.addresses {
            let hub = MavHub::connect(address, cfg, tx.clone()).map_err(|e| CoreError::Connection {
                address: address.clone(),
                reason: format!("{:#}", e),
            })?;
            hubs.push(hub);
        }
        tokio::spawn(self.clone().run_discovery(rx));
        Ok(hubs)
    }
}
