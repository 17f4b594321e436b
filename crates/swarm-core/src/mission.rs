//! Mission lifecycle of one vehicle.
//!
//! `start` only validates and schedules; the readiness wait, upload, arm and
//! start run in a background sequence whose outcome lands in [`MissionState`].
//! `pause`, `resume` and `abort` are forwarded to the vehicle immediately and
//! report the link's answer to the caller.
//!
//! Every sequence gets a fresh [`SequenceId`]. A sequence only writes state
//! while it is still the active one, and the check happens under the same lock
//! as the write, so an aborted sequence can never overwrite `Aborted`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use swarm_link::VehicleLink;
use swarm_proto::MissionPlan;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, MissionStep};
use crate::registry::VehicleId;
use crate::{now_unix_ms, MissionConfig};

pub type SequenceId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum MissionState {
    Idle,
    Uploading,
    Armed,
    Running,
    Paused,
    Aborted,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionStatus {
    #[serde(flatten)]
    pub state: MissionState,
    /// Last sequence accepted by `start`, if any.
    pub sequence: Option<SequenceId>,
    pub in_flight: bool,
    pub updated_unix_ms: i64,
}

struct Active {
    id: SequenceId,
    cancel: watch::Sender<bool>,
}

struct Inner {
    state: MissionState,
    issued: SequenceId,
    active: Option<Active>,
    updated_unix_ms: i64,
}

impl Inner {
    fn set(&mut self, state: MissionState) {
        self.state = state;
        self.updated_unix_ms = now_unix_ms();
    }

    fn is_active(&self, id: SequenceId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == id)
    }
}

fn lock(m: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MissionController {
    vehicle: VehicleId,
    link: Arc<dyn VehicleLink>,
    cfg: MissionConfig,
    inner: Arc<Mutex<Inner>>,
}

impl MissionController {
    pub fn new(vehicle: VehicleId, link: Arc<dyn VehicleLink>, cfg: MissionConfig) -> Self {
        let inner = Inner {
            state: MissionState::Idle,
            issued: 0,
            active: None,
            updated_unix_ms: now_unix_ms(),
        };
        Self { vehicle, link, cfg, inner: Arc::new(Mutex::new(inner)) }
    }

    pub fn state(&self) -> MissionState {
        lock(&self.inner).state.clone()
    }

    pub fn status(&self) -> MissionStatus {
        let inner = lock(&self.inner);
        MissionStatus {
            state: inner.state.clone(),
            sequence: (inner.issued > 0).then_some(inner.issued),
            in_flight: inner.active.is_some(),
            updated_unix_ms: inner.updated_unix_ms,
        }
    }

    /// Accepts `plan` and schedules the start sequence. Returns as soon as the
    /// sequence is scheduled; nothing has reached the vehicle yet.
    pub fn start(&self, plan: MissionPlan) -> Result<SequenceId, CoreError> {
        if plan.is_empty() {
            warn!(vehicle = %self.vehicle, "refusing to start an empty mission");
            return Err(CoreError::EmptyPlan);
        }

        let mut inner = lock(&self.inner);
        if inner.active.is_some() {
            return Err(CoreError::SequenceActive(self.vehicle));
        }
        inner.issued += 1;
        let id = inner.issued;
        let (cancel, cancelled) = watch::channel(false);
        inner.active = Some(Active { id, cancel });
        inner.set(MissionState::Uploading);

        let seq = Sequence {
            id,
            vehicle: self.vehicle,
            link: self.link.clone(),
            cfg: self.cfg.clone(),
            inner: self.inner.clone(),
            cancelled,
        };
        tokio::spawn(seq.run(plan));

        info!(vehicle = %self.vehicle, sequence = id, "mission start scheduled");
        Ok(id)
    }

    pub async fn pause(&self) -> Result<(), CoreError> {
        self.link.pause_mission().await.map_err(CoreError::command(MissionStep::Pause))?;
        let mut inner = lock(&self.inner);
        if matches!(inner.state, MissionState::Running | MissionState::Armed) {
            inner.set(MissionState::Paused);
        } else {
            debug!(vehicle = %self.vehicle, state = ?inner.state, "pause acknowledged; state kept");
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), CoreError> {
        self.link.start_mission().await.map_err(CoreError::command(MissionStep::Resume))?;
        let mut inner = lock(&self.inner);
        if inner.state == MissionState::Paused {
            inner.set(MissionState::Running);
        } else {
            debug!(vehicle = %self.vehicle, state = ?inner.state, "resume acknowledged; state kept");
        }
        Ok(())
    }

    /// Cancels any in-flight sequence, then clears the mission on the vehicle.
    pub async fn abort(&self) -> Result<(), CoreError> {
        let (cancelled, issued) = {
            let mut inner = lock(&self.inner);
            let cancelled = inner.active.take().map(|a| {
                let _ = a.cancel.send(true);
                a.id
            });
            (cancelled, inner.issued)
        };
        if let Some(id) = cancelled {
            info!(vehicle = %self.vehicle, sequence = id, "start sequence cancelled");
        }

        let cleared = self.link.clear_mission().await.map_err(CoreError::command(MissionStep::Clear));

        let mut inner = lock(&self.inner);
        if inner.issued != issued {
            // a newer start got in while clear was on the wire; it owns the state now
            return cleared;
        }
        match &cleared {
            Ok(()) => {
                info!(vehicle = %self.vehicle, "mission aborted");
                inner.set(MissionState::Aborted);
            }
            Err(e) if cancelled.is_some() => inner.set(MissionState::Failed(e.to_string())),
            Err(_) => {}
        }
        cleared
    }
}

enum Stop {
    Cancelled,
    /// State moved on underneath the sequence (e.g. a pause arrived while arming).
    Preempted,
    Failed(CoreError),
}

impl From<CoreError> for Stop {
    fn from(e: CoreError) -> Self {
        Stop::Failed(e)
    }
}

struct Sequence {
    id: SequenceId,
    vehicle: VehicleId,
    link: Arc<dyn VehicleLink>,
    cfg: MissionConfig,
    inner: Arc<Mutex<Inner>>,
    cancelled: watch::Receiver<bool>,
}

async fn or_cancel<T>(cancelled: &mut watch::Receiver<bool>, fut: impl Future<Output = T>) -> Result<T, Stop> {
    tokio::select! {
        biased;
        _ = cancelled.wait_for(|c| *c) => Err(Stop::Cancelled),
        out = fut => Ok(out),
    }
}

impl Sequence {
    async fn run(mut self, plan: MissionPlan) {
        let outcome = self.drive(&plan).await;

        let mut inner = lock(&self.inner);
        if !inner.is_active(self.id) {
            debug!(vehicle = %self.vehicle, sequence = self.id, "sequence ended after cancel");
            return;
        }
        inner.active = None;
        match outcome {
            Ok(()) => info!(
                vehicle = %self.vehicle,
                sequence = self.id,
                waypoints = plan.len(),
                state = ?inner.state,
                "start sequence finished"
            ),
            Err(Stop::Failed(e)) => {
                warn!(vehicle = %self.vehicle, sequence = self.id, "mission start failed: {}", e);
                inner.set(MissionState::Failed(e.to_string()));
            }
            Err(Stop::Preempted) => {
                debug!(vehicle = %self.vehicle, sequence = self.id, state = ?inner.state, "sequence preempted")
            }
            Err(Stop::Cancelled) => {}
        }
    }

    async fn drive(&mut self, plan: &MissionPlan) -> Result<(), Stop> {
        self.wait_ready().await?;

        or_cancel(&mut self.cancelled, self.link.upload_mission(plan))
            .await?
            .map_err(CoreError::command(MissionStep::Upload))?;
        or_cancel(&mut self.cancelled, self.link.arm())
            .await?
            .map_err(CoreError::command(MissionStep::Arm))?;
        self.advance(MissionState::Uploading, MissionState::Armed)?;

        or_cancel(&mut self.cancelled, self.link.start_mission())
            .await?
            .map_err(CoreError::command(MissionStep::Start))?;
        match self.advance(MissionState::Armed, MissionState::Running) {
            Err(Stop::Preempted) if self.paused() => self.hold_pause().await,
            other => other,
        }
    }

    fn paused(&self) -> bool {
        lock(&self.inner).state == MissionState::Paused
    }

    /// A pause accepted while start was on the wire may have reached the vehicle
    /// before the start did. Pause again so the vehicle matches `Paused`.
    async fn hold_pause(&mut self) -> Result<(), Stop> {
        info!(vehicle = %self.vehicle, sequence = self.id, "pause arrived during start; pausing again");
        or_cancel(&mut self.cancelled, self.link.pause_mission())
            .await?
            .map_err(CoreError::command(MissionStep::Pause))?;
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<(), Stop> {
        let limit = self.cfg.readiness_timeout();
        let deadline = Instant::now() + limit;
        let mut tick = tokio::time::interval(self.cfg.readiness_poll());
        loop {
            or_cancel(&mut self.cancelled, tick.tick()).await?;
            if self.link.health_all_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::NotReady(limit).into());
            }
            debug!(vehicle = %self.vehicle, sequence = self.id, "waiting for vehicle to become ready");
        }
    }

    fn advance(&self, from: MissionState, to: MissionState) -> Result<(), Stop> {
        let mut inner = lock(&self.inner);
        if !inner.is_active(self.id) {
            return Err(Stop::Cancelled);
        }
        if inner.state != from {
            return Err(Stop::Preempted);
        }
        inner.set(to);
        Ok(())
    }
}
