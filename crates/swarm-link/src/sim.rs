//! In-process vehicle that behaves like a link without any radio behind it.
//!
//! Used by the test suites and by `swarm serve` when `[sim] vehicles > 0`.
//! Every call is recorded; any step can be made to fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use swarm_proto::{Altitude, Battery, Heading, MissionPlan, MissionProgress, Position};
use tokio::sync::watch;
use tracing::debug;

use crate::link::{ActionControl, LinkError, MissionControl, TelemetrySource, VehicleLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimStep {
    Upload,
    Arm,
    Start,
    Pause,
    Clear,
}

impl SimStep {
    fn command(self) -> &'static str {
        match self {
            SimStep::Upload => "upload_mission",
            SimStep::Arm => "arm",
            SimStep::Start => "start_mission",
            SimStep::Pause => "pause_mission",
            SimStep::Clear => "clear_mission",
        }
    }
}

pub struct SimLink {
    link_id: String,
    position: watch::Sender<Position>,
    progress: watch::Sender<MissionProgress>,
    battery: watch::Sender<Battery>,
    altitude: watch::Sender<Altitude>,
    heading: watch::Sender<Heading>,
    healthy: AtomicBool,
    flying: AtomicBool,
    failures: Mutex<HashMap<SimStep, LinkError>>,
    delays: Mutex<HashMap<SimStep, Duration>>,
    calls: Mutex<Vec<SimStep>>,
    uploaded: Mutex<Option<MissionPlan>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimLink {
    /// A healthy vehicle sitting at the origin.
    pub fn new(link_id: impl Into<String>) -> Self {
        Self {
            link_id: link_id.into(),
            position: watch::channel(Position::default()).0,
            progress: watch::channel(MissionProgress::default()).0,
            battery: watch::channel(Battery::default()).0,
            altitude: watch::channel(Altitude::default()).0,
            heading: watch::channel(Heading::default()).0,
            healthy: AtomicBool::new(true),
            flying: AtomicBool::new(false),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            uploaded: Mutex::new(None),
        }
    }

    pub fn set_healthy(&self, ok: bool) {
        self.healthy.store(ok, Ordering::SeqCst);
    }

    /// Makes every later call of `step` fail with `err`.
    pub fn fail_on(&self, step: SimStep, err: LinkError) {
        lock(&self.failures).insert(step, err);
    }

    /// Makes every later call of `step` take `delay` before it answers.
    pub fn delay_on(&self, step: SimStep, delay: Duration) {
        lock(&self.delays).insert(step, delay);
    }

    pub fn is_flying(&self) -> bool {
        self.flying.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<SimStep> {
        lock(&self.calls).clone()
    }

    pub fn uploaded_plan(&self) -> Option<MissionPlan> {
        lock(&self.uploaded).clone()
    }

    pub fn publish_position(&self, p: Position) {
        self.position.send_replace(p);
    }

    pub fn publish_mission_progress(&self, p: MissionProgress) {
        self.progress.send_replace(p);
    }

    pub fn publish_battery(&self, b: Battery) {
        self.battery.send_replace(b);
    }

    pub fn publish_altitude(&self, a: Altitude) {
        self.altitude.send_replace(a);
    }

    pub fn publish_heading(&self, h: Heading) {
        self.heading.send_replace(h);
    }

    /// Advances a running mission by one waypoint and drains a little battery.
    pub fn tick(&self) {
        if !self.flying.load(Ordering::SeqCst) {
            return;
        }
        self.progress.send_modify(|p| {
            if p.current < p.total {
                p.current += 1;
            }
        });
        self.battery.send_modify(|b| b.remaining_percent = (b.remaining_percent - 0.5).max(0.0));
        let p = *self.progress.borrow();
        if p.current >= p.total {
            self.flying.store(false, Ordering::SeqCst);
        }
    }

    async fn record(&self, step: SimStep) -> Result<(), LinkError> {
        lock(&self.calls).push(step);
        debug!(link = %self.link_id, command = step.command(), "sim call");
        let delay = lock(&self.delays).get(&step).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match lock(&self.failures).get(&step) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MissionControl for SimLink {
    async fn upload_mission(&self, plan: &MissionPlan) -> Result<(), LinkError> {
        self.record(SimStep::Upload).await?;
        *lock(&self.uploaded) = Some(plan.clone());
        self.progress.send_replace(MissionProgress { current: 0, total: plan.len() as i32 });
        Ok(())
    }

    async fn start_mission(&self) -> Result<(), LinkError> {
        self.record(SimStep::Start).await?;
        self.flying.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn pause_mission(&self) -> Result<(), LinkError> {
        self.record(SimStep::Pause).await?;
        self.flying.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_mission(&self) -> Result<(), LinkError> {
        self.record(SimStep::Clear).await?;
        self.flying.store(false, Ordering::SeqCst);
        *lock(&self.uploaded) = None;
        self.progress.send_replace(MissionProgress::default());
        Ok(())
    }
}

#[async_trait]
impl ActionControl for SimLink {
    async fn arm(&self) -> Result<(), LinkError> {
        self.record(SimStep::Arm).await
    }
}

impl TelemetrySource for SimLink {
    fn subscribe_position(&self) -> watch::Receiver<Position> {
        self.position.subscribe()
    }

    fn subscribe_mission_progress(&self) -> watch::Receiver<MissionProgress> {
        self.progress.subscribe()
    }

    fn subscribe_battery(&self) -> watch::Receiver<Battery> {
        self.battery.subscribe()
    }

    fn subscribe_altitude(&self) -> watch::Receiver<Altitude> {
        self.altitude.subscribe()
    }

    fn subscribe_heading(&self) -> watch::Receiver<Heading> {
        self.heading.subscribe()
    }

    fn health_all_ok(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl VehicleLink for SimLink {
    fn link_id(&self) -> &str {
        &self.link_id
    }

    fn heartbeat_age(&self) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Builds `n` healthy simulated vehicles parked around `home`.
pub fn fleet(n: usize, home: Position) -> Vec<Arc<SimLink>> {
    (0..n)
        .map(|i| {
            let link = SimLink::new(format!("sim:{}", i + 1));
            link.publish_position(Position {
                latitude: home.latitude + i as f64 * 1e-4,
                longitude: home.longitude,
            });
            link.publish_battery(Battery { remaining_percent: 100.0, voltage_v: 16.8 });
            Arc::new(link)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_proto::Waypoint;

    #[tokio::test]
    async fn test_records_calls_and_injects_failures() {
        let link = SimLink::new("sim:t");
        link.fail_on(SimStep::Arm, LinkError::Rejected { command: "arm", result: "DENIED".into() });

        let plan = MissionPlan::new(vec![Waypoint::new(1.0, 2.0, 3.0)]);
        assert!(link.upload_mission(&plan).await.is_ok());
        assert!(link.arm().await.is_err());
        assert_eq!(link.calls(), vec![SimStep::Upload, SimStep::Arm]);
        assert_eq!(link.uploaded_plan(), Some(plan));
    }

    #[tokio::test]
    async fn test_tick_advances_only_while_flying() {
        let link = SimLink::new("sim:t");
        let plan = MissionPlan::new(vec![Waypoint::new(1.0, 2.0, 3.0), Waypoint::new(1.1, 2.1, 3.0)]);
        link.upload_mission(&plan).await.unwrap();

        link.tick();
        assert_eq!(link.progress.borrow().current, 0);

        link.start_mission().await.unwrap();
        link.tick();
        link.tick();
        link.tick();
        assert_eq!(*link.progress.borrow(), MissionProgress { current: 2, total: 2 });
        assert!(!link.is_flying());
    }

    #[tokio::test]
    async fn test_delayed_step_answers_late() {
        let link = SimLink::new("sim:t");
        link.delay_on(SimStep::Start, Duration::from_millis(30));

        let started = tokio::time::Instant::now();
        link.start_mission().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(link.is_flying());
    }

    #[test]
    fn test_fleet_spreads_vehicles() {
        let links = fleet(3, Position { latitude: 47.0, longitude: 8.0 });
        assert_eq!(links.len(), 3);
        assert_eq!(links[2].link_id(), "sim:3");
        assert!(links[1].position.borrow().latitude > links[0].position.borrow().latitude);
    }
}
