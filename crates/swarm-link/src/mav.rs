//! MAVLink implementation of [`VehicleLink`].
//!
//! One [`MavHub`] owns one MAVLink connection. Several vehicles may share it
//! (e.g. a SITL swarm behind one UDP port); the reader thread demultiplexes by
//! system id and announces every new autopilot on the discovery channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use mavlink::{
    common::{
        GpsFixType, MavAutopilot, MavCmd, MavFrame, MavMessage, MavMissionResult, MavModeFlag,
        MavResult, MavState, MavSysStatusSensor, MavType, COMMAND_LONG_DATA, HEARTBEAT_DATA,
        MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA, SYS_STATUS_DATA,
    },
    MavConnection, MavHeader,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use swarm_proto::{Altitude, Battery, Heading, MissionPlan, MissionProgress, Position, Waypoint};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::link::{ActionControl, LinkError, MissionControl, TelemetrySource, VehicleLink};
use crate::state::{Health, VehicleStatus};
use crate::LinkConfig;

type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// Autopilots identify as component 1 (MAV_COMP_ID_AUTOPILOT1).
const AUTOPILOT_COMPONENT: u8 = 1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MavHub {
    stop: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl MavHub {
    /// Opens `address` and starts the reader and ground-station heartbeat.
    /// Fails when the address cannot be opened; vehicles show up later on
    /// `discovered`.
    pub fn connect(
        address: &str,
        cfg: &LinkConfig,
        discovered: mpsc::Sender<Arc<dyn VehicleLink>>,
    ) -> Result<Self> {
        if let Some((dev, baud)) = parse_serial(address) {
            // quick validate device
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open serial device {}", dev))?;
        }

        let conn: Conn = Arc::from(
            mavlink::connect::<MavMessage>(address)
                .with_context(|| format!("mavlink connect {}", address))?,
        );
        let out = Arc::new(Outbound {
            conn: conn.clone(),
            hdr: Mutex::new(MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 }),
        });
        let stop = Arc::new(AtomicBool::new(false));

        // Reader loop in a blocking task (mavlink recv blocks).
        {
            let address = address.to_string();
            let out = out.clone();
            let stop = stop.clone();
            let cfg = cfg.clone();
            tokio::task::spawn_blocking(move || read_loop(address, conn, out, cfg, stop, discovered));
        }

        let heartbeat = {
            let out = out.clone();
            let every = cfg.heartbeat_interval();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                loop {
                    tick.tick().await;
                    if let Err(e) = out.send_heartbeat() {
                        debug!("gcs heartbeat send failed: {:#}", e);
                    }
                }
            })
        };

        info!(address, "mavlink hub listening");
        Ok(Self { stop, heartbeat })
    }
}

impl Drop for MavHub {
    fn drop(&mut self) {
        // The reader notices on its next receive.
        self.stop.store(true, Ordering::Relaxed);
        self.heartbeat.abort();
    }
}

/// "serial:/dev/ttyUSB0:57600" -> ("/dev/ttyUSB0", 57600)
fn parse_serial(address: &str) -> Option<(&str, u32)> {
    let rest = address.strip_prefix("serial:")?;
    let (dev, baud) = rest.rsplit_once(':')?;
    Some((dev, baud.parse().ok()?))
}

fn read_loop(
    address: String,
    conn: Conn,
    out: Arc<Outbound>,
    cfg: LinkConfig,
    stop: Arc<AtomicBool>,
    discovered: mpsc::Sender<Arc<dyn VehicleLink>>,
) {
    let mut vehicles: HashMap<u8, Arc<Shared>> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        let (hdr, msg) = match conn.recv() {
            Ok(frame) => frame,
            Err(e) => {
                debug!(address = %address, "mavlink recv: {:?}", e);
                // Light sleep to avoid busy loop on a dead transport
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        if let Some(shared) = vehicles.get(&hdr.system_id) {
            if hdr.component_id == AUTOPILOT_COMPONENT {
                shared.handle(&msg);
            }
            continue;
        }

        let MavMessage::HEARTBEAT(hb) = &msg else { continue };
        if !is_vehicle(&hdr, hb, cfg.sys_id) {
            continue;
        }

        let vehicle = MavVehicle::new(
            format!("{}/sys{}", address, hdr.system_id),
            (hdr.system_id, hdr.component_id),
            out.clone(),
            cfg.command_timeout(),
        );
        vehicle.shared.handle(&msg);
        vehicles.insert(hdr.system_id, vehicle.shared.clone());
        info!(link = %vehicle.link_id, autopilot = ?hb.autopilot, "new vehicle discovered");

        if discovered.blocking_send(Arc::new(vehicle)).is_err() {
            warn!(address = %address, "discovery channel closed; stopping reader");
            break;
        }
    }
}

fn is_vehicle(hdr: &MavHeader, hb: &HEARTBEAT_DATA, own_sys_id: u8) -> bool {
    hdr.system_id != own_sys_id
        && hdr.component_id == AUTOPILOT_COMPONENT
        && !matches!(hb.mavtype, MavType::MAV_TYPE_GCS | MavType::MAV_TYPE_ONBOARD_CONTROLLER)
        && !matches!(hb.autopilot, MavAutopilot::MAV_AUTOPILOT_INVALID)
}

struct Outbound {
    conn: Conn,
    hdr: Mutex<MavHeader>,
}

impl Outbound {
    fn send(&self, msg: &MavMessage) -> Result<()> {
        let hdr = {
            let mut hdr = lock(&self.hdr);
            hdr.sequence = hdr.sequence.wrapping_add(1);
            hdr.clone()
        };
        self.conn.send(&hdr, msg).context("mavlink send")?;
        Ok(())
    }

    fn send_heartbeat(&self) -> Result<()> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(&MavMessage::HEARTBEAT(hb))
    }
}

#[derive(Debug)]
enum MissionReply {
    Request(u16),
    Ack(MavMissionResult),
}

/// State the reader thread writes and the async side reads.
struct Shared {
    position: watch::Sender<Position>,
    progress: watch::Sender<MissionProgress>,
    battery: watch::Sender<Battery>,
    altitude: watch::Sender<Altitude>,
    heading: watch::Sender<Heading>,
    health: Mutex<Health>,
    status: Mutex<VehicleStatus>,
    acks: Mutex<HashMap<u16, oneshot::Sender<MavResult>>>,
    replies: mpsc::UnboundedSender<MissionReply>,
}

impl Shared {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MissionReply>) {
        let (replies, rx) = mpsc::unbounded_channel();
        let shared = Self {
            position: watch::channel(Position::default()).0,
            progress: watch::channel(MissionProgress::default()).0,
            battery: watch::channel(Battery::default()).0,
            altitude: watch::channel(Altitude::default()).0,
            heading: watch::channel(Heading::default()).0,
            health: Mutex::new(Health::default()),
            status: Mutex::new(VehicleStatus::default()),
            acks: Mutex::new(HashMap::new()),
            replies,
        };
        (Arc::new(shared), rx)
    }

    fn handle(&self, msg: &MavMessage) {
        match msg {
            MavMessage::HEARTBEAT(_) => {
                let mut st = lock(&self.status);
                st.last_heartbeat = Some(Instant::now());
            }
            MavMessage::GLOBAL_POSITION_INT(d) => {
                self.position.send_replace(Position {
                    latitude: d.lat as f64 / 1e7,
                    longitude: d.lon as f64 / 1e7,
                });
                // mm -> m
                self.altitude.send_replace(Altitude {
                    relative_m: d.relative_alt as f32 / 1000.0,
                    sea_level_m: d.alt as f32 / 1000.0,
                });
                if d.hdg != u16::MAX {
                    self.heading.send_replace(Heading { degrees: d.hdg as f64 / 100.0 });
                }
            }
            MavMessage::SYS_STATUS(s) => {
                self.update_battery(s);
                let mut h = lock(&self.health);
                h.gyro_ok = sensor_ok(s, MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_GYRO);
                h.accel_ok = sensor_ok(s, MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_ACCEL);
                h.mag_ok = sensor_ok(s, MavSysStatusSensor::MAV_SYS_STATUS_SENSOR_3D_MAG);
            }
            MavMessage::GPS_RAW_INT(g) => {
                lock(&self.health).global_position_ok =
                    g.fix_type as u8 >= GpsFixType::GPS_FIX_TYPE_3D_FIX as u8;
            }
            MavMessage::HOME_POSITION(_) => {
                lock(&self.health).home_position_ok = true;
            }
            MavMessage::MISSION_CURRENT(m) => {
                self.progress.send_modify(|p| p.current = m.seq as i32);
            }
            MavMessage::COMMAND_ACK(ack) => {
                if matches!(ack.result, MavResult::MAV_RESULT_IN_PROGRESS) {
                    return;
                }
                if let Some(tx) = lock(&self.acks).remove(&(ack.command as u16)) {
                    let _ = tx.send(ack.result);
                }
            }
            MavMessage::MISSION_REQUEST_INT(r) => {
                let _ = self.replies.send(MissionReply::Request(r.seq));
            }
            MavMessage::MISSION_REQUEST(r) => {
                let _ = self.replies.send(MissionReply::Request(r.seq));
            }
            MavMessage::MISSION_ACK(a) => {
                let _ = self.replies.send(MissionReply::Ack(a.mavtype));
            }
            _ => {}
        }
    }

    fn update_battery(&self, status: &SYS_STATUS_DATA) {
        self.battery.send_modify(|b| {
            // voltage_battery is in millivolts, u16::MAX means unknown
            if status.voltage_battery != u16::MAX {
                b.voltage_v = status.voltage_battery as f32 / 1000.0;
            }
            // battery_remaining is percentage 0-100, -1 means invalid
            if (0..=100).contains(&status.battery_remaining) {
                b.remaining_percent = status.battery_remaining as f32;
            }
        });
    }
}

fn sensor_ok(s: &SYS_STATUS_DATA, sensor: MavSysStatusSensor) -> bool {
    !s.onboard_control_sensors_present.contains(sensor)
        || s.onboard_control_sensors_health.contains(sensor)
}

pub struct MavVehicle {
    link_id: String,
    target_sys: u8,
    target_comp: u8,
    out: Arc<Outbound>,
    shared: Arc<Shared>,
    /// Mission protocol replies; the lock keeps one transfer at a time.
    replies: tokio::sync::Mutex<mpsc::UnboundedReceiver<MissionReply>>,
    command_timeout: Duration,
}

impl MavVehicle {
    fn new(link_id: String, (target_sys, target_comp): (u8, u8), out: Arc<Outbound>, command_timeout: Duration) -> Self {
        let (shared, replies) = Shared::new();
        Self {
            link_id,
            target_sys,
            target_comp,
            out,
            shared,
            replies: tokio::sync::Mutex::new(replies),
            command_timeout,
        }
    }

    fn send(&self, msg: MavMessage) -> Result<(), LinkError> {
        self.out.send(&msg).map_err(|e| LinkError::Transport(format!("{:#}", e)))
    }

    async fn command_long(&self, name: &'static str, command: MavCmd, params: [f32; 7]) -> Result<(), LinkError> {
        let key = command as u16;
        let (tx, rx) = oneshot::channel();
        // Register the waiter before sending so a fast ACK is not lost. COMMAND_ACK
        // only names the command, so a second waiter could not be told apart.
        match lock(&self.shared.acks).entry(key) {
            Entry::Occupied(_) => {
                return Err(LinkError::Transport(format!("{} already awaiting acknowledgement", name)));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let cmd = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        };
        debug!(link = %self.link_id, command = name, "sending COMMAND_LONG");
        if let Err(e) = self.send(MavMessage::COMMAND_LONG(cmd)) {
            lock(&self.shared.acks).remove(&key);
            return Err(e);
        }

        match timeout(self.command_timeout, rx).await {
            Ok(Ok(MavResult::MAV_RESULT_ACCEPTED)) => Ok(()),
            Ok(Ok(result)) => Err(LinkError::Rejected { command: name, result: format!("{:?}", result) }),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                lock(&self.shared.acks).remove(&key);
                Err(LinkError::Timeout { command: name })
            }
        }
    }

    async fn next_reply(
        &self,
        name: &'static str,
        replies: &mut mpsc::UnboundedReceiver<MissionReply>,
    ) -> Result<MissionReply, LinkError> {
        match timeout(self.command_timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(LinkError::Closed),
            Err(_) => Err(LinkError::Timeout { command: name }),
        }
    }

    fn mission_item(&self, seq: u16, wp: &Waypoint) -> MISSION_ITEM_INT_DATA {
        MISSION_ITEM_INT_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            seq,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            current: 0,
            autocontinue: 1,
            // hold time 0, acceptance radius left to the autopilot; stop at each point
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: f32::NAN,
            x: (wp.latitude * 1e7).round() as i32,
            y: (wp.longitude * 1e7).round() as i32,
            z: wp.relative_altitude,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MissionControl for MavVehicle {
    async fn upload_mission(&self, plan: &MissionPlan) -> Result<(), LinkError> {
        const NAME: &str = "upload_mission";
        let count = u16::try_from(plan.len())
            .map_err(|_| LinkError::Rejected { command: NAME, result: "too many waypoints".into() })?;

        let mut replies = self.replies.lock().await;
        while replies.try_recv().is_ok() {}

        self.send(MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            count,
            ..Default::default()
        }))?;

        loop {
            match self.next_reply(NAME, &mut replies).await? {
                MissionReply::Request(seq) => {
                    let wp = plan.waypoints().get(seq as usize).ok_or_else(|| LinkError::Rejected {
                        command: NAME,
                        result: format!("vehicle requested item {} of {}", seq, count),
                    })?;
                    self.send(MavMessage::MISSION_ITEM_INT(self.mission_item(seq, wp)))?;
                }
                MissionReply::Ack(MavMissionResult::MAV_MISSION_ACCEPTED) => {
                    self.shared.progress.send_replace(MissionProgress { current: 0, total: count as i32 });
                    info!(link = %self.link_id, waypoints = count, "mission uploaded");
                    return Ok(());
                }
                MissionReply::Ack(result) => {
                    return Err(LinkError::Rejected { command: NAME, result: format!("{:?}", result) });
                }
            }
        }
    }

    async fn start_mission(&self) -> Result<(), LinkError> {
        let p = *self.shared.progress.borrow();
        let first = p.current.max(0) as f32;
        let last = (p.total - 1).max(0) as f32;
        self.command_long("start_mission", MavCmd::MAV_CMD_MISSION_START, [first, last, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }

    async fn pause_mission(&self) -> Result<(), LinkError> {
        self.command_long("pause_mission", MavCmd::MAV_CMD_DO_PAUSE_CONTINUE, [0.0; 7]).await
    }

    async fn clear_mission(&self) -> Result<(), LinkError> {
        const NAME: &str = "clear_mission";
        let mut replies = self.replies.lock().await;
        while replies.try_recv().is_ok() {}

        self.send(MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            ..Default::default()
        }))?;

        loop {
            match self.next_reply(NAME, &mut replies).await? {
                MissionReply::Ack(MavMissionResult::MAV_MISSION_ACCEPTED) => {
                    self.shared.progress.send_replace(MissionProgress::default());
                    return Ok(());
                }
                MissionReply::Ack(result) => {
                    return Err(LinkError::Rejected { command: NAME, result: format!("{:?}", result) });
                }
                // stray request from an interrupted upload
                MissionReply::Request(_) => continue,
            }
        }
    }
}

#[async_trait]
impl ActionControl for MavVehicle {
    async fn arm(&self) -> Result<(), LinkError> {
        self.command_long("arm", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .await
    }
}

impl TelemetrySource for MavVehicle {
    fn subscribe_position(&self) -> watch::Receiver<Position> {
        self.shared.position.subscribe()
    }

    fn subscribe_mission_progress(&self) -> watch::Receiver<MissionProgress> {
        self.shared.progress.subscribe()
    }

    fn subscribe_battery(&self) -> watch::Receiver<Battery> {
        self.shared.battery.subscribe()
    }

    fn subscribe_altitude(&self) -> watch::Receiver<Altitude> {
        self.shared.altitude.subscribe()
    }

    fn subscribe_heading(&self) -> watch::Receiver<Heading> {
        self.shared.heading.subscribe()
    }

    fn health_all_ok(&self) -> bool {
        lock(&self.shared.health).all_ok()
    }
}

impl VehicleLink for MavVehicle {
    fn link_id(&self) -> &str {
        &self.link_id
    }

    fn heartbeat_age(&self) -> Option<Duration> {
        lock(&self.shared.status).hb_age()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        COMMAND_ACK_DATA, GLOBAL_POSITION_INT_DATA, MISSION_ACK_DATA, MISSION_CURRENT_DATA,
        MISSION_REQUEST_DATA, MISSION_REQUEST_INT_DATA,
    };
    use mavlink::error::{MessageReadError, MessageWriteError};
    use mavlink::MavlinkVersion;
    use std::sync::OnceLock;

    fn header(system_id: u8, component_id: u8) -> MavHeader {
        MavHeader { system_id, component_id, sequence: 0 }
    }

    fn autopilot_heartbeat() -> HEARTBEAT_DATA {
        HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        }
    }

    #[test]
    fn test_parse_serial_address() {
        assert_eq!(parse_serial("serial:/dev/ttyUSB0:57600"), Some(("/dev/ttyUSB0", 57600)));
        assert_eq!(parse_serial("udpin:0.0.0.0:14540"), None);
        assert_eq!(parse_serial("serial:/dev/ttyUSB0"), None);
    }

    #[test]
    fn test_is_vehicle_filters_ground_stations() {
        let hb = autopilot_heartbeat();
        assert!(is_vehicle(&header(1, 1), &hb, 245));
        assert!(!is_vehicle(&header(245, 1), &hb, 245));
        assert!(!is_vehicle(&header(1, 100), &hb, 245));

        let gcs = HEARTBEAT_DATA { mavtype: MavType::MAV_TYPE_GCS, ..autopilot_heartbeat() };
        assert!(!is_vehicle(&header(2, 1), &gcs, 245));
    }

    #[test]
    fn test_global_position_updates_three_facets() {
        let (shared, _rx) = Shared::new();
        let pos = shared.position.subscribe();
        let alt = shared.altitude.subscribe();
        let hdg = shared.heading.subscribe();

        shared.handle(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 473_977_420,
            lon: 85_455_940,
            alt: 488_000,
            relative_alt: 10_500,
            hdg: 9_000,
            ..Default::default()
        }));

        assert!((pos.borrow().latitude - 47.397742).abs() < 1e-9);
        assert!((pos.borrow().longitude - 8.545594).abs() < 1e-9);
        assert_eq!(alt.borrow().relative_m, 10.5);
        assert_eq!(alt.borrow().sea_level_m, 488.0);
        assert_eq!(hdg.borrow().degrees, 90.0);
    }

    #[test]
    fn test_unknown_heading_keeps_last_value() {
        let (shared, _rx) = Shared::new();
        shared.heading.send_replace(Heading { degrees: 45.0 });
        shared.handle(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            hdg: u16::MAX,
            ..Default::default()
        }));
        assert_eq!(shared.heading.borrow().degrees, 45.0);
    }

    #[test]
    fn test_sys_status_battery_ignores_invalid_fields() {
        let (shared, _rx) = Shared::new();
        shared.handle(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: 12_600,
            battery_remaining: 87,
            ..Default::default()
        }));
        shared.handle(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: u16::MAX,
            battery_remaining: -1,
            ..Default::default()
        }));
        let b = *shared.battery.borrow();
        assert_eq!(b.voltage_v, 12.6);
        assert_eq!(b.remaining_percent, 87.0);
    }

    #[test]
    fn test_mission_current_sets_progress() {
        let (shared, _rx) = Shared::new();
        shared.progress.send_replace(MissionProgress { current: 0, total: 4 });
        shared.handle(&MavMessage::MISSION_CURRENT(MISSION_CURRENT_DATA { seq: 2, ..Default::default() }));
        assert_eq!(*shared.progress.borrow(), MissionProgress { current: 2, total: 4 });
    }

    #[test]
    fn test_mission_ack_routed_to_replies() {
        let (shared, mut rx) = Shared::new();
        shared.handle(&MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
            ..Default::default()
        }));
        assert!(matches!(rx.try_recv(), Ok(MissionReply::Ack(MavMissionResult::MAV_MISSION_ACCEPTED))));
    }

    #[test]
    fn test_heartbeat_starts_liveness_clock() {
        let (shared, _rx) = Shared::new();
        assert!(lock(&shared.status).hb_age().is_none());
        shared.handle(&MavMessage::HEARTBEAT(autopilot_heartbeat()));
        assert!(lock(&shared.status).hb_age().is_some());
    }

    type Script = Box<dyn Fn(&MavMessage) -> Vec<MavMessage> + Send + Sync>;

    /// Autopilot on the other end of an in-memory connection. Every frame sent
    /// to it is recorded and answered right away from `script`.
    struct ScriptedAutopilot {
        vehicle: OnceLock<Arc<Shared>>,
        sent: Mutex<Vec<MavMessage>>,
        script: Script,
    }

    impl ScriptedAutopilot {
        fn sent(&self) -> Vec<MavMessage> {
            lock(&self.sent).clone()
        }
    }

    impl MavConnection<MavMessage> for ScriptedAutopilot {
        fn recv(&self) -> Result<(MavHeader, MavMessage), MessageReadError> {
            Err(MessageReadError::Io(std::io::ErrorKind::WouldBlock.into()))
        }

        fn send(&self, _header: &MavHeader, msg: &MavMessage) -> Result<usize, MessageWriteError> {
            lock(&self.sent).push(msg.clone());
            if let Some(shared) = self.vehicle.get() {
                for reply in (self.script)(msg) {
                    shared.handle(&reply);
                }
            }
            Ok(0)
        }

        fn set_protocol_version(&mut self, _version: MavlinkVersion) {}

        fn get_protocol_version(&self) -> MavlinkVersion {
            MavlinkVersion::V2
        }
    }

    fn scripted(
        script: impl Fn(&MavMessage) -> Vec<MavMessage> + Send + Sync + 'static,
    ) -> (Arc<MavVehicle>, Arc<ScriptedAutopilot>) {
        let autopilot = Arc::new(ScriptedAutopilot {
            vehicle: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            script: Box::new(script),
        });
        let out = Arc::new(Outbound { conn: autopilot.clone(), hdr: Mutex::new(header(245, 190)) });
        let vehicle = MavVehicle::new("test/sys1".into(), (1, 1), out, Duration::from_millis(100));
        let _ = autopilot.vehicle.set(vehicle.shared.clone());
        (Arc::new(vehicle), autopilot)
    }

    fn request_int(seq: u16) -> MavMessage {
        MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA { seq, ..Default::default() })
    }

    fn mission_ack(result: MavMissionResult) -> MavMessage {
        MavMessage::MISSION_ACK(MISSION_ACK_DATA { mavtype: result, ..Default::default() })
    }

    fn command_ack(command: MavCmd, result: MavResult) -> MavMessage {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command, result, ..Default::default() })
    }

    /// Requests every item in order, then accepts. Commands are accepted too.
    fn cooperative(count: u16) -> impl Fn(&MavMessage) -> Vec<MavMessage> + Send + Sync + 'static {
        move |msg| match msg {
            MavMessage::MISSION_COUNT(_) => vec![request_int(0)],
            MavMessage::MISSION_ITEM_INT(item) if item.seq + 1 < count => vec![request_int(item.seq + 1)],
            MavMessage::MISSION_ITEM_INT(_) => vec![mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)],
            MavMessage::COMMAND_LONG(c) => vec![command_ack(c.command, MavResult::MAV_RESULT_ACCEPTED)],
            _ => vec![],
        }
    }

    fn three_waypoints() -> MissionPlan {
        MissionPlan::new(vec![
            Waypoint::new(47.39, 8.54, 10.0),
            Waypoint::new(47.40, 8.55, 12.0),
            Waypoint::new(47.41, 8.56, 15.0),
        ])
    }

    fn items(sent: &[MavMessage]) -> Vec<MISSION_ITEM_INT_DATA> {
        sent.iter()
            .filter_map(|m| match m {
                MavMessage::MISSION_ITEM_INT(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    fn commands(sent: &[MavMessage]) -> Vec<COMMAND_LONG_DATA> {
        sent.iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_LONG(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_upload_walks_item_handshake() {
        let (vehicle, autopilot) = scripted(cooperative(3));
        vehicle.upload_mission(&three_waypoints()).await.unwrap();

        let sent = autopilot.sent();
        assert!(matches!(&sent[0], MavMessage::MISSION_COUNT(c) if c.count == 3 && c.target_system == 1));
        let items = items(&sent);
        assert_eq!(items.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(items[0].x, 473_900_000);
        assert_eq!(items[1].y, 85_500_000);
        assert_eq!(items[2].z, 15.0);
        assert!(items.iter().all(|i| i.frame == MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT));
        assert_eq!(*vehicle.subscribe_mission_progress().borrow(), MissionProgress { current: 0, total: 3 });
    }

    #[tokio::test]
    async fn test_upload_answers_legacy_item_requests() {
        let (vehicle, autopilot) = scripted(|msg| match msg {
            MavMessage::MISSION_COUNT(_) => {
                vec![MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA { seq: 0, ..Default::default() })]
            }
            MavMessage::MISSION_ITEM_INT(_) => vec![mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)],
            _ => vec![],
        });
        let plan = MissionPlan::new(vec![Waypoint::new(1.0, 2.0, 3.0)]);
        vehicle.upload_mission(&plan).await.unwrap();
        assert_eq!(items(&autopilot.sent()).len(), 1);
    }

    #[tokio::test]
    async fn test_upload_refuses_out_of_range_request() {
        let (vehicle, _) = scripted(|msg| match msg {
            MavMessage::MISSION_COUNT(_) => vec![request_int(7)],
            _ => vec![],
        });
        match vehicle.upload_mission(&three_waypoints()).await {
            Err(LinkError::Rejected { command, result }) => {
                assert_eq!(command, "upload_mission");
                assert!(result.contains("item 7 of 3"), "{}", result);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_surfaces_refusing_ack() {
        let (vehicle, _) = scripted(|msg| match msg {
            MavMessage::MISSION_COUNT(_) => vec![mission_ack(MavMissionResult::MAV_MISSION_NO_SPACE)],
            _ => vec![],
        });
        let err = vehicle.upload_mission(&three_waypoints()).await.unwrap_err();
        assert!(err.to_string().contains("MAV_MISSION_NO_SPACE"), "{}", err);
    }

    #[tokio::test]
    async fn test_upload_times_out_on_silent_vehicle() {
        let (vehicle, _) = scripted(|_| vec![]);
        let err = vehicle.upload_mission(&three_waypoints()).await.unwrap_err();
        assert_eq!(err, LinkError::Timeout { command: "upload_mission" });
    }

    #[tokio::test]
    async fn test_clear_skips_stray_requests() {
        let (vehicle, autopilot) = scripted(|msg| match msg {
            MavMessage::MISSION_CLEAR_ALL(_) => {
                vec![request_int(1), mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)]
            }
            _ => vec![],
        });
        vehicle.shared.progress.send_replace(MissionProgress { current: 2, total: 3 });

        vehicle.clear_mission().await.unwrap();
        assert!(matches!(autopilot.sent().as_slice(), [MavMessage::MISSION_CLEAR_ALL(_)]));
        assert_eq!(*vehicle.subscribe_mission_progress().borrow(), MissionProgress::default());
    }

    #[tokio::test]
    async fn test_command_waits_past_in_progress_ack() {
        let (vehicle, autopilot) = scripted(|msg| match msg {
            MavMessage::COMMAND_LONG(c) => vec![
                command_ack(c.command, MavResult::MAV_RESULT_IN_PROGRESS),
                command_ack(c.command, MavResult::MAV_RESULT_ACCEPTED),
            ],
            _ => vec![],
        });
        vehicle.arm().await.unwrap();

        let sent = commands(&autopilot.sent());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
        assert_eq!(sent[0].param1, 1.0);
        assert_eq!((sent[0].target_system, sent[0].target_component), (1, 1));
    }

    #[tokio::test]
    async fn test_command_denied_is_rejected() {
        let (vehicle, _) = scripted(|msg| match msg {
            MavMessage::COMMAND_LONG(c) => vec![command_ack(c.command, MavResult::MAV_RESULT_DENIED)],
            _ => vec![],
        });
        match vehicle.pause_mission().await {
            Err(LinkError::Rejected { command, result }) => {
                assert_eq!(command, "pause_mission");
                assert_eq!(result, "MAV_RESULT_DENIED");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ack_for_other_command_does_not_resolve() {
        let (vehicle, _) = scripted(|msg| match msg {
            MavMessage::COMMAND_LONG(_) => {
                vec![command_ack(MavCmd::MAV_CMD_NAV_TAKEOFF, MavResult::MAV_RESULT_ACCEPTED)]
            }
            _ => vec![],
        });
        assert_eq!(vehicle.arm().await.unwrap_err(), LinkError::Timeout { command: "arm" });
        assert!(lock(&vehicle.shared.acks).is_empty());
    }

    #[tokio::test]
    async fn test_start_covers_uploaded_range() {
        let (vehicle, autopilot) = scripted(cooperative(3));
        vehicle.upload_mission(&three_waypoints()).await.unwrap();
        vehicle.start_mission().await.unwrap();

        let sent = commands(&autopilot.sent());
        assert_eq!(sent[0].command, MavCmd::MAV_CMD_MISSION_START);
        assert_eq!((sent[0].param1, sent[0].param2), (0.0, 2.0));
    }

    #[tokio::test]
    async fn test_second_waiter_for_same_command_is_refused() {
        let (vehicle, _) = scripted(|_| vec![]);
        let first = {
            let vehicle = vehicle.clone();
            tokio::spawn(async move { vehicle.start_mission().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = vehicle.start_mission().await.unwrap_err();
        assert!(matches!(second, LinkError::Transport(ref m) if m.contains("already awaiting")), "{}", second);

        vehicle.shared.handle(&command_ack(MavCmd::MAV_CMD_MISSION_START, MavResult::MAV_RESULT_ACCEPTED));
        assert_eq!(first.await.unwrap(), Ok(()));
    }
}
