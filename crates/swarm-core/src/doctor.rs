use anyhow::Result;
use swarm_link::LinkConfig;

use crate::MissionConfig;

const SCHEMES: &[&str] = &["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    for addr in &cfg.addresses {
        anyhow::ensure!(
            SCHEMES.iter().any(|s| addr.starts_with(s)),
            "link.addresses: unsupported address {:?} (expected one of {})",
            addr,
            SCHEMES.join(" ")
        );
    }
    anyhow::ensure!(cfg.sys_id != 0, "link.sys_id 0 is reserved");
    anyhow::ensure!(
        cfg.command_timeout_ms >= 100 && cfg.command_timeout_ms <= 60_000,
        "link.command_timeout_ms should be 100..60000"
    );
    anyhow::ensure!(cfg.heartbeat_hz >= 0.2 && cfg.heartbeat_hz <= 10.0, "link.heartbeat_hz should be 0.2..10");
    Ok(())
}

pub fn check_mission(cfg: &MissionConfig) -> Result<()> {
    anyhow::ensure!(cfg.readiness_poll_ms >= 50, "mission.readiness_poll_ms too small");
    anyhow::ensure!(
        cfg.readiness_timeout_ms >= cfg.readiness_poll_ms,
        "mission.readiness_timeout_ms shorter than one poll"
    );
    Ok(())
}
