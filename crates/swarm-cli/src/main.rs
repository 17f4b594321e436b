use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use swarm_core::{doctor as core_doctor, plan, FleetRegistry, MissionConfig};
use swarm_link::{sim, LinkConfig};
use swarm_proto::Position;

#[derive(Debug, Parser)]
#[command(name = "swarm", version, about = "Fleet gateway between MAVLink vehicles and the operator console")]
struct Cli {
    #[arg(long, default_value = "swarm.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration file.
    Doctor,
    /// Connect to the vehicles and serve the operator API.
    Serve,
    Plan { #[command(subcommand)] cmd: PlanCmd },
}

#[derive(Debug, Subcommand)]
enum PlanCmd {
    /// Parse a waypoint CSV and print what would be flown.
    Check { file: String },
}

#[derive(Debug, Default, serde::Deserialize)]
struct Config {
    #[serde(default)]
    server: ServerCfg,
    #[serde(default)]
    link: LinkConfig,
    #[serde(default)]
    mission: MissionConfig,
    #[serde(default)]
    discovery: DiscoveryCfg,
    #[serde(default)]
    sim: SimCfg,
}

#[derive(Debug, serde::Deserialize)]
struct ServerCfg {
    #[serde(default = "default_bind")]
    bind: String,
}

fn default_bind() -> String { "0.0.0.0:8080".to_string() }

impl Default for ServerCfg {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, serde::Deserialize)]
struct DiscoveryCfg {
    /// How long `serve` waits for the first vehicle before serving anyway.
    #[serde(default = "default_wait_s")]
    wait_s: u64,
}

fn default_wait_s() -> u64 { 30 }

impl Default for DiscoveryCfg {
    fn default() -> Self {
        Self { wait_s: default_wait_s() }
    }
}

#[derive(Debug, serde::Deserialize)]
struct SimCfg {
    #[serde(default)]
    vehicles: usize,
    #[serde(default = "default_tick_ms")]
    tick_ms: u64,
    #[serde(default = "default_home_latitude")]
    home_latitude: f64,
    #[serde(default = "default_home_longitude")]
    home_longitude: f64,
}

fn default_tick_ms() -> u64 { 1000 }
// PX4 SITL default home
fn default_home_latitude() -> f64 { 47.397742 }
fn default_home_longitude() -> f64 { 8.545594 }

impl Default for SimCfg {
    fn default() -> Self {
        Self {
            vehicles: 0,
            tick_ms: default_tick_ms(),
            home_latitude: default_home_latitude(),
            home_longitude: default_home_longitude(),
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    parse_config(&s)
}

fn parse_config(s: &str) -> Result<Config> {
    toml::from_str(s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Doctor => doctor(&load_config(&cli.config)?)?,
        Command::Serve => serve(&load_config(&cli.config)?).await?,
        Command::Plan { cmd: PlanCmd::Check { file } } => plan_check(&file)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    cfg.server
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("server.bind {:?} is not an ip:port", cfg.server.bind))?;
    core_doctor::check_link(&cfg.link)?;
    core_doctor::check_mission(&cfg.mission)?;
    anyhow::ensure!(cfg.sim.tick_ms >= 10, "sim.tick_ms too small");

    if cfg.link.addresses.is_empty() && cfg.sim.vehicles == 0 {
        warn!("doctor: no link addresses and no simulated vehicles; serve will have nothing to control");
    }

    info!("doctor: OK");
    Ok(())
}

async fn serve(cfg: &Config) -> Result<()> {
    info!("serve: starting");

    let registry = Arc::new(FleetRegistry::new(cfg.mission.clone()));
    // hubs stop when dropped; keep them for the life of the server
    let _hubs = registry.connect(&cfg.link)?;

    if cfg.sim.vehicles > 0 {
        let home = Position { latitude: cfg.sim.home_latitude, longitude: cfg.sim.home_longitude };
        let links = sim::fleet(cfg.sim.vehicles, home);
        for link in &links {
            registry.register(link.clone());
        }
        let every = Duration::from_millis(cfg.sim.tick_ms);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                for link in &links {
                    link.tick();
                }
            }
        });
        info!(vehicles = cfg.sim.vehicles, "simulated vehicles registered");
    }

    let wait = Duration::from_secs(cfg.discovery.wait_s);
    match registry.wait_for_vehicle(wait).await {
        Ok(id) => info!(vehicle = %id, "first vehicle ready"),
        Err(e) => warn!("{}; serving anyway, vehicle routes answer 503 until one appears", e),
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {:#}", e);
            std::future::pending::<()>().await;
        }
        info!("serve: shutdown requested");
    };
    swarm_api::serve(&cfg.server.bind, registry, shutdown).await
}

fn plan_check(file: &str) -> Result<()> {
    let parsed = plan::load(file)?;

    for (i, wp) in parsed.plan.waypoints().iter().enumerate() {
        println!("{:>3}  lat={:.7} lon={:.7} alt={:.1}m", i + 1, wp.latitude, wp.longitude, wp.relative_altitude);
    }
    for s in &parsed.skipped {
        println!("skipped line {}: {:?} ({})", s.line_no, s.text, s.error);
    }
    println!("waypoints={} skipped={}", parsed.plan.len(), parsed.skipped.len());

    anyhow::ensure!(!parsed.plan.is_empty(), "{}: no usable waypoints", file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_parses() {
        let cfg = parse_config(include_str!("../../../swarm.toml")).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.link.addresses, vec!["udpin:0.0.0.0:14540".to_string()]);
        assert_eq!(cfg.mission.readiness_timeout_ms, 60_000);
        assert_eq!(cfg.discovery.wait_s, 30);
        doctor(&cfg).unwrap();
    }

    #[test]
    fn test_empty_config_takes_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert!(cfg.link.addresses.is_empty());
        assert_eq!(cfg.link.sys_id, 245);
        assert_eq!(cfg.link.command_timeout_ms, 5000);
        assert_eq!(cfg.mission.readiness_poll_ms, 1000);
        assert_eq!(cfg.sim.vehicles, 0);
    }

    #[test]
    fn test_doctor_rejects_bad_bind() {
        let cfg = parse_config("[server]\nbind = \"localhost\"\n").unwrap();
        let err = doctor(&cfg).unwrap_err();
        assert!(err.to_string().contains("server.bind"));
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        assert!(parse_config("[sim]\nvehicles = \"three\"\n").is_err());
    }
}
