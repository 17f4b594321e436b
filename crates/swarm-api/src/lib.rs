//! Operator HTTP API.
//!
//! Endpoints:
//!   GET  /healthz
//!   GET  /vehicles                      every known vehicle with its mission status
//!   POST /vehicles/:id/start            body: waypoint CSV (text/plain), 202 once scheduled
//!   GET  /vehicles/:id/pause|resume|abort
//!   GET  /vehicles/:id/telemetry|mission_progress|battery|altitude|heading|snapshot|mission
//!
//! The same per-vehicle routes are also mounted without the `/vehicles/:id`
//! prefix; those address the first vehicle discovered, which is what the
//! single-vehicle operator console calls.

pub mod error;

pub use error::ApiError;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{rejection::PathRejection, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use swarm_core::{plan, FleetRegistry, MissionStatus, VehicleHandle, VehicleId};
use swarm_proto::{Altitude, Battery, Heading, MissionProgress, Position, TelemetrySnapshot};
use tracing::info;

type Shared = Arc<FleetRegistry>;

/// Vehicle a request is aimed at: `:id` when the route has one, otherwise
/// the first vehicle discovered.
pub struct Target(pub VehicleHandle);

#[async_trait]
impl FromRequestParts<Shared> for Target {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, registry: &Shared) -> Result<Self, Self::Rejection> {
        let params = match Path::<HashMap<String, String>>::from_request_parts(parts, registry).await {
            Ok(Path(params)) => params,
            Err(PathRejection::MissingPathParams(_)) => HashMap::new(),
            // undecodable :id on a scoped route
            Err(rejection) => return Err(ApiError::BadVehicleId(rejection.body_text())),
        };

        let vehicle = match params.get("id") {
            Some(raw) => {
                let id: VehicleId = raw.parse().map_err(|_| ApiError::BadVehicleId(raw.clone()))?;
                registry.get(id)?
            }
            None => registry.first()?,
        };
        Ok(Target(vehicle))
    }
}

#[derive(Serialize)]
struct VehicleSummary {
    id: VehicleId,
    link: String,
    heartbeat_age_ms: Option<u64>,
    discovered_unix_ms: i64,
    mission: MissionStatus,
}

fn vehicle_routes() -> Router<Shared> {
    Router::new()
        .route("/start", post(handle_start))
        .route("/pause", get(handle_pause).post(handle_pause))
        .route("/resume", get(handle_resume).post(handle_resume))
        .route("/abort", get(handle_abort).post(handle_abort))
        .route("/telemetry", get(handle_position))
        .route("/mission_progress", get(handle_mission_progress))
        .route("/battery", get(handle_battery))
        .route("/altitude", get(handle_altitude))
        .route("/heading", get(handle_heading))
        .route("/snapshot", get(handle_snapshot))
        .route("/mission", get(handle_mission))
}

/// Build the axum Router (useful for testing without binding a port).
pub fn router(registry: Shared) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/vehicles", get(handle_vehicles))
        .nest("/vehicles/:id", vehicle_routes())
        .merge(vehicle_routes())
        .with_state(registry)
}

/// Serves the API on `bind` until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    registry: Shared,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind operator API on {}", bind))?;
    info!("operator API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .context("operator API server")?;
    Ok(())
}

async fn handle_healthz(State(registry): State<Shared>) -> impl IntoResponse {
    match registry.len() {
        0 => (StatusCode::SERVICE_UNAVAILABLE, "no vehicle connected".to_string()),
        n => (StatusCode::OK, format!("ok: {} vehicle(s)", n)),
    }
}

async fn handle_vehicles(State(registry): State<Shared>) -> Json<Vec<VehicleSummary>> {
    let list = registry
        .vehicles()
        .iter()
        .map(|v| VehicleSummary {
            id: v.id(),
            link: v.link_id().to_string(),
            heartbeat_age_ms: v.heartbeat_age().map(|d| d.as_millis() as u64),
            discovered_unix_ms: v.discovered_unix_ms(),
            mission: v.mission().status(),
        })
        .collect();
    Json(list)
}

/// POST start
///
/// Bad CSV lines are skipped (and logged by the parser); a plan with no usable
/// line is refused. The reply only confirms scheduling, the outcome shows up
/// on the mission route.
async fn handle_start(Target(vehicle): Target, body: String) -> Result<impl IntoResponse, ApiError> {
    let parsed = plan::parse_report(&body);
    let waypoints = parsed.plan.len();
    let skipped = parsed.skipped.len();
    let sequence = vehicle.mission().start(parsed.plan)?;

    Ok((
        StatusCode::ACCEPTED,
        format!(
            "Mission accepted: vehicle {} sequence {}, {} waypoints, {} lines skipped",
            vehicle.id(),
            sequence,
            waypoints,
            skipped
        ),
    ))
}

async fn handle_pause(Target(vehicle): Target) -> Result<&'static str, ApiError> {
    vehicle.mission().pause().await?;
    Ok("Mission paused")
}

async fn handle_resume(Target(vehicle): Target) -> Result<&'static str, ApiError> {
    vehicle.mission().resume().await?;
    Ok("Mission resumed")
}

async fn handle_abort(Target(vehicle): Target) -> Result<&'static str, ApiError> {
    vehicle.mission().abort().await?;
    Ok("Mission aborted")
}

async fn handle_position(Target(vehicle): Target) -> Json<Position> {
    Json(vehicle.telemetry().position())
}

async fn handle_mission_progress(Target(vehicle): Target) -> Json<MissionProgress> {
    Json(vehicle.telemetry().mission_progress())
}

async fn handle_battery(Target(vehicle): Target) -> Json<Battery> {
    Json(vehicle.telemetry().battery())
}

async fn handle_altitude(Target(vehicle): Target) -> Json<Altitude> {
    Json(vehicle.telemetry().altitude())
}

async fn handle_heading(Target(vehicle): Target) -> Json<Heading> {
    Json(vehicle.telemetry().heading())
}

async fn handle_snapshot(Target(vehicle): Target) -> Json<TelemetrySnapshot> {
    Json(vehicle.telemetry().snapshot())
}

async fn handle_mission(Target(vehicle): Target) -> Json<MissionStatus> {
    Json(vehicle.mission().status())
}
