//! Waypoint CSV: one `latitude,longitude,relative_altitude_m` per line.
//!
//! Bad lines are dropped with a warning and never abort the parse. An empty
//! result is returned as-is; refusing to fly it is the mission controller's job.

use anyhow::{Context, Result};
use std::path::Path;
use swarm_proto::{MissionPlan, Waypoint};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanLineError {
    #[error("expected 3 comma-separated fields, found {0}")]
    FieldCount(usize),

    #[error("{field} is not a number: {value:?}")]
    NotANumber { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedLine {
    /// 1-based
    pub line_no: usize,
    pub text: String,
    pub error: PlanLineError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPlan {
    pub plan: MissionPlan,
    pub skipped: Vec<SkippedLine>,
}

pub fn parse(text: &str) -> MissionPlan {
    parse_report(text).plan
}

pub fn parse_report(text: &str) -> ParsedPlan {
    let mut waypoints = Vec::new();
    let mut skipped = Vec::new();

    for (idx, raw) in text.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(wp) => waypoints.push(wp),
            Err(error) => {
                warn!("waypoints: skipping line {} {:?}: {}", idx + 1, line, error);
                skipped.push(SkippedLine { line_no: idx + 1, text: line.to_string(), error });
            }
        }
    }

    ParsedPlan { plan: MissionPlan::new(waypoints), skipped }
}

pub fn parse_line(line: &str) -> Result<Waypoint, PlanLineError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(PlanLineError::FieldCount(fields.len()));
    }

    let latitude = number("latitude", fields[0])?;
    let longitude = number("longitude", fields[1])?;
    let altitude = number("relative_altitude", fields[2])?;

    if latitude.abs() > 90.0 {
        return Err(PlanLineError::OutOfRange { field: "latitude", value: latitude });
    }
    if longitude.abs() > 180.0 {
        return Err(PlanLineError::OutOfRange { field: "longitude", value: longitude });
    }

    Ok(Waypoint::new(latitude, longitude, altitude as f32))
}

fn number(field: &'static str, s: &str) -> Result<f64, PlanLineError> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(PlanLineError::NotANumber { field, value: s.to_string() }),
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<ParsedPlan> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read waypoint file {}", path.display()))?;
    Ok(parse_report(&text))
}
