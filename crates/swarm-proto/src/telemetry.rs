use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionProgress {
    pub current: i32,
    pub total: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub remaining_percent: f32,
    pub voltage_v: f32,
}

// Wire names follow what the operator console already reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Altitude {
    #[serde(rename = "relative_altitude_m")]
    pub relative_m: f32,
    #[serde(rename = "sea_level_altitude_m")]
    pub sea_level_m: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    #[serde(rename = "heading_deg")]
    pub degrees: f64,
}

/// Last known value of every facet. Facets are sampled one at a time, so two
/// facets may come from different moments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub position: Position,
    pub mission_progress: MissionProgress,
    pub battery: Battery,
    pub altitude: Altitude,
    pub heading: Heading,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_altitude_and_heading_use_console_names() {
        let alt = Altitude { relative_m: 12.5, sea_level_m: 500.0 };
        let v = serde_json::to_value(alt).unwrap();
        assert_eq!(v["relative_altitude_m"], 12.5);
        assert_eq!(v["sea_level_altitude_m"], 500.0);

        let hdg = Heading { degrees: 270.0 };
        let v = serde_json::to_value(hdg).unwrap();
        assert_eq!(v["heading_deg"], 270.0);
    }

    #[test]
    fn test_snapshot_defaults_to_zero() {
        let snap = TelemetrySnapshot::default();
        assert_eq!(snap.position, Position { latitude: 0.0, longitude: 0.0 });
        assert_eq!(snap.mission_progress, MissionProgress { current: 0, total: 0 });
        assert_eq!(snap.battery.remaining_percent, 0.0);
    }
}
