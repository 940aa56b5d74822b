//! ---
//! gl_section: "06-execution"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Simulated stage movement and vibration feature extraction."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use gearlink_msg::{CommandMessage, WirePayload};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::handler::{CommandHandler, HandlerError};

/// Names of the values in a `result_feature_set` reply, in order.
pub const FEATURE_NAMES: [&str; 8] = [
    "Time_skewness_y",
    "Time_kurtosis_y",
    "Time_rms_y",
    "Time_crestfactor_y",
    "Powerspectrum_skewness_y",
    "Powerspectrum_kurtosis_y",
    "Powerspectrum_rms_y",
    "Powerspectrum_crestfactor_y",
];

const ANALYSIS_TIME: Duration = Duration::from_millis(200);
const MIN_MOVE_TIME_MS: u64 = 100;
const SAMPLING_RATE: u32 = 1000;
const ALGORITHM_VERSION: &str = "v2.1.0";

/// Travel time to a point: 10ms per unit of distance from the origin, at least 100ms.
pub fn movement_delay(x: f64, y: f64) -> Duration {
    let distance = (x * x + y * y).sqrt();
    Duration::from_millis(MIN_MOVE_TIME_MS.max((distance * 10.0) as u64))
}

/// Deterministic vibration features for a point.
///
/// The generator is seeded from the coordinates, so a retried command yields
/// the same values.
pub fn vibration_features(x: f64, y: f64) -> [f64; 8] {
    let seed = (x * 1000.0 + y * 1000.0) as i64 as u64;
    let mut rng = StdRng::seed_from_u64(seed);
    let base_amplitude = 1.0 + x.abs() * 0.1 + y.abs() * 0.05;
    let noise = (rng.gen::<f64>() - 0.5) * 0.2;
    [
        (rng.gen::<f64>() - 0.5) * 2.0 + noise,
        rng.gen::<f64>() * 3.0 + 2.0 + noise,
        base_amplitude * (0.5 + rng.gen::<f64>() * 0.5),
        2.0 + rng.gen::<f64>() * 2.0 + noise,
        (rng.gen::<f64>() - 0.5) * 1.5 + noise,
        rng.gen::<f64>() * 2.0 + 1.5 + noise,
        base_amplitude * (0.3 + rng.gen::<f64>() * 0.4),
        1.5 + rng.gen::<f64>() * 1.5 + noise,
    ]
}

fn coordinate(point: &JsonValue, axis: &str) -> Result<f64, HandlerError> {
    point
        .get(axis)
        .and_then(JsonValue::as_f64)
        .filter(|value| value.is_finite())
        .ok_or_else(|| HandlerError::InvalidPayload(format!("point.{axis} must be a finite number")))
}

/// Handler answering `move_point` with simulated vibration features.
#[derive(Debug, Clone)]
pub struct SimulatedFeatureHandler {
    simulate_delay: bool,
}

impl SimulatedFeatureHandler {
    /// With `simulate_delay` the handler sleeps for movement plus analysis time.
    pub fn new(simulate_delay: bool) -> Self {
        Self { simulate_delay }
    }
}

impl Default for SimulatedFeatureHandler {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl CommandHandler for SimulatedFeatureHandler {
    async fn handle(&self, command: &CommandMessage) -> Result<WirePayload, HandlerError> {
        if command.kind != CommandMessage::MOVE_POINT {
            return Err(HandlerError::Unsupported(command.kind.clone()));
        }
        let point = command
            .payload
            .get("point")
            .ok_or_else(|| HandlerError::InvalidPayload("missing point".to_owned()))?;
        let x = coordinate(point, "x")?;
        let y = coordinate(point, "y")?;

        if self.simulate_delay {
            let travel = movement_delay(x, y);
            debug!(x, y, travel = ?travel, "moving to point");
            tokio::time::sleep(travel).await;
            tokio::time::sleep(ANALYSIS_TIME).await;
        }

        let mut payload = WirePayload::new();
        payload.insert("features".to_owned(), json!(FEATURE_NAMES));
        payload.insert("values".to_owned(), json!(vibration_features(x, y)));
        payload.insert("point".to_owned(), json!({ "x": x, "y": y }));
        payload.insert(
            "analysis_info".to_owned(),
            json!({
                "duration_ms": ANALYSIS_TIME.as_millis() as u64,
                "sampling_rate": SAMPLING_RATE,
                "data_points": 200,
                "algorithm_version": ALGORITHM_VERSION,
            }),
        );
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearlink_msg::CorrelationId;

    fn move_point(point: JsonValue) -> CommandMessage {
        let mut payload = WirePayload::new();
        payload.insert("point".into(), point);
        CommandMessage::new(CommandMessage::MOVE_POINT, CorrelationId::generate(), payload, "A")
    }

    #[test]
    fn movement_delay_has_a_floor() {
        assert_eq!(movement_delay(0.0, 0.0), Duration::from_millis(100));
        assert_eq!(movement_delay(30.0, 40.0), Duration::from_millis(500));
    }

    #[test]
    fn features_are_deterministic_per_point() {
        assert_eq!(vibration_features(10.0, 5.0), vibration_features(10.0, 5.0));
        assert_ne!(vibration_features(10.0, 5.0), vibration_features(0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_payload_lists_eight_features() {
        let handler = SimulatedFeatureHandler::default();
        let started = tokio::time::Instant::now();
        let payload = handler
            .handle(&move_point(json!({ "x": 12.3, "y": -7.5 })))
            .await
            .expect("handled");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(payload["features"].as_array().map(Vec::len), Some(8));
        assert_eq!(payload["values"].as_array().map(Vec::len), Some(8));
        assert_eq!(payload["point"]["y"], -7.5);
        assert_eq!(payload["analysis_info"]["algorithm_version"], "v2.1.0");
    }

    #[tokio::test]
    async fn bad_payloads_are_rejected() {
        let handler = SimulatedFeatureHandler::new(false);
        let err = handler
            .handle(&move_point(json!({ "x": "left" })))
            .await
            .expect_err("invalid");
        assert!(matches!(err, HandlerError::InvalidPayload(_)));

        let mut other = move_point(json!({ "x": 1.0, "y": 1.0 }));
        other.kind = "rotate".into();
        assert!(matches!(
            handler.handle(&other).await,
            Err(HandlerError::Unsupported(kind)) if kind == "rotate"
        ));
    }
}
