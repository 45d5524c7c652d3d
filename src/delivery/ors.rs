//! OpenRouteService client: geocoding, job optimisation and directions.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Coordinate, Directions, RoutePlanner};
use crate::error::{AppError, AppResult};

const ORS_BASE: &str = "https://api.openrouteservice.org";
const TIMEOUT: Duration = Duration::from_secs(20);
const PROFILE: &str = "driving-car";

pub struct OrsPlanner {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OrsPlanner {
    pub fn new(api_key: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: ORS_BASE.to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> AppResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::Upstream(friendly_error(path, &e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Upstream(status_error(status)));
        }
        resp.json()
            .await
            .map_err(|e| AppError::Upstream(format!("Invalid response from {path}: {e}")))
    }
}

/// Map a transport failure to a message for the admin UI.
fn friendly_error(path: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return "Cannot reach the routing service".to_string();
    }
    if err.is_timeout() {
        return format!("Routing service timed out on {path}");
    }
    format!("Network error calling the routing service: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "Routing service rejected the API key".to_string(),
        404 => "Routing service could not find a route".to_string(),
        429 => "Routing service quota exceeded".to_string(),
        s if s >= 500 => format!("Routing service error (HTTP {s})"),
        s => format!("Unexpected response from routing service (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    features: Vec<GeocodeFeature>,
}

#[derive(Deserialize)]
struct GeocodeFeature {
    geometry: PointGeometry,
}

#[derive(Deserialize)]
struct PointGeometry {
    coordinates: [f64; 2],
}

#[derive(Deserialize)]
struct OptimizationResponse {
    #[serde(default)]
    routes: Vec<OptimizedRoute>,
}

#[derive(Deserialize)]
struct OptimizedRoute {
    steps: Vec<Step>,
}

#[derive(Deserialize)]
struct Step {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    job: Option<usize>,
}

/// Job ids in visiting order mapped back to input indices. Jobs the
/// optimiser left unassigned keep their input order at the end.
fn visiting_order(resp: OptimizationResponse, stops: usize) -> Vec<usize> {
    let mut order: Vec<usize> = resp
        .routes
        .into_iter()
        .flat_map(|r| r.steps)
        .filter(|s| s.kind == "job")
        .filter_map(|s| s.job)
        .filter(|&job| job >= 1 && job <= stops)
        .map(|job| job - 1)
        .collect();
    for i in 0..stops {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    order
}

fn parse_directions(body: &Value) -> AppResult<Directions> {
    let feature = body
        .get("features")
        .and_then(|f| f.get(0))
        .ok_or_else(|| AppError::Upstream("Routing service returned no route".into()))?;
    let summary = feature.pointer("/properties/summary");
    let number = |key: &str| {
        summary
            .and_then(|s| s.get(key))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };
    Ok(Directions {
        geometry: feature.get("geometry").cloned().unwrap_or(Value::Null),
        distance_m: number("distance"),
        duration_s: number("duration"),
    })
}

#[async_trait]
impl RoutePlanner for OrsPlanner {
    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinate>> {
        let url = format!("{}/geocode/search", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("text", address),
                ("boundary.country", "GB"),
                ("size", "1"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Upstream(friendly_error("/geocode/search", &e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Upstream(status_error(status)));
        }
        let body: GeocodeResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("Invalid geocoding response: {e}")))?;
        let found = body.features.into_iter().next().map(|f| Coordinate {
            lon: f.geometry.coordinates[0],
            lat: f.geometry.coordinates[1],
        });
        debug!(address, found = found.is_some(), "geocoded address");
        Ok(found)
    }

    async fn optimize(
        &self,
        stops: &[Coordinate],
        depot: Option<Coordinate>,
    ) -> AppResult<Vec<usize>> {
        if stops.len() < 2 {
            return Ok((0..stops.len()).collect());
        }
        let jobs: Vec<Value> = stops
            .iter()
            .enumerate()
            .map(|(i, c)| json!({ "id": i + 1, "location": [c.lon, c.lat] }))
            .collect();
        let start = depot.unwrap_or(stops[0]);
        let mut vehicle = json!({
            "id": 1,
            "profile": PROFILE,
            "start": [start.lon, start.lat],
        });
        if let Some(depot) = depot {
            vehicle["end"] = json!([depot.lon, depot.lat]);
        }
        let body = self
            .post_json("/optimization", &json!({ "jobs": jobs, "vehicles": [vehicle] }))
            .await?;
        let resp: OptimizationResponse = serde_json::from_value(body)
            .map_err(|e| AppError::Upstream(format!("Invalid optimisation response: {e}")))?;
        Ok(visiting_order(resp, stops.len()))
    }

    async fn directions(&self, coordinates: &[Coordinate]) -> AppResult<Directions> {
        let coords: Vec<[f64; 2]> = coordinates.iter().map(|c| [c.lon, c.lat]).collect();
        let body = self
            .post_json(
                &format!("/v2/directions/{PROFILE}/geojson"),
                &json!({ "coordinates": coords }),
            )
            .await?;
        parse_directions(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visiting_order_maps_job_ids_and_appends_unassigned() {
        let resp: OptimizationResponse = serde_json::from_value(json!({
            "routes": [{ "steps": [
                { "type": "start" },
                { "type": "job", "job": 3 },
                { "type": "job", "job": 1 },
                { "type": "end" }
            ]}]
        }))
        .unwrap();
        assert_eq!(visiting_order(resp, 4), vec![2, 0, 1, 3]);
    }

    #[test]
    fn directions_summary_is_read() {
        let body = json!({
            "type": "FeatureCollection",
            "features": [{
                "geometry": { "type": "LineString", "coordinates": [[-1.5, 53.8], [-1.4, 53.7]] },
                "properties": { "summary": { "distance": 5230.4, "duration": 611.2 } }
            }]
        });
        let d = parse_directions(&body).unwrap();
        assert_eq!(d.distance_m, 5230.4);
        assert_eq!(d.duration_s, 611.2);
        assert_eq!(d.geometry["type"], "LineString");
    }

    #[test]
    fn empty_directions_are_an_upstream_error() {
        let err = parse_directions(&json!({ "features": [] })).unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
    }

    #[test]
    fn status_errors_are_readable() {
        assert_eq!(
            status_error(StatusCode::FORBIDDEN),
            "Routing service rejected the API key"
        );
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY),
            "Routing service error (HTTP 502)"
        );
    }
}
