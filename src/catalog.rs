//! The built-in traffic mix for a JSON:API transit backend (the V3 API).
//!
//! Simple, cheap requests run most often. Scenarios covering several equivalent
//! targets (one of N subway routes, one of N screens) get a weight equal to their
//! number of targets and pick one target uniformly each time they run, so every
//! target is queried about as often as any single-target scenario while all of
//! them are still reported under one name.

use rand::Rng;

use crate::query::RequestSpec;
use crate::scenario::{Scenario, ScenarioResult};
use crate::user::VirtualUser;
use crate::SwarmError;

pub const GREEN_LINE_ROUTES: [&str; 4] = ["Green-B", "Green-C", "Green-D", "Green-E"];
pub const LIGHT_RAIL_ROUTES: [&str; 5] = ["Green-B", "Green-C", "Green-D", "Green-E", "Mattapan"];
pub const HEAVY_RAIL_ROUTES: [&str; 3] = ["Red", "Orange", "Blue"];
pub const SUBWAY_ROUTES: [&str; 8] = [
    "Red", "Orange", "Blue", "Green-B", "Green-C", "Green-D", "Green-E", "Mattapan",
];
pub const KEY_BUS_ROUTES: [&str; 15] = [
    "1", "15", "22", "23", "28", "32", "39", "57", "66", "71", "73", "77", "111", "116", "117",
];

/// Stops shown on each Solari screen; busways list one stop per berth.
pub const SOLARI_SCREEN_STOPS: [&[&str]; 6] = [
    // forest hills
    &["10642"],
    // nubian square
    &["place-dudly"],
    // sullivan square upper busway
    &["29001", "29002", "29003", "29004", "29005", "29006"],
    // ashmont
    &["334"],
    // wonderland
    &["15795"],
    // ruggles lower busway
    &["17862", "17863"],
];

pub const EINK_SCREEN_STOPS: [&str; 2] = [
    // washington square (Green-B)
    "place-bcnwa",
    // museum of fine arts (Green-E)
    "place-mfa",
];

pub const BACK_BAY_COMMUTER_RAIL_ROUTES: [&str; 4] =
    ["CR-Worcester", "CR-Franklin", "CR-Needham", "CR-Providence"];
pub const COMMUTER_RAIL_STATIONS: [&str; 3] = ["place-sstat", "place-north", "place-bbsta"];

/// Pick one entry uniformly. `N` is never 0 for the constants above.
fn random_entry<T: Copy, const N: usize>(entries: &[T; N]) -> T {
    entries[rand::rng().random_range(0..N)]
}

/// Every scenario of the built-in traffic mix, with its weight.
pub fn api_scenarios() -> Result<Vec<Scenario>, SwarmError> {
    Ok(vec![
        // Simple requests, performed most often.
        crate::scenario!(get_portal).set_name("portal").set_weight(10)?,
        crate::scenario!(get_alerts).set_name("alerts").set_weight(10)?,
        crate::scenario!(get_vehicles).set_name("vehicles").set_weight(10)?,
        crate::scenario!(get_all_subway_stops)
            .set_name("all subway stops")
            .set_weight(5)?,
        // Route schedules.
        crate::scenario!(get_subway_schedules)
            .set_name("subway schedules")
            .set_weight(SUBWAY_ROUTES.len())?,
        crate::scenario!(get_key_bus_route_schedules)
            .set_name("key bus route schedules")
            .set_weight(KEY_BUS_ROUTES.len())?,
        crate::scenario!(get_green_line_trips)
            .set_name("green line trips")
            .set_weight(GREEN_LINE_ROUTES.len())?,
        // Station schedules and predictions.
        crate::scenario!(get_solari_screen_predictions)
            .set_name("solari screen predictions")
            .set_weight(SOLARI_SCREEN_STOPS.len())?,
        crate::scenario!(get_eink_screen_schedules)
            .set_name("e-ink screen schedules")
            .set_weight(2 * EINK_SCREEN_STOPS.len())?,
        crate::scenario!(get_back_bay_schedules).set_name("back bay schedules"),
        crate::scenario!(get_commuter_rail_station_predictions)
            .set_name("commuter rail station predictions"),
        // Route schedules and predictions.
        crate::scenario!(get_green_line_schedules_with_predictions)
            .set_name("green line branch schedules")
            .set_weight(GREEN_LINE_ROUTES.len())?,
        crate::scenario!(get_heavy_rail_schedules_with_predictions)
            .set_name("heavy rail schedules")
            .set_weight(HEAVY_RAIL_ROUTES.len())?,
        crate::scenario!(get_heavy_rail_predictions_with_alerts)
            .set_name("heavy rail predictions")
            .set_weight(HEAVY_RAIL_ROUTES.len())?,
        crate::scenario!(get_green_line_predictions_with_alerts).set_name("green line predictions"),
        crate::scenario!(get_subway_predictions_with_schedules)
            .set_name("all subway predictions"),
    ])
}

pub async fn get_portal(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(&RequestSpec::new("/")).await
}

pub async fn get_alerts(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(
        &RequestSpec::new("/alerts")
            .set_name("/alerts")
            .set_include("facilities"),
    )
    .await
}

pub async fn get_vehicles(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(&RequestSpec::new("/vehicles")).await
}

pub async fn get_all_subway_stops(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(
        &RequestSpec::new("/stops")
            .set_name("/stops (all subway routes)")
            .set_filter("route", SUBWAY_ROUTES)
            .set_include("route"),
    )
    .await
}

pub async fn get_subway_schedules(user: &mut VirtualUser) -> ScenarioResult {
    let route = random_entry(&SUBWAY_ROUTES);
    user.api_request(
        &RequestSpec::new("/schedules")
            .set_name("/schedules (subway routes)")
            .set_filter("route", route),
    )
    .await
}

pub async fn get_key_bus_route_schedules(user: &mut VirtualUser) -> ScenarioResult {
    let route = random_entry(&KEY_BUS_ROUTES);
    user.api_request(
        &RequestSpec::new("/schedules")
            .set_name("/schedules (key bus routes)")
            .set_filter("route", route),
    )
    .await
}

pub async fn get_green_line_trips(user: &mut VirtualUser) -> ScenarioResult {
    let route = random_entry(&GREEN_LINE_ROUTES);
    user.api_request(
        &RequestSpec::new("/trips")
            .set_name("/trips (Green Line)")
            .set_filter("route", route)
            .set_include(["route", "vehicle", "service", "predictions"]),
    )
    .await
}

pub async fn get_solari_screen_predictions(user: &mut VirtualUser) -> ScenarioResult {
    let stops = random_entry(&SOLARI_SCREEN_STOPS);
    user.api_request(
        &RequestSpec::new("/predictions")
            .set_name("/predictions (Solari screens)")
            .set_filter("stop", stops)
            .set_include(["route", "stop", "trip", "trip.stops", "vehicle", "alerts"])
            .set_sort("departure_time"),
    )
    .await
}

pub async fn get_eink_screen_schedules(user: &mut VirtualUser) -> ScenarioResult {
    let direction_id: i64 = rand::rng().random_range(0..=1);
    user.api_request(
        &RequestSpec::new("/schedules")
            .set_name("/schedules (e-ink screens)")
            .set_filter("direction_id", direction_id)
            .set_filter("stop", EINK_SCREEN_STOPS)
            .set_include(["route", "stop", "trip"])
            .set_sort("departure_time"),
    )
    .await
}

pub async fn get_back_bay_schedules(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(
        &RequestSpec::new("/schedules")
            .set_name("/schedules (Commuter Rail @ Back Bay)")
            .set_filter("route", BACK_BAY_COMMUTER_RAIL_ROUTES)
            .set_filter("stop", "place-bbsta")
            .set_include(["route", "stop", "trip"])
            .set_sort("departure_time"),
    )
    .await
}

pub async fn get_commuter_rail_station_predictions(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(
        &RequestSpec::new("/predictions")
            .set_name("/predictions (Commuter Rail stations)")
            .set_filter("route_type", 2)
            .set_filter("stop", COMMUTER_RAIL_STATIONS)
            .set_include(["trip", "schedule", "stop"]),
    )
    .await
}

pub async fn get_green_line_schedules_with_predictions(user: &mut VirtualUser) -> ScenarioResult {
    let route = random_entry(&GREEN_LINE_ROUTES);
    user.api_request(
        &RequestSpec::new("/schedules")
            .set_name("/schedules (Green Line branches)")
            .set_filter("route", route)
            .set_include(["prediction", "stop"]),
    )
    .await
}

pub async fn get_heavy_rail_schedules_with_predictions(user: &mut VirtualUser) -> ScenarioResult {
    let route = random_entry(&HEAVY_RAIL_ROUTES);
    user.api_request(
        &RequestSpec::new("/schedules")
            .set_name("/schedules (heavy rail)")
            .set_filter("route", route)
            .set_include(["stop", "trip", "prediction"])
            .set_sort("arrival_time"),
    )
    .await
}

pub async fn get_heavy_rail_predictions_with_alerts(user: &mut VirtualUser) -> ScenarioResult {
    let route = random_entry(&HEAVY_RAIL_ROUTES);
    user.api_request(
        &RequestSpec::new("/predictions")
            .set_name("/predictions (heavy rail)")
            .set_filter("route", route)
            .set_include(["stop", "trip", "route", "vehicle", "alerts"]),
    )
    .await
}

pub async fn get_green_line_predictions_with_alerts(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(
        &RequestSpec::new("/predictions")
            .set_name("/predictions (Green Line)")
            .set_filter("route", GREEN_LINE_ROUTES)
            .set_include(["stop", "trip", "route", "vehicle", "alerts"]),
    )
    .await
}

pub async fn get_subway_predictions_with_schedules(user: &mut VirtualUser) -> ScenarioResult {
    user.api_request(
        &RequestSpec::new("/predictions")
            .set_name("/predictions (all subway routes)")
            .set_filter("route", SUBWAY_ROUTES)
            .set_include(["vehicle", "schedule", "stop", "route", "trip"]),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Transport, TransportError, TransportResponse};
    use crate::user::ThinkTime;
    use async_trait::async_trait;
    use http::StatusCode;
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use url::Url;

    /// Records every request instead of sending it.
    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<(String, Vec<(String, String)>, HeaderMap)>>,
    }
    impl RecordingTransport {
        fn take(&self) -> Vec<(String, Vec<(String, String)>, HeaderMap)> {
            std::mem::take(&mut *self.requests.lock().unwrap())
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn get(
            &self,
            url: &Url,
            params: &[(String, String)],
            headers: &HeaderMap,
        ) -> Result<TransportResponse, TransportError> {
            self.requests
                .lock()
                .unwrap()
                .push((url.path().to_string(), params.to_vec(), headers.clone()));
            Ok(TransportResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
            })
        }
    }

    fn build_user(transport: Arc<RecordingTransport>) -> VirtualUser {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("catalog-key"));
        VirtualUser::new(
            0,
            Url::parse("http://127.0.0.1/").unwrap(),
            headers,
            ThinkTime::new(0.0, 0.0).unwrap(),
            transport,
            Instant::now(),
        )
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn weights_follow_variant_counts() {
        let scenarios = api_scenarios().unwrap();
        assert_eq!(scenarios.len(), 16);
        let weight = |name: &str| {
            scenarios
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.weight)
                .unwrap()
        };
        assert_eq!(weight("portal"), 10);
        assert_eq!(weight("all subway stops"), 5);
        assert_eq!(weight("subway schedules"), 8);
        assert_eq!(weight("key bus route schedules"), 15);
        assert_eq!(weight("solari screen predictions"), 6);
        assert_eq!(weight("e-ink screen schedules"), 4);
        assert_eq!(weight("back bay schedules"), 1);
        assert_eq!(weight("heavy rail predictions"), 3);
        let total: usize = scenarios.iter().map(|s| s.weight).sum();
        assert_eq!(total, 86);
    }

    #[test]
    fn subway_routes_cover_heavy_and_light_rail() {
        let combined: Vec<&str> = HEAVY_RAIL_ROUTES
            .iter()
            .chain(LIGHT_RAIL_ROUTES.iter())
            .copied()
            .collect();
        assert_eq!(combined, SUBWAY_ROUTES.to_vec());
    }

    #[tokio::test]
    async fn fixed_requests() {
        let transport = Arc::new(RecordingTransport::default());
        let mut user = build_user(transport.clone());

        get_back_bay_schedules(&mut user).await.unwrap();
        get_commuter_rail_station_predictions(&mut user).await.unwrap();
        get_all_subway_stops(&mut user).await.unwrap();
        get_portal(&mut user).await.unwrap();

        let requests = transport.take();
        assert_eq!(requests.len(), 4);

        assert_eq!(requests[0].0, "/schedules");
        assert_eq!(
            requests[0].1,
            params(&[
                (
                    "filter[route]",
                    "CR-Worcester,CR-Franklin,CR-Needham,CR-Providence"
                ),
                ("filter[stop]", "place-bbsta"),
                ("include", "route,stop,trip"),
                ("sort", "departure_time"),
            ])
        );
        assert_eq!(requests[0].2["x-api-key"], "catalog-key");

        assert_eq!(
            requests[1].1,
            params(&[
                ("filter[route_type]", "2"),
                ("filter[stop]", "place-sstat,place-north,place-bbsta"),
                ("include", "trip,schedule,stop"),
            ])
        );

        assert_eq!(
            requests[2].1,
            params(&[
                (
                    "filter[route]",
                    "Red,Orange,Blue,Green-B,Green-C,Green-D,Green-E,Mattapan"
                ),
                ("include", "route"),
            ])
        );

        assert_eq!(requests[3].0, "/");
        assert!(requests[3].1.is_empty());
    }

    #[tokio::test]
    async fn variant_scenarios_issue_one_request() {
        let transport = Arc::new(RecordingTransport::default());
        let mut user = build_user(transport.clone());

        for _ in 0..50 {
            get_subway_schedules(&mut user).await.unwrap();
        }
        let requests = transport.take();
        assert_eq!(requests.len(), 50);
        for (path, params, _) in &requests {
            assert_eq!(path, "/schedules");
            assert_eq!(params.len(), 1);
            assert!(SUBWAY_ROUTES.contains(&params[0].1.as_str()));
        }
    }

    #[tokio::test]
    async fn solari_busways_join_stops() {
        let transport = Arc::new(RecordingTransport::default());
        let mut user = build_user(transport.clone());

        for _ in 0..100 {
            get_solari_screen_predictions(&mut user).await.unwrap();
        }
        let expected: Vec<String> = SOLARI_SCREEN_STOPS.iter().map(|s| s.join(",")).collect();
        for (_, params, _) in transport.take() {
            assert_eq!(params[0].0, "filter[stop]");
            assert!(expected.contains(&params[0].1));
            assert_eq!(params[1].1, "route,stop,trip,trip.stops,vehicle,alerts");
            assert_eq!(params[2], ("sort".to_string(), "departure_time".to_string()));
        }
    }

    #[tokio::test]
    async fn eink_direction_is_zero_or_one() {
        let transport = Arc::new(RecordingTransport::default());
        let mut user = build_user(transport.clone());

        for _ in 0..20 {
            get_eink_screen_schedules(&mut user).await.unwrap();
        }
        for (_, params, _) in transport.take() {
            assert_eq!(params[0].0, "filter[direction_id]");
            assert!(params[0].1 == "0" || params[0].1 == "1");
            assert_eq!(params[1].1, "place-bcnwa,place-mfa");
        }
    }
}
