//! Tour route optimization: haversine distance, travel-time estimation,
//! the nearest-neighbour order builder, and orchestration over the store.
//!
//! The builder is a greedy heuristic, not an optimal TSP solver. Consumers
//! rely on its determinism: identical inputs always produce the same order.

use ronde_core::{Coordinate, DomainError, OptimizedRoute, Stop};
use ronde_store::Store;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ronde-routing";

/// Assumed average travel speed between stops.
pub const DEFAULT_SPEED_KMH: f64 = 30.0;

/// Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points, kilometres. Symmetric, zero
/// for identical points.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Travel time in whole minutes at the given average speed.
pub fn travel_time_minutes(km: f64, speed_kmh: f64) -> i64 {
    (km / speed_kmh * 60.0).round() as i64
}

/// Greedy nearest-neighbour tour over geocoded stops.
///
/// With a start coordinate, the first visited stop is the one nearest the
/// start (the start itself is not emitted). Without one, the first input
/// stop seeds the tour. Ties go to the first-encountered minimum, so the
/// order is stable for identical inputs. The result is a permutation of
/// every input id.
pub fn nearest_neighbor(stops: &[(Uuid, Coordinate)], start: Option<Coordinate>) -> Vec<Uuid> {
    if stops.is_empty() {
        return Vec::new();
    }

    let mut visited = vec![false; stops.len()];
    let mut order = Vec::with_capacity(stops.len());

    let first = match start {
        Some(origin) => nearest_unvisited(stops, &visited, origin)
            .unwrap_or(0),
        None => 0,
    };
    visited[first] = true;
    order.push(stops[first].0);
    let mut position = stops[first].1;

    while order.len() < stops.len() {
        let Some(next) = nearest_unvisited(stops, &visited, position) else {
            break;
        };
        visited[next] = true;
        order.push(stops[next].0);
        position = stops[next].1;
    }

    order
}

fn nearest_unvisited(
    stops: &[(Uuid, Coordinate)],
    visited: &[bool],
    from: Coordinate,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, (_, at)) in stops.iter().enumerate() {
        if visited[index] {
            continue;
        }
        let km = distance_km(from, *at);
        // Strict comparison keeps the first-encountered minimum on ties.
        if best.map_or(true, |(_, best_km)| km < best_km) {
            best = Some((index, km));
        }
    }
    best.map(|(index, _)| index)
}

/// Total length of a tour visiting `order` in sequence, kilometres.
fn tour_length_km(order: &[Uuid], stops: &[(Uuid, Coordinate)]) -> f64 {
    let coordinate_of = |id: &Uuid| {
        stops
            .iter()
            .find(|(stop_id, _)| stop_id == id)
            .map(|(_, at)| *at)
    };
    order
        .windows(2)
        .filter_map(|pair| {
            let a = coordinate_of(&pair[0])?;
            let b = coordinate_of(&pair[1])?;
            Some(distance_km(a, b))
        })
        .sum()
}

/// Optimize a tour over the given appointment ids.
///
/// Each id resolves through the store to its appointment (service duration)
/// and, via the owning client, a coordinate. Ids that resolve to nothing
/// are skipped; if none resolve the call fails with `NotFound`. When no
/// resolved stop carries a coordinate the original input order comes back
/// verbatim with zero distance (degraded mode, not an error). Otherwise the
/// nearest-neighbour order covers the geocoded subset only; stops without a
/// coordinate are excluded from the sequence but their service durations
/// still count toward the estimate. Reads only, never writes.
pub async fn optimize_route<S: Store + ?Sized>(
    store: &S,
    stop_ids: &[Uuid],
    start: Option<Coordinate>,
) -> Result<OptimizedRoute, DomainError> {
    if stop_ids.is_empty() {
        return Err(DomainError::InvalidInput(
            "at least one stop id is required".into(),
        ));
    }

    let mut resolved: Vec<Stop> = Vec::with_capacity(stop_ids.len());
    for id in stop_ids {
        let Some(appointment) = store.appointment(*id).await? else {
            continue;
        };
        let coordinate = match store.client(appointment.client_id).await? {
            Some(client) => client.coordinate,
            None => None,
        };
        resolved.push(Stop {
            id: *id,
            coordinate,
            service_minutes: appointment.service_minutes,
        });
    }

    if resolved.is_empty() {
        return Err(DomainError::NotFound);
    }

    let service_minutes: i64 = resolved.iter().map(|stop| stop.service_minutes).sum();
    let geocoded: Vec<(Uuid, Coordinate)> = resolved
        .iter()
        .filter_map(|stop| stop.coordinate.map(|at| (stop.id, at)))
        .collect();

    if geocoded.is_empty() {
        debug!(stops = stop_ids.len(), "no geocoded stops, returning input order");
        return Ok(OptimizedRoute {
            ordered_ids: stop_ids.to_vec(),
            total_km: 0.0,
            estimated_minutes: service_minutes,
        });
    }

    let ordered_ids = nearest_neighbor(&geocoded, start);
    let total_km = tour_length_km(&ordered_ids, &geocoded);
    let estimated_minutes = travel_time_minutes(total_km, DEFAULT_SPEED_KMH) + service_minutes;

    debug!(
        stops = stop_ids.len(),
        geocoded = geocoded.len(),
        total_km,
        estimated_minutes,
        "tour optimized"
    );

    Ok(OptimizedRoute {
        ordered_ids,
        total_km,
        estimated_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use ronde_core::{Appointment, AppointmentStatus, Client};
    use ronde_store::MemoryStore;

    fn point(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon)
    }

    #[test]
    fn distance_is_zero_for_identical_points_and_symmetric() {
        let nantes = point(47.2184, -1.5536);
        let rennes = point(48.1173, -1.6778);
        assert!(distance_km(nantes, nantes) < 1e-9);
        assert!((distance_km(nantes, rennes) - distance_km(rennes, nantes)).abs() < 1e-9);
    }

    #[test]
    fn distance_matches_a_known_pair() {
        // Paris to Lyon is roughly 390 km as the crow flies.
        let paris = point(48.8566, 2.3522);
        let lyon = point(45.7640, 4.8357);
        let km = distance_km(paris, lyon);
        assert!((380.0..410.0).contains(&km), "got {km}");
    }

    #[test]
    fn travel_time_uses_the_average_speed() {
        // 15 km at 30 km/h is half an hour.
        assert_eq!(travel_time_minutes(15.0, 30.0), 30);
        assert_eq!(travel_time_minutes(0.0, 30.0), 0);
    }

    #[test]
    fn builder_returns_a_full_permutation() {
        let stops: Vec<(Uuid, Coordinate)> = (0..6)
            .map(|i| (Uuid::new_v4(), point(47.0 + f64::from(i) * 0.01, -1.5)))
            .collect();
        let order = nearest_neighbor(&stops, None);
        assert_eq!(order.len(), stops.len());
        let mut seen = order.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), stops.len());
    }

    #[test]
    fn collinear_stops_are_walked_outward_from_the_first() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let stops = vec![
            (a, point(0.0, 0.0)),
            (c, point(0.0, 2.0)),
            (b, point(0.0, 1.0)),
        ];
        // From A, B is closer than C, so the tour walks A, B, C.
        assert_eq!(nearest_neighbor(&stops, None), vec![a, b, c]);
    }

    #[test]
    fn start_coordinate_seeds_the_nearest_stop_first() {
        let far = Uuid::new_v4();
        let near = Uuid::new_v4();
        let stops = vec![
            (far, point(0.0, 5.0)),
            (near, point(0.0, 1.0)),
        ];
        let order = nearest_neighbor(&stops, Some(point(0.0, 0.0)));
        assert_eq!(order, vec![near, far]);
    }

    #[test]
    fn ties_go_to_the_first_encountered_stop() {
        let left = Uuid::new_v4();
        let right = Uuid::new_v4();
        let stops = vec![
            (left, point(0.0, -1.0)),
            (right, point(0.0, 1.0)),
        ];
        let order = nearest_neighbor(&stops, Some(point(0.0, 0.0)));
        assert_eq!(order[0], left);
    }

    async fn seed_stop(
        store: &MemoryStore,
        worker: Uuid,
        coordinate: Option<Coordinate>,
        service_minutes: i64,
    ) -> Uuid {
        let client = Client {
            id: Uuid::new_v4(),
            owner_id: worker,
            name: "client".into(),
            email: format!("{}@example.net", Uuid::new_v4()),
            address: "1 rue Haute".into(),
            city: "Nantes".into(),
            postal_code: "44000".into(),
            country: "FR".into(),
            coordinate,
        };
        let starts_at = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().unwrap();
        let appointment = Appointment {
            id: Uuid::new_v4(),
            worker_id: worker,
            client_id: client.id,
            starts_at,
            ends_at: starts_at + Duration::minutes(service_minutes),
            status: AppointmentStatus::Scheduled,
            service_kind: "home_care".into(),
            notes: None,
            price: 40.0,
            service_minutes,
        };
        let id = appointment.id;
        store.insert_client(client).await.unwrap();
        store.insert_appointment(appointment).await.unwrap();
        id
    }

    #[tokio::test]
    async fn three_collinear_stops_come_back_in_outward_order() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();
        let a = seed_stop(&store, worker, Some(point(0.0, 0.0)), 30).await;
        let b = seed_stop(&store, worker, Some(point(0.0, 1.0)), 30).await;
        let c = seed_stop(&store, worker, Some(point(0.0, 2.0)), 30).await;

        let route = optimize_route(&store, &[a, b, c], None).await.unwrap();
        assert_eq!(route.ordered_ids, vec![a, b, c]);
        // Two one-degree legs along the equator-adjacent meridian.
        assert!(route.total_km > 200.0);
        assert_eq!(
            route.estimated_minutes,
            travel_time_minutes(route.total_km, DEFAULT_SPEED_KMH) + 90
        );
    }

    #[tokio::test]
    async fn all_stops_without_coordinates_fall_back_to_input_order() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();
        let a = seed_stop(&store, worker, None, 45).await;
        let b = seed_stop(&store, worker, None, 15).await;

        let route = optimize_route(&store, &[b, a], None).await.unwrap();
        assert_eq!(route.ordered_ids, vec![b, a]);
        assert_eq!(route.total_km, 0.0);
        assert_eq!(route.estimated_minutes, 60);
    }

    #[tokio::test]
    async fn stops_without_a_coordinate_are_excluded_but_still_counted() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();
        let located = seed_stop(&store, worker, Some(point(47.2, -1.55)), 20).await;
        let unlocated = seed_stop(&store, worker, None, 40).await;

        let route = optimize_route(&store, &[located, unlocated], None)
            .await
            .unwrap();
        assert_eq!(route.ordered_ids, vec![located]);
        assert_eq!(route.estimated_minutes, 60);
    }

    #[tokio::test]
    async fn nothing_resolving_is_a_hard_not_found() {
        let store = MemoryStore::new();
        let err = optimize_route(&store, &[Uuid::new_v4(), Uuid::new_v4()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let store = MemoryStore::new();
        let err = optimize_route(&store, &[], None).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidInput(_)));
    }
}
