//! Geocoding collaborator: address → coordinate, best effort.
//!
//! Lookups go to a Nominatim-compatible endpoint. Every failure path
//! (timeout, bad status, unparseable payload, empty result) degrades to
//! `None`; callers treat a missing coordinate as a soft condition, never an
//! error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use ronde_core::{Coordinate, DomainError};
use ronde_store::Store;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ronde-geo";

/// Minimum spacing between outbound geocoding calls. An explicit object
/// rather than process-global state, so tests can scope and tune it.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until the minimum interval since the previous call has elapsed,
    /// then claim the slot.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve a free-text postal address, optionally hinted with an ISO
    /// country code. `None` means "could not resolve", never an error.
    async fn geocode(&self, address: &str, country_hint: Option<&str>) -> Option<Coordinate>;
}

#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub min_interval: Duration,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: "ronde/0.1".to_string(),
            timeout: Duration::from_secs(8),
            min_interval: Duration::from_secs(1),
        }
    }
}

impl GeoConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("RONDE_GEOCODER_URL").unwrap_or(defaults.base_url),
            user_agent: std::env::var("RONDE_USER_AGENT").unwrap_or(defaults.user_agent),
            timeout: std::env::var("RONDE_GEOCODER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            min_interval: std::env::var("RONDE_GEOCODER_MIN_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_interval),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
}

/// Nominatim-backed geocoder with an in-process rate gate.
#[derive(Debug)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    gate: RateGate,
}

impl NominatimGeocoder {
    pub fn new(config: GeoConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            gate: RateGate::new(config.min_interval),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str, country_hint: Option<&str>) -> Option<Coordinate> {
        self.gate.wait().await;

        let span = info_span!("geocode", address);
        let _guard = span.enter();

        let mut query: Vec<(&str, String)> = vec![
            ("q", address.to_string()),
            ("format", "json".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(country) = country_hint {
            query.push(("countrycodes", country.to_ascii_lowercase()));
        }

        let url = format!("{}/search", self.base_url);
        let response = match self.client.get(&url).query(&query).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "geocode request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "geocode returned non-success status");
            return None;
        }
        let hits: Vec<NominatimHit> = match response.json().await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%err, "geocode payload was not valid JSON");
                return None;
            }
        };
        let hit = hits.into_iter().next()?;
        match (hit.lat.parse::<f64>(), hit.lon.parse::<f64>()) {
            (Ok(lat), Ok(lon)) => Some(Coordinate::new(lat, lon)),
            _ => {
                warn!("geocode hit carried unparseable coordinates");
                None
            }
        }
    }
}

/// Resolve and persist a client's coordinate from its postal address.
/// Returns the coordinate now on record, which stays `None` when the
/// geocoder cannot resolve the address.
pub async fn geocode_client<S: Store + ?Sized, G: Geocoder + ?Sized>(
    store: &S,
    geocoder: &G,
    client_id: Uuid,
) -> Result<Option<Coordinate>, DomainError> {
    let mut client = store
        .client(client_id)
        .await?
        .ok_or(DomainError::NotFound)?;
    if client.coordinate.is_some() {
        return Ok(client.coordinate);
    }

    let address = format!(
        "{}, {} {}",
        client.address, client.postal_code, client.city
    );
    let Some(coordinate) = geocoder.geocode(&address, Some(&client.country)).await else {
        return Ok(None);
    };

    client.coordinate = Some(coordinate);
    store.update_client(client).await?;
    Ok(Some(coordinate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ronde_store::MemoryStore;
    use ronde_core::Client;

    struct FixedGeocoder(Option<Coordinate>);

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn geocode(&self, _address: &str, _country_hint: Option<&str>) -> Option<Coordinate> {
            self.0
        }
    }

    fn sample_client(owner: Uuid) -> Client {
        Client {
            id: Uuid::new_v4(),
            owner_id: owner,
            name: "M. Perrin".into(),
            email: "perrin@example.net".into(),
            address: "18 rue de la Paix".into(),
            city: "Paris".into(),
            postal_code: "75002".into(),
            country: "FR".into(),
            coordinate: None,
        }
    }

    #[tokio::test]
    async fn rate_gate_spaces_out_consecutive_calls() {
        let gate = RateGate::new(Duration::from_millis(40));
        let started = Instant::now();
        gate.wait().await;
        gate.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn geocode_client_persists_the_found_coordinate() {
        let store = MemoryStore::new();
        let client = sample_client(Uuid::new_v4());
        let id = client.id;
        store.insert_client(client).await.unwrap();

        let geocoder = FixedGeocoder(Some(Coordinate::new(48.8692, 2.3317)));
        let found = geocode_client(&store, &geocoder, id).await.unwrap();
        assert!(found.is_some());

        let stored = store.client(id).await.unwrap().unwrap();
        assert_eq!(stored.coordinate, found);
    }

    #[tokio::test]
    async fn unresolvable_address_stays_uncoded_without_error() {
        let store = MemoryStore::new();
        let client = sample_client(Uuid::new_v4());
        let id = client.id;
        store.insert_client(client).await.unwrap();

        let geocoder = FixedGeocoder(None);
        let found = geocode_client(&store, &geocoder, id).await.unwrap();
        assert!(found.is_none());
        assert!(store.client(id).await.unwrap().unwrap().coordinate.is_none());
    }

    #[tokio::test]
    async fn missing_client_is_a_hard_not_found() {
        let store = MemoryStore::new();
        let geocoder = FixedGeocoder(None);
        let err = geocode_client(&store, &geocoder, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }
}
