use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GoogleBackend;
use crate::error::StampError;
use crate::metadata::GeoCoordinate;

/// Nearby-search tuning. Candidates come back ranked by distance; only the
/// closest few are ever worth inspecting.
const POI_RADIUS_METERS: f64 = 500.0;
const POI_MAX_RESULTS: u32 = 3;
/// A point of interest only names the photo's location when it is
/// practically on top of it and popular enough to be recognizable.
const POI_MAX_DISTANCE_METERS: f64 = 100.0;
const POI_MIN_RATING_COUNT: u32 = 50;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

const DEFAULT_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const DEFAULT_PLACES_URL: &str = "https://places.googleapis.com/v1/places:searchNearby";
const DEFAULT_LANGUAGE: &str = "ja";

/// One candidate from the nearby point-of-interest search.
#[derive(Debug, Clone)]
pub struct PlaceCandidate {
    pub name: String,
    pub types: Vec<String>,
    pub rating_count: u32,
    pub location: GeoCoordinate,
}

/// One structured component of a reverse-geocode result.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressComponent {
    pub long_name: String,
    pub types: Vec<String>,
}

/// Reverse-geocode decomposition used while composing the display string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationParts {
    pub country: Option<String>,
    pub prefecture: Option<String>,
    pub city: Option<String>,
    pub specific_place: Option<String>,
}

/// Upstream geocode/places provider pair behind one abstraction so the
/// composition logic is testable without the network.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Tourist attractions near `origin`, provider-ranked by distance.
    async fn nearby_attractions(
        &self,
        origin: GeoCoordinate,
    ) -> Result<Vec<PlaceCandidate>, StampError>;

    /// Structured address components for `origin` (first result's).
    async fn reverse_geocode(
        &self,
        origin: GeoCoordinate,
    ) -> Result<Vec<AddressComponent>, StampError>;
}

/// Great-circle distance in meters between two coordinates.
pub fn haversine_distance(a: GeoCoordinate, b: GeoCoordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let delta_phi = (b.latitude - a.latitude).to_radians();
    let delta_lambda = (b.longitude - a.longitude).to_radians();

    let h = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// First provider-ranked candidate that is close enough, actually typed as
/// a tourist attraction, and popular enough to trust.
pub fn select_attraction(
    origin: GeoCoordinate,
    candidates: &[PlaceCandidate],
) -> Option<String> {
    candidates
        .iter()
        .find(|place| {
            haversine_distance(origin, place.location) <= POI_MAX_DISTANCE_METERS
                && place.types.iter().any(|t| t == "tourist_attraction")
                && place.rating_count >= POI_MIN_RATING_COUNT
        })
        .map(|place| place.name.clone())
}

/// Decompose address components into the parts the display string is
/// built from.
pub fn split_address_parts(components: &[AddressComponent]) -> LocationParts {
    let find = |wanted: &str| {
        components
            .iter()
            .find(|c| c.types.iter().any(|t| t == wanted))
            .map(|c| c.long_name.clone())
    };

    let country = find("country");
    let prefecture = find("administrative_area_level_1");
    let city = find("locality").or_else(|| find("administrative_area_level_2"));

    let priorities = [
        "point_of_interest",
        "establishment",
        "natural_feature",
        "park",
        "premise",
        "sublocality_level_1",
    ];
    let specific_place = priorities
        .iter()
        .filter_map(|p| find(p))
        .find(|name| Some(name) != city.as_ref() && Some(name) != prefecture.as_ref());

    LocationParts {
        country,
        prefecture,
        city,
        specific_place,
    }
}

/// Assemble the display string: prefix (prefecture inside Japan, country
/// elsewhere), city, then the most specific name, deduplicated in
/// first-occurrence order and joined with single spaces.
pub fn compose_location(parts: &LocationParts, attraction: Option<String>) -> String {
    let prefix = match (&parts.country, &parts.prefecture) {
        (Some(country), Some(prefecture)) if country == "日本" || country == "Japan" => {
            Some(prefecture.clone())
        }
        (country, _) => country.clone(),
    };
    let specific = attraction.or_else(|| parts.specific_place.clone());

    let mut tokens: Vec<String> = Vec::new();
    for token in [prefix, parts.city.clone(), specific].into_iter().flatten() {
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens.join(" ")
}

/// The two-stage lookup: best-effort attraction search combined with the
/// authoritative reverse geocode.
pub struct SmartLocationService {
    provider: Arc<dyn GeoProvider>,
}

impl SmartLocationService {
    pub fn new(provider: Arc<dyn GeoProvider>) -> Self {
        Self { provider }
    }

    pub async fn lookup(&self, origin: GeoCoordinate) -> Result<String, StampError> {
        let (attraction, components) = tokio::join!(
            self.provider.nearby_attractions(origin),
            self.provider.reverse_geocode(origin),
        );

        // The POI leg is advisory; a failure there only loses specificity.
        let attraction = match attraction {
            Ok(candidates) => select_attraction(origin, &candidates),
            Err(e) => {
                tracing::warn!(error = %e, "nearby attraction lookup failed");
                None
            }
        };
        let parts = split_address_parts(&components?);

        let location = compose_location(&parts, attraction);
        if location.is_empty() {
            return Err(StampError::ResolutionFailed(
                "場所を特定できませんでした。".into(),
            ));
        }
        Ok(location)
    }
}

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    places: Option<Vec<PlaceEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceEntry {
    display_name: DisplayName,
    #[serde(default)]
    types: Vec<String>,
    user_rating_count: Option<u32>,
    location: PlacePoint,
}

#[derive(Debug, Deserialize)]
struct DisplayName {
    text: String,
}

#[derive(Debug, Deserialize)]
struct PlacePoint {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    address_components: Vec<AddressComponent>,
}

/// Provider implementation speaking the Google-style wire formats.
pub struct HttpGeoProvider {
    client: reqwest::Client,
    geocode_url: String,
    places_url: String,
    api_key: String,
    language: String,
}

impl HttpGeoProvider {
    pub fn new(cfg: &GoogleBackend) -> Self {
        Self {
            client: reqwest::Client::new(),
            geocode_url: cfg
                .geocode_url
                .clone()
                .unwrap_or_else(|| DEFAULT_GEOCODE_URL.to_string()),
            places_url: cfg
                .places_url
                .clone()
                .unwrap_or_else(|| DEFAULT_PLACES_URL.to_string()),
            api_key: cfg.api_key.clone().unwrap_or_default(),
            language: cfg
                .language
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        }
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn nearby_attractions(
        &self,
        origin: GeoCoordinate,
    ) -> Result<Vec<PlaceCandidate>, StampError> {
        let body = serde_json::json!({
            "includedTypes": ["tourist_attraction"],
            "maxResultCount": POI_MAX_RESULTS,
            "languageCode": self.language,
            "rankPreference": "DISTANCE",
            "locationRestriction": {
                "circle": {
                    "center": {
                        "latitude": origin.latitude,
                        "longitude": origin.longitude,
                    },
                    "radius": POI_RADIUS_METERS,
                },
            },
        });
        let resp = self
            .client
            .post(&self.places_url)
            .header("X-Goog-Api-Key", &self.api_key)
            .header(
                "X-Goog-FieldMask",
                "places.displayName,places.types,places.userRatingCount,places.location",
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| StampError::ResolutionFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StampError::ResolutionFailed(format!(
                "places search returned status {}",
                resp.status()
            )));
        }
        let data: PlacesResponse = resp
            .json()
            .await
            .map_err(|e| StampError::ResolutionFailed(e.to_string()))?;

        Ok(data
            .places
            .unwrap_or_default()
            .into_iter()
            .map(|p| PlaceCandidate {
                name: p.display_name.text,
                types: p.types,
                rating_count: p.user_rating_count.unwrap_or(0),
                location: GeoCoordinate {
                    latitude: p.location.latitude,
                    longitude: p.location.longitude,
                },
            })
            .collect())
    }

    async fn reverse_geocode(
        &self,
        origin: GeoCoordinate,
    ) -> Result<Vec<AddressComponent>, StampError> {
        let resp = self
            .client
            .get(&self.geocode_url)
            .query(&[
                ("latlng", format!("{},{}", origin.latitude, origin.longitude)),
                ("key", self.api_key.clone()),
                ("language", self.language.clone()),
            ])
            .send()
            .await
            .map_err(|e| StampError::ResolutionFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StampError::ResolutionFailed(
                "Geocoding API request failed".into(),
            ));
        }
        let data: GeocodeResponse = resp
            .json()
            .await
            .map_err(|e| StampError::ResolutionFailed(e.to_string()))?;
        if data.status != "OK" || data.results.is_empty() {
            return Err(StampError::ResolutionFailed(format!(
                "Geocoding failed: {}",
                data.status
            )));
        }
        Ok(data.results.into_iter().next().map(|r| r.address_components).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(latitude: f64, longitude: f64) -> GeoCoordinate {
        GeoCoordinate {
            latitude,
            longitude,
        }
    }

    fn component(name: &str, types: &[&str]) -> AddressComponent {
        AddressComponent {
            long_name: name.to_string(),
            types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn haversine_is_symmetric_and_zero_on_identity() {
        let a = coord(35.6586, 139.7454);
        let b = coord(35.6895, 139.6917);
        assert_eq!(haversine_distance(a, b), haversine_distance(b, a));
        assert_eq!(haversine_distance(a, a), 0.0);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Tokyo Tower to Tokyo Skytree, roughly 8.2 km.
        let tower = coord(35.6586, 139.7454);
        let skytree = coord(35.7101, 139.8107);
        let d = haversine_distance(tower, skytree);
        assert!((7_900.0..8_500.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn attraction_requires_distance_type_and_popularity() {
        let origin = coord(35.6586, 139.7454);
        let near = PlaceCandidate {
            name: "東京タワー".into(),
            types: vec!["tourist_attraction".into(), "point_of_interest".into()],
            rating_count: 200,
            location: coord(35.65866, 139.74547), // well within 100 m
        };
        let far = PlaceCandidate {
            name: "増上寺".into(),
            types: vec!["tourist_attraction".into()],
            rating_count: 500,
            location: coord(35.6586, 139.76), // over a kilometer east
        };
        let unpopular = PlaceCandidate {
            rating_count: 10,
            ..near.clone()
        };
        let wrong_type = PlaceCandidate {
            types: vec!["restaurant".into()],
            ..near.clone()
        };

        assert_eq!(
            select_attraction(origin, &[far.clone(), near.clone()]),
            Some("東京タワー".into())
        );
        assert_eq!(select_attraction(origin, &[far]), None);
        assert_eq!(select_attraction(origin, &[unpopular]), None);
        assert_eq!(select_attraction(origin, &[wrong_type]), None);
    }

    #[test]
    fn first_accepted_candidate_wins_in_provider_order() {
        let origin = coord(35.6586, 139.7454);
        let first = PlaceCandidate {
            name: "first".into(),
            types: vec!["tourist_attraction".into()],
            rating_count: 60,
            location: origin,
        };
        let second = PlaceCandidate {
            name: "second".into(),
            ..first.clone()
        };
        assert_eq!(
            select_attraction(origin, &[first, second]),
            Some("first".into())
        );
    }

    #[test]
    fn address_parts_follow_priority_order() {
        let components = vec![
            component("日本", &["country", "political"]),
            component("東京都", &["administrative_area_level_1", "political"]),
            component("港区", &["locality", "political"]),
            component("芝公園", &["park", "political"]),
            component("東京タワー", &["establishment"]),
        ];
        let parts = split_address_parts(&components);
        assert_eq!(parts.country.as_deref(), Some("日本"));
        assert_eq!(parts.prefecture.as_deref(), Some("東京都"));
        assert_eq!(parts.city.as_deref(), Some("港区"));
        // "establishment" outranks "park" in the priority list.
        assert_eq!(parts.specific_place.as_deref(), Some("東京タワー"));
    }

    #[test]
    fn specific_place_must_differ_from_city_and_prefecture() {
        let components = vec![
            component("日本", &["country"]),
            component("東京都", &["administrative_area_level_1"]),
            component("港区", &["locality"]),
            component("港区", &["establishment"]),
            component("芝公園", &["park"]),
        ];
        let parts = split_address_parts(&components);
        assert_eq!(parts.specific_place.as_deref(), Some("芝公園"));
    }

    #[test]
    fn city_falls_back_to_second_level_area() {
        let components = vec![
            component("日本", &["country"]),
            component("北海道", &["administrative_area_level_1"]),
            component("勇払郡", &["administrative_area_level_2"]),
        ];
        let parts = split_address_parts(&components);
        assert_eq!(parts.city.as_deref(), Some("勇払郡"));
    }

    #[test]
    fn japan_uses_prefecture_prefix_elsewhere_country() {
        let japan = LocationParts {
            country: Some("日本".into()),
            prefecture: Some("東京都".into()),
            city: Some("港区".into()),
            specific_place: None,
        };
        assert_eq!(compose_location(&japan, None), "東京都 港区");

        let abroad = LocationParts {
            country: Some("フランス".into()),
            prefecture: Some("イル=ド=フランス".into()),
            city: Some("パリ".into()),
            specific_place: None,
        };
        assert_eq!(compose_location(&abroad, None), "フランス パリ");
    }

    #[test]
    fn attraction_overrides_geocoded_specific_place() {
        let parts = LocationParts {
            country: Some("日本".into()),
            prefecture: Some("東京都".into()),
            city: Some("港区".into()),
            specific_place: Some("芝公園".into()),
        };
        assert_eq!(
            compose_location(&parts, Some("東京タワー".into())),
            "東京都 港区 東京タワー"
        );
    }

    #[test]
    fn repeated_tokens_collapse_in_first_occurrence_order() {
        let parts = LocationParts {
            country: Some("日本".into()),
            prefecture: Some("東京都".into()),
            city: Some("港区".into()),
            specific_place: Some("港区".into()),
        };
        assert_eq!(compose_location(&parts, None), "東京都 港区");
    }

    #[test]
    fn empty_parts_compose_to_empty_string() {
        assert_eq!(compose_location(&LocationParts::default(), None), "");
    }
}
