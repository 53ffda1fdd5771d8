//! Geo context acquisition
//!
//! - **reverse**: coordinates → address, primary/secondary provider chain
//! - **poi**: nearby named points of interest from an Overpass-style tag index
//! - **context**: orchestrates both under a widening-radius or budgeted strategy
//!   and caches the consolidated result

pub mod context;
pub mod poi;
pub mod reverse;

use serde::{Deserialize, Serialize};

use crate::error::{LocateError, Result};

pub use context::{GeoContextBuilder, GeoEvent, GeoObserver, NoopObserver};
pub use poi::{OverpassEndpoint, PoiLocator, PoiProvider, PoiSearch};
pub use reverse::{GeocodeProvider, NominatimProvider, PhotonProvider, ReverseGeocoder, ReverseLookup};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Client-supplied photo location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_meters: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64, accuracy_meters: Option<f64>) -> Result<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(LocateError::InvalidInput(format!("invalid latitude: {}", lat)));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(LocateError::InvalidInput(format!("invalid longitude: {}", lon)));
        }
        let accuracy_meters = accuracy_meters.filter(|a| a.is_finite() && *a >= 0.0);
        Ok(Self {
            lat,
            lon,
            accuracy_meters,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseGeoResult {
    pub display_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl ReverseGeoResult {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.city.is_none()
            && self.state.is_none()
            && self.country.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub distance_m: u32,
    pub hint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoContext {
    pub reverse: ReverseGeoResult,
    pub pois: Vec<Poi>,
    /// Radius that produced `pois`, which may be wider than the one first requested.
    #[serde(rename = "radiusM")]
    pub radius_m: u32,
}

impl GeoContext {
    pub fn has_pois(&self) -> bool {
        !self.pois.is_empty()
    }
}

/// Great-circle distance in metres
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
