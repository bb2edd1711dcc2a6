pub mod index;

use crate::models::driver::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

/// Point `distance_km` due north of `origin`. Used to place drivers at known distances in tests.
pub fn offset_north_km(origin: &GeoPoint, distance_km: f64) -> GeoPoint {
    GeoPoint {
        lat: origin.lat + (distance_km / EARTH_RADIUS_KM).to_degrees(),
        lng: origin.lng,
    }
}
