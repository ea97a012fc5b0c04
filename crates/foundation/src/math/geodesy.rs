use super::Ecef;

/// WGS84 semi-major axis (meters).
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 semi-minor axis (meters).
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
/// WGS84 first eccentricity squared.
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);
/// WGS84 second eccentricity squared.
pub const WGS84_EP2: f64 = (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
/// IUGG mean Earth radius (meters), used for great-circle distances.
pub const MEAN_EARTH_RADIUS_M: f64 = 6_371_008.8;
/// Approximate length of one degree of latitude (meters).
pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Geodetic coordinates in radians and meters.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Geodetic {
    pub lat_rad: f64,
    pub lon_rad: f64,
    pub alt_m: f64,
}

impl Geodetic {
    pub fn new(lat_rad: f64, lon_rad: f64, alt_m: f64) -> Self {
        Self {
            lat_rad,
            lon_rad,
            alt_m,
        }
    }

    pub fn from_degrees(lon_deg: f64, lat_deg: f64, alt_m: f64) -> Self {
        Self::new(lat_deg.to_radians(), lon_deg.to_radians(), alt_m)
    }

    pub fn lon_deg(&self) -> f64 {
        self.lon_rad.to_degrees()
    }

    pub fn lat_deg(&self) -> f64 {
        self.lat_rad.to_degrees()
    }
}

/// Wrap a longitude into `[-180, 180]`.
pub fn normalize_lon_deg(lon_deg: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon_deg) {
        return lon_deg;
    }
    let wrapped = (lon_deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lon_deg > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Clamp a latitude into `[-90, 90]`.
pub fn clamp_lat_deg(lat_deg: f64) -> f64 {
    lat_deg.clamp(-90.0, 90.0)
}

/// Haversine great-circle distance between two lon/lat points (degrees) on the mean sphere.
pub fn great_circle_distance_m(
    lon_a_deg: f64,
    lat_a_deg: f64,
    lon_b_deg: f64,
    lat_b_deg: f64,
) -> f64 {
    let phi_a = lat_a_deg.to_radians();
    let phi_b = lat_b_deg.to_radians();
    let d_phi = phi_b - phi_a;
    let d_lambda = (lon_b_deg - lon_a_deg).to_radians();

    let h = (d_phi * 0.5).sin().powi(2)
        + phi_a.cos() * phi_b.cos() * (d_lambda * 0.5).sin().powi(2);
    2.0 * MEAN_EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

pub fn geodetic_to_ecef(geo: Geodetic) -> Ecef {
    let sin_lat = geo.lat_rad.sin();
    let cos_lat = geo.lat_rad.cos();
    let sin_lon = geo.lon_rad.sin();
    let cos_lon = geo.lon_rad.cos();

    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    let x = (n + geo.alt_m) * cos_lat * cos_lon;
    let y = (n + geo.alt_m) * cos_lat * sin_lon;
    let z = (n * (1.0 - WGS84_E2) + geo.alt_m) * sin_lat;

    Ecef::new(x, y, z)
}

pub fn ecef_to_geodetic(ecef: Ecef) -> Geodetic {
    let p = (ecef.x * ecef.x + ecef.y * ecef.y).sqrt();
    let lon = ecef.y.atan2(ecef.x);

    let theta = (ecef.z * WGS84_A).atan2(p * WGS84_B);
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let lat = (ecef.z + WGS84_EP2 * WGS84_B * sin_theta * sin_theta * sin_theta)
        .atan2(p - WGS84_E2 * WGS84_A * cos_theta * cos_theta * cos_theta);

    let sin_lat = lat.sin();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
    let alt = p / lat.cos() - n;

    Geodetic::new(lat, lon, alt)
}
