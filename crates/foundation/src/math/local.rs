use super::{Ecef, Geodetic, Vec3, geodetic_to_ecef};

/// Local East-North-Up coordinates (meters).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Enu {
    pub east: f64,
    pub north: f64,
    pub up: f64,
}

impl Enu {
    pub fn new(east: f64, north: f64, up: f64) -> Self {
        Self { east, north, up }
    }
}

/// Orthonormal East/North/Up axes expressed in ECEF, anchored at a geodetic origin.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EnuBasis {
    pub east: Vec3,
    pub north: Vec3,
    pub up: Vec3,
}

impl EnuBasis {
    pub fn at(origin: Geodetic) -> Self {
        let sin_lat = origin.lat_rad.sin();
        let cos_lat = origin.lat_rad.cos();
        let sin_lon = origin.lon_rad.sin();
        let cos_lon = origin.lon_rad.cos();

        Self {
            east: Vec3::new(-sin_lon, cos_lon, 0.0),
            north: Vec3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat),
            up: Vec3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat),
        }
    }

    /// Rotate an ECEF direction into this local frame (no translation).
    pub fn direction_to_enu(&self, dir: Vec3) -> Enu {
        Enu::new(dir.dot(self.east), dir.dot(self.north), dir.dot(self.up))
    }
}

pub fn ecef_to_enu(point: Ecef, origin: Geodetic) -> Enu {
    let origin_ecef = geodetic_to_ecef(origin);
    let d = point.as_vec3() - origin_ecef.as_vec3();
    EnuBasis::at(origin).direction_to_enu(d)
}

pub fn enu_to_ecef(enu: Enu, origin: Geodetic) -> Ecef {
    let basis = EnuBasis::at(origin);
    let offset = basis.east * enu.east + basis.north * enu.north + basis.up * enu.up;
    Ecef::from(geodetic_to_ecef(origin).as_vec3() + offset)
}
