//! Camera-driven window estimation.
//!
//! Picks a "probably relevant" geographic box around the camera every update.
//! This is a cheap heuristic, not a frustum/ellipsoid intersection: the forward
//! range comes from intersecting the view ray with a flat ceiling at
//! [`WINDOW_TOP_M`], and anything degenerate falls back to a height-based
//! range. When unsure it errs towards a larger window.

use foundation::GeoBoundingBox;
use foundation::math::{
    Ecef, Enu, EnuBasis, METERS_PER_DEGREE_LAT, Vec3, clamp_lat_deg, ecef_to_geodetic,
    normalize_lon_deg,
};
use serde::{Deserialize, Serialize};

pub const WINDOW_BOTTOM_M: f64 = 0.0;
pub const WINDOW_TOP_M: f64 = 12_000.0;

pub const DEFAULT_VERTICAL_FOV_RAD: f64 = std::f64::consts::FRAC_PI_3;
pub const DEFAULT_ASPECT_RATIO: f64 = 16.0 / 9.0;

const FALLBACK_RANGE_MIN_M: f64 = 5_000.0;
const FALLBACK_RANGE_MAX_M: f64 = 50_000.0;
const RADIUS_FLOOR_M: f64 = 5_000.0;
const RADIUS_MIN_M: f64 = 1_000.0;
const RADIUS_MAX_M: f64 = 50_000.0;
const MIN_COS_LAT: f64 = 0.01;
const PARALLEL_EPS: f64 = 1e-6;

/// Camera pose as seen by the streaming core.
///
/// Any field the host cannot supply may be `None` (or non-finite); the
/// estimator substitutes defaults.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub longitude: f64,
    pub latitude: f64,
    /// Height above the ellipsoid (meters).
    pub height: f64,
    /// View direction in the local East/North/Up frame at the camera.
    pub view_direction: Option<[f64; 3]>,
    pub vertical_fov_rad: Option<f64>,
    pub aspect_ratio: Option<f64>,
}

impl CameraPose {
    pub fn new(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude,
            latitude,
            height,
            view_direction: None,
            vertical_fov_rad: None,
            aspect_ratio: None,
        }
    }

    pub fn with_direction(mut self, dir: Enu) -> Self {
        self.view_direction = Some([dir.east, dir.north, dir.up]);
        self
    }

    pub fn with_frustum(mut self, vertical_fov_rad: f64, aspect_ratio: f64) -> Self {
        self.vertical_fov_rad = Some(vertical_fov_rad);
        self.aspect_ratio = Some(aspect_ratio);
        self
    }

    /// Direction from heading (clockwise from north) and pitch (negative looks down).
    pub fn with_heading_pitch(self, heading_deg: f64, pitch_deg: f64) -> Self {
        let (h, p) = (heading_deg.to_radians(), pitch_deg.to_radians());
        self.with_direction(Enu::new(h.sin() * p.cos(), h.cos() * p.cos(), p.sin()))
    }

    /// Build a pose from an Earth-fixed camera position and view direction.
    pub fn from_ecef(position: Ecef, direction: Vec3) -> Self {
        let geo = ecef_to_geodetic(position);
        let dir = EnuBasis::at(geo).direction_to_enu(direction);
        Self::new(geo.lon_deg(), geo.lat_deg(), geo.alt_m).with_direction(dir)
    }

    fn sanitized_height(&self) -> f64 {
        if self.height.is_finite() { self.height } else { 0.0 }
    }

    fn sanitized_direction(&self) -> Option<Vec3> {
        let [e, n, u] = self.view_direction?;
        Vec3::new(e, n, u).normalized()
    }

    fn sanitized_fov(&self) -> f64 {
        self.vertical_fov_rad
            .filter(|f| f.is_finite() && *f > 0.0 && *f < std::f64::consts::PI)
            .unwrap_or(DEFAULT_VERTICAL_FOV_RAD)
    }

    fn sanitized_aspect(&self) -> f64 {
        self.aspect_ratio
            .filter(|a| a.is_finite() && *a > 0.0)
            .unwrap_or(DEFAULT_ASPECT_RATIO)
    }
}

/// Distance along the view ray to the window ceiling, or `None` if the ray
/// never reaches it in front of the camera.
fn ceiling_range(height: f64, dir: Vec3) -> Option<f64> {
    if dir.z.abs() < PARALLEL_EPS {
        return None;
    }
    let t = (WINDOW_TOP_M - height) / dir.z;
    (t.is_finite() && t > 0.0).then_some(t)
}

fn fallback_range(height: f64) -> f64 {
    (height * 2.0).clamp(FALLBACK_RANGE_MIN_M, FALLBACK_RANGE_MAX_M)
}

/// Horizontal radius (meters) of the window for a pose.
pub fn window_radius_m(pose: &CameraPose) -> f64 {
    let height = pose.sanitized_height();
    let range = pose
        .sanitized_direction()
        .and_then(|dir| ceiling_range(height, dir))
        .unwrap_or_else(|| fallback_range(height));

    let tan_half_y = (pose.sanitized_fov() * 0.5).tan();
    // tan(halfFovX) = tan(halfFovY) * aspect
    let tan_half_x = tan_half_y * pose.sanitized_aspect();

    let half_y = tan_half_y * range;
    let half_x = tan_half_x * range;
    let radius = half_x.max(half_y).max(RADIUS_FLOOR_M);
    if radius.is_finite() {
        radius.clamp(RADIUS_MIN_M, RADIUS_MAX_M)
    } else {
        RADIUS_MAX_M
    }
}

/// Estimate the geographic window worth streaming for the current camera.
pub fn estimate_window(pose: &CameraPose) -> GeoBoundingBox {
    let lon = if pose.longitude.is_finite() {
        normalize_lon_deg(pose.longitude)
    } else {
        0.0
    };
    let lat = if pose.latitude.is_finite() {
        clamp_lat_deg(pose.latitude)
    } else {
        0.0
    };

    let radius = window_radius_m(pose);
    let d_lat = radius / METERS_PER_DEGREE_LAT;
    let cos_lat = lat.to_radians().cos().max(MIN_COS_LAT);
    let d_lon = radius / (METERS_PER_DEGREE_LAT * cos_lat);

    let bbox = GeoBoundingBox {
        west: (lon - d_lon).max(-180.0),
        south: (lat - d_lat).max(-90.0),
        east: (lon + d_lon).min(180.0),
        north: (lat + d_lat).min(90.0),
        bottom: WINDOW_BOTTOM_M,
        top: WINDOW_TOP_M,
    };
    debug_assert!(bbox.validate().is_ok(), "estimated window invalid: {bbox:?}");
    bbox
}
