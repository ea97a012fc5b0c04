use serde::{Deserialize, Serialize};

use crate::math::{clamp_lat_deg, normalize_lon_deg};

/// Geographic box: longitudes/latitudes in degrees, heights in meters.
///
/// Invariants (enforced by [`GeoBoundingBox::new`]): `west < east`,
/// `south < north`, `bottom < top`, longitudes in `[-180, 180]` and latitudes
/// in `[-90, 90]`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoBoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub bottom: f64,
    pub top: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoundsError {
    NonFinite,
    OutOfRange { field: &'static str, value: f64 },
    Inverted { axis: &'static str },
}

impl std::fmt::Display for BoundsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundsError::NonFinite => write!(f, "bounding box has non-finite coordinates"),
            BoundsError::OutOfRange { field, value } => {
                write!(f, "bounding box {field} out of range: {value}")
            }
            BoundsError::Inverted { axis } => {
                write!(f, "bounding box is empty or inverted along {axis}")
            }
        }
    }
}

impl std::error::Error for BoundsError {}

impl GeoBoundingBox {
    pub fn new(
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        bottom: f64,
        top: f64,
    ) -> Result<Self, BoundsError> {
        let b = Self {
            west,
            south,
            east,
            north,
            bottom,
            top,
        };
        b.validate()?;
        Ok(b)
    }

    /// Build a box from corners that may lie slightly outside the valid range.
    ///
    /// Longitudes are wrapped, latitudes clamped; the result is then validated.
    pub fn from_clamped(
        west: f64,
        south: f64,
        east: f64,
        north: f64,
        bottom: f64,
        top: f64,
    ) -> Result<Self, BoundsError> {
        let west = if west < -180.0 { -180.0 } else { normalize_lon_deg(west) };
        let east = if east > 180.0 { 180.0 } else { normalize_lon_deg(east) };
        Self::new(
            west,
            clamp_lat_deg(south),
            east,
            clamp_lat_deg(north),
            bottom,
            top,
        )
    }

    pub fn validate(&self) -> Result<(), BoundsError> {
        let all = self.as_array();
        if all.iter().any(|v| !v.is_finite()) {
            return Err(BoundsError::NonFinite);
        }
        for (field, value) in [("west", self.west), ("east", self.east)] {
            if !(-180.0..=180.0).contains(&value) {
                return Err(BoundsError::OutOfRange { field, value });
            }
        }
        for (field, value) in [("south", self.south), ("north", self.north)] {
            if !(-90.0..=90.0).contains(&value) {
                return Err(BoundsError::OutOfRange { field, value });
            }
        }
        if self.west >= self.east {
            return Err(BoundsError::Inverted { axis: "longitude" });
        }
        if self.south >= self.north {
            return Err(BoundsError::Inverted { axis: "latitude" });
        }
        if self.bottom >= self.top {
            return Err(BoundsError::Inverted { axis: "height" });
        }
        Ok(())
    }

    /// `[west, south, east, north, bottom, top]`
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.west,
            self.south,
            self.east,
            self.north,
            self.bottom,
            self.top,
        ]
    }

    pub fn center_lon(&self) -> f64 {
        (self.west + self.east) * 0.5
    }

    pub fn center_lat(&self) -> f64 {
        (self.south + self.north) * 0.5
    }

    pub fn center_height(&self) -> f64 {
        (self.bottom + self.top) * 0.5
    }
}
