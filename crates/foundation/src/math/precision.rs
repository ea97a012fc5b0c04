//! Precision policies.
//!
//! CPU math stays in `f64`; anything handed to the GPU is expressed relative to a
//! high-precision origin and then narrowed to `f32`.

use super::Vec3;

/// GPU-friendly, camera-relative position in `f32`.
pub type CameraRelativeF32 = [f32; 3];

/// Camera-relative precision model.
///
/// Store a high-precision `origin` (typically the camera eye), and express all
/// GPU positions relative to it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CameraRelative {
    pub origin: Vec3,
}

impl CameraRelative {
    pub fn new(origin: Vec3) -> Self {
        Self { origin }
    }

    /// Convert a world-space point (f64) to a camera-relative `f32` offset.
    #[inline]
    pub fn to_f32(self, world: Vec3) -> CameraRelativeF32 {
        (world - self.origin).to_f32_array()
    }
}
