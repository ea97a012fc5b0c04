//! Ray-march parameters derived from a volume's geographic bounds.
//!
//! The volume is modeled as a box in the local ENU frame anchored at the bbox
//! center. Horizontal extents are great-circle distances across the box edges
//! through its center, so high-latitude boxes shrink east-west as expected.

use foundation::math::{
    CameraRelative, Ecef, EnuBasis, Geodetic, Vec3, geodetic_to_ecef, great_circle_distance_m,
};
use foundation::{BoundsError, GeoBoundingBox};

use crate::atlas::VolumeAtlas;

pub const MIN_STEP_M: f64 = 10.0;
pub const MAX_STEP_M: f64 = 2_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum UniformError {
    Bounds(BoundsError),
    /// An axis of the box collapses to (near) zero length.
    DegenerateExtent { axis: &'static str },
    EmptyGrid,
    InvalidStepVoxels(f64),
}

impl std::fmt::Display for UniformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UniformError::Bounds(e) => write!(f, "invalid volume bounds: {e}"),
            UniformError::DegenerateExtent { axis } => {
                write!(f, "volume has no physical extent along {axis}")
            }
            UniformError::EmptyGrid => write!(f, "voxel grid has a zero dimension"),
            UniformError::InvalidStepVoxels(v) => {
                write!(f, "step multiplier must be positive and finite, got {v}")
            }
        }
    }
}

impl std::error::Error for UniformError {}

impl From<BoundsError> for UniformError {
    fn from(e: BoundsError) -> Self {
        UniformError::Bounds(e)
    }
}

/// Render-side description of a volume box, in `f64` world space.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RayMarchUniforms {
    /// Box center in ECEF meters.
    pub center: Ecef,
    pub basis: EnuBasis,
    /// Physical size along east, north, up (meters).
    pub dimensions_m: [f64; 3],
    /// Voxel counts along east, north, up (`[width, height, depth]`).
    pub grid: [usize; 3],
    pub voxel_size_m: [f64; 3],
    /// Multiple of the smallest voxel edge `step_m` was derived from.
    pub step_voxels: f64,
    pub step_m: f64,
}

impl RayMarchUniforms {
    /// `shape` is the decoded `[depth, height, width]`.
    pub fn derive(
        bbox: &GeoBoundingBox,
        shape: [usize; 3],
        step_voxels: f64,
    ) -> Result<Self, UniformError> {
        bbox.validate()?;
        if !step_voxels.is_finite() || step_voxels <= 0.0 {
            return Err(UniformError::InvalidStepVoxels(step_voxels));
        }
        let [depth, height, width] = shape;
        if depth == 0 || height == 0 || width == 0 {
            return Err(UniformError::EmptyGrid);
        }

        let (lon, lat) = (bbox.center_lon(), bbox.center_lat());
        let origin = Geodetic::from_degrees(lon, lat, bbox.center_height());

        let dimensions_m = [
            great_circle_distance_m(bbox.west, lat, bbox.east, lat),
            great_circle_distance_m(lon, bbox.south, lon, bbox.north),
            bbox.top - bbox.bottom,
        ];
        for (axis, d) in ["east", "north", "up"].into_iter().zip(dimensions_m) {
            if !(d.is_finite() && d > f64::EPSILON) {
                return Err(UniformError::DegenerateExtent { axis });
            }
        }

        let grid = [width, height, depth];
        let voxel_size_m = [
            dimensions_m[0] / width as f64,
            dimensions_m[1] / height as f64,
            dimensions_m[2] / depth as f64,
        ];
        let smallest = voxel_size_m.iter().copied().fold(f64::INFINITY, f64::min);
        let step_m = (smallest * step_voxels).clamp(MIN_STEP_M, MAX_STEP_M);

        Ok(Self {
            center: geodetic_to_ecef(origin),
            basis: EnuBasis::at(origin),
            dimensions_m,
            grid,
            voxel_size_m,
            step_voxels,
            step_m,
        })
    }

    pub fn diagonal_m(&self) -> f64 {
        let [x, y, z] = self.dimensions_m;
        (x * x + y * y + z * z).sqrt()
    }

    /// Step budget for one ray: the tier's budget, capped by what it takes to
    /// cross the whole box once.
    pub fn recommended_max_steps(&self, tier_steps: u32) -> u32 {
        let needed = (self.diagonal_m() / self.step_m).ceil();
        let needed = if needed.is_finite() {
            needed.min(u32::MAX as f64) as u32
        } else {
            u32::MAX
        };
        tier_steps.min(needed).max(1)
    }
}

/// `std140`-compatible uniform block for the ray-march pass.
///
/// Positions are relative to a camera origin so they survive narrowing to `f32`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct VolumeUniformBlock {
    pub center: [f32; 3],
    pub step_m: f32,
    pub east: [f32; 3],
    pub max_steps: u32,
    pub north: [f32; 3],
    pub value_min: f32,
    pub up: [f32; 3],
    pub value_max: f32,
    pub dimensions_m: [f32; 3],
    pub _pad0: f32,
    pub grid: [u32; 3],
    pub _pad1: u32,
    pub atlas_grid: [u32; 2],
    pub atlas_size: [u32; 2],
}

impl VolumeUniformBlock {
    pub fn new(
        uniforms: &RayMarchUniforms,
        atlas: &VolumeAtlas,
        camera: CameraRelative,
        max_steps: u32,
    ) -> Self {
        let dir = |v: Vec3| v.to_f32_array();
        let [dx, dy, dz] = uniforms.dimensions_m;
        let [gx, gy, gz] = uniforms.grid;
        Self {
            center: camera.to_f32(uniforms.center.as_vec3()),
            step_m: uniforms.step_m as f32,
            east: dir(uniforms.basis.east),
            max_steps,
            north: dir(uniforms.basis.north),
            value_min: atlas.min_value as f32,
            up: dir(uniforms.basis.up),
            value_max: atlas.max_value as f32,
            dimensions_m: [dx as f32, dy as f32, dz as f32],
            _pad0: 0.0,
            grid: [gx as u32, gy as u32, gz as u32],
            _pad1: 0,
            atlas_grid: [atlas.layout.grid_cols as u32, atlas.layout.grid_rows as u32],
            atlas_size: [atlas.width() as u32, atlas.height() as u32],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::build_atlas;
    use foundation::math::{MEAN_EARTH_RADIUS_M, WGS84_A};
    use formats::{DecodedVolume, VolumeData, VolumeHeader};

    fn assert_close(a: f64, b: f64, eps: f64) {
        let diff = (a - b).abs();
        assert!(diff <= eps, "expected {a} ~= {b} (diff {diff})");
    }

    fn equator_box() -> GeoBoundingBox {
        GeoBoundingBox::new(-0.5, -0.5, 0.5, 0.5, 0.0, 12_000.0).unwrap()
    }

    fn one_degree_m() -> f64 {
        MEAN_EARTH_RADIUS_M * 1f64.to_radians()
    }

    #[test]
    fn equator_box_dimensions_and_frame() {
        let u = RayMarchUniforms::derive(&equator_box(), [4, 10, 20], 0.5).unwrap();

        // 1 degree of arc at the equator, both ways.
        assert_close(u.dimensions_m[0], one_degree_m(), 1e-6);
        assert_close(u.dimensions_m[1], one_degree_m(), 1e-6);
        assert_eq!(u.dimensions_m[2], 12_000.0);
        assert_eq!(u.grid, [20, 10, 4]);

        // Center on the x axis, 6 km above the ellipsoid.
        assert_close(u.center.x, WGS84_A + 6_000.0, 1e-6);
        assert_close(u.center.y, 0.0, 1e-6);
        assert_close(u.center.z, 0.0, 1e-6);
        assert_close(u.basis.up.x, 1.0, 1e-12);
        assert_close(u.basis.east.y, 1.0, 1e-12);
        assert_close(u.basis.north.z, 1.0, 1e-12);

        // Shortest voxel is vertical (3000 m); half a voxel is 1500 m.
        assert_close(u.voxel_size_m[2], 3_000.0, 1e-9);
        assert_close(u.step_m, 1_500.0, 1e-9);
    }

    #[test]
    fn east_west_extent_shrinks_with_latitude() {
        let b = GeoBoundingBox::new(10.0, 59.5, 11.0, 60.5, 0.0, 12_000.0).unwrap();
        let u = RayMarchUniforms::derive(&b, [1, 1, 1], 1.0).unwrap();
        let ratio = u.dimensions_m[0] / u.dimensions_m[1];
        assert_close(ratio, 60f64.to_radians().cos(), 1e-3);
    }

    #[test]
    fn step_is_clamped() {
        let coarse = RayMarchUniforms::derive(&equator_box(), [1, 1, 1], 1.0).unwrap();
        assert_eq!(coarse.step_m, MAX_STEP_M);

        let fine = RayMarchUniforms::derive(&equator_box(), [4_000, 1, 1], 1.0).unwrap();
        assert_eq!(fine.step_m, MIN_STEP_M);
    }

    #[test]
    fn rejects_degenerate_input() {
        let flat = GeoBoundingBox {
            west: 1.0,
            south: 0.0,
            east: 1.0,
            north: 1.0,
            bottom: 0.0,
            top: 10.0,
        };
        assert!(matches!(
            RayMarchUniforms::derive(&flat, [1, 1, 1], 1.0),
            Err(UniformError::Bounds(_))
        ));
        assert_eq!(
            RayMarchUniforms::derive(&equator_box(), [0, 1, 1], 1.0),
            Err(UniformError::EmptyGrid)
        );
        assert!(matches!(
            RayMarchUniforms::derive(&equator_box(), [1, 1, 1], f64::NAN),
            Err(UniformError::InvalidStepVoxels(_))
        ));
    }

    #[test]
    fn max_steps_are_capped_by_the_box_diagonal() {
        let u = RayMarchUniforms::derive(&equator_box(), [4, 10, 20], 0.5).unwrap();
        // Diagonal ~158 km at 1500 m per step is ~106 steps.
        let needed = (u.diagonal_m() / u.step_m).ceil() as u32;
        assert_eq!(u.recommended_max_steps(256), needed);
        assert_eq!(u.recommended_max_steps(64), 64);
        assert_eq!(u.recommended_max_steps(0), 1);
    }

    #[test]
    fn uniform_block_is_camera_relative() {
        let mut header = VolumeHeader::new([2, 2, 2], formats::Dtype::Uint8);
        header.scale = 1.0 / 255.0;
        let volume = DecodedVolume {
            header,
            data: VolumeData::Uint8(vec![0, 64, 128, 192, 255, 32, 96, 160]),
        };
        let atlas = build_atlas(&volume).unwrap();
        let u = RayMarchUniforms::derive(&equator_box(), volume.shape(), 1.0).unwrap();

        let eye = u.center.as_vec3() + Vec3::new(-1_000.0, 0.0, 0.0);
        let block = VolumeUniformBlock::new(&u, &atlas, CameraRelative::new(eye), 128);

        assert_eq!(block.center, [1_000.0, 0.0, 0.0]);
        assert_eq!(block.atlas_grid, [2, 1]);
        assert_eq!(block.atlas_size, [4, 2]);
        assert_eq!(block.grid, [2, 2, 2]);
        assert_eq!(block.max_steps, 128);
        assert_eq!(block.as_bytes().len(), 112);
        assert_eq!(std::mem::size_of::<VolumeUniformBlock>() % 16, 0);
    }
}
