use formats::DecodedVolume;

/// Largest atlas we are willing to allocate (8192 x 8192 texels).
pub const MAX_ATLAS_PIXELS: u64 = 8192 * 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtlasError {
    EmptyVolume,
    TooLarge { pixels: u64, max: u64 },
    DataLength { expected: usize, actual: usize },
}

impl std::fmt::Display for AtlasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AtlasError::EmptyVolume => write!(f, "volume has no voxels"),
            AtlasError::TooLarge { pixels, max } => {
                write!(f, "atlas of {pixels} texels exceeds maximum {max}")
            }
            AtlasError::DataLength { expected, actual } => write!(
                f,
                "volume data has {actual} elements, shape implies {expected}"
            ),
        }
    }
}

impl std::error::Error for AtlasError {}

/// Grid placement of depth slices inside a 2D atlas.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AtlasLayout {
    pub slice_width: usize,
    pub slice_height: usize,
    pub depth: usize,
    pub grid_cols: usize,
    pub grid_rows: usize,
}

impl AtlasLayout {
    /// `ceil(sqrt(depth))` columns, as many rows as needed.
    pub fn for_shape(shape: [usize; 3]) -> Result<Self, AtlasError> {
        let [depth, height, width] = shape;
        if depth == 0 || height == 0 || width == 0 {
            return Err(AtlasError::EmptyVolume);
        }
        let grid_cols = ceil_sqrt(depth);
        let grid_rows = depth.div_ceil(grid_cols);

        let layout = Self {
            slice_width: width,
            slice_height: height,
            depth,
            grid_cols,
            grid_rows,
        };
        let pixels = (layout.atlas_width() as u64)
            .checked_mul(layout.atlas_height() as u64)
            .unwrap_or(u64::MAX);
        if pixels > MAX_ATLAS_PIXELS {
            return Err(AtlasError::TooLarge {
                pixels,
                max: MAX_ATLAS_PIXELS,
            });
        }
        Ok(layout)
    }

    pub fn atlas_width(&self) -> usize {
        self.grid_cols.saturating_mul(self.slice_width)
    }

    pub fn atlas_height(&self) -> usize {
        self.grid_rows.saturating_mul(self.slice_height)
    }

    /// Top-left texel of slice `z`.
    pub fn tile_origin(&self, z: usize) -> (usize, usize) {
        (
            (z % self.grid_cols) * self.slice_width,
            (z / self.grid_cols) * self.slice_height,
        )
    }
}

fn ceil_sqrt(n: usize) -> usize {
    let mut r = (n as f64).sqrt() as usize;
    while r * r < n {
        r += 1;
    }
    while r > 1 && (r - 1) * (r - 1) >= n {
        r -= 1;
    }
    r.max(1)
}

/// Render-ready 8-bit atlas of a volume's depth slices.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAtlas {
    pub layout: AtlasLayout,
    /// Row-major, `atlas_width * atlas_height` texels.
    pub texels: Vec<u8>,
    /// Range of the affine-decoded values before clamping.
    pub min_value: f64,
    pub max_value: f64,
}

impl VolumeAtlas {
    pub fn width(&self) -> usize {
        self.layout.atlas_width()
    }

    pub fn height(&self) -> usize {
        self.layout.atlas_height()
    }

    pub fn texel(&self, x: usize, y: usize) -> u8 {
        self.texels[y * self.width() + x]
    }
}

#[inline]
fn quantize_unit(v: f64) -> u8 {
    // NaN clamps to 0.
    let c = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
    (c * 255.0).round() as u8
}

/// Pack a decoded `(depth, height, width)` volume into a grid-of-slices atlas.
///
/// Each voxel becomes `round(clamp01(raw * scale + offset) * 255)`. Unused
/// tiles in the last row stay zero.
pub fn build_atlas(volume: &DecodedVolume) -> Result<VolumeAtlas, AtlasError> {
    let layout = AtlasLayout::for_shape(volume.shape())?;
    let (w, h, d) = (layout.slice_width, layout.slice_height, layout.depth);

    let expected = d * h * w;
    if volume.data.len() != expected {
        return Err(AtlasError::DataLength {
            expected,
            actual: volume.data.len(),
        });
    }

    let atlas_width = layout.atlas_width();
    let mut texels = vec![0u8; atlas_width * layout.atlas_height()];
    let mut min_value = f64::INFINITY;
    let mut max_value = f64::NEG_INFINITY;

    for z in 0..d {
        let (ox, oy) = layout.tile_origin(z);
        for y in 0..h {
            let src_row = (z * h + y) * w;
            let dst_row = (oy + y) * atlas_width + ox;
            for x in 0..w {
                let v = volume.value(src_row + x);
                if v.is_finite() {
                    min_value = min_value.min(v);
                    max_value = max_value.max(v);
                }
                texels[dst_row + x] = quantize_unit(v);
            }
        }
    }

    if min_value > max_value {
        min_value = 0.0;
        max_value = 0.0;
    }

    Ok(VolumeAtlas {
        layout,
        texels,
        min_value,
        max_value,
    })
}
