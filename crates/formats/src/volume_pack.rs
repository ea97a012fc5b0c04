//! VolumePack: the binary transport format for gridded 3D scalar fields.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic        4 bytes  "VOLP"
//! header_len   u32
//! header       header_len bytes of UTF-8 JSON (object)
//! body         zstd-compressed element data, row-major [depth][height][width]
//! ```
//!
//! Decoding is strict: every check that fails reports the [`DecodeStage`] it
//! failed in, and sizes are bounded before any large allocation happens.

use std::io::Read;

use foundation::GeoBoundingBox;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAGIC: [u8; 4] = *b"VOLP";
pub const PACK_VERSION: u32 = 1;

/// Upper bound on the JSON header (1 MiB).
pub const MAX_HEADER_BYTES: u32 = 1 << 20;
/// Upper bound on the decompressed body (256 MiB).
pub const MAX_BODY_BYTES: u64 = 256 << 20;

const PREAMBLE_LEN: usize = 8;
const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Element type of the encoded grid.
///
/// Parsing is an exact match over a closed set; any other string is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Uint8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl Dtype {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(Self::Uint8),
            "int16" => Some(Self::Int16),
            "int32" => Some(Self::Int32),
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    pub fn bytes_per_element(self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step of decoding rejected the payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStage {
    Magic,
    HeaderLength,
    HeaderJson,
    Compression,
    Shape,
    Dtype,
    BodySize,
    Decompress,
    /// Not a decode stage: compressing a body while encoding.
    Compress,
}

impl DecodeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Magic => "magic",
            Self::HeaderLength => "header-length",
            Self::HeaderJson => "header-json",
            Self::Compression => "compression",
            Self::Shape => "shape",
            Self::Dtype => "dtype",
            Self::BodySize => "body-size",
            Self::Decompress => "decompress",
            Self::Compress => "compress",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VolumePackError {
    TooShort { len: usize },
    InvalidMagic { found: [u8; 4] },
    InvalidHeaderLength { len: u32, available: usize },
    HeaderTooLarge { len: u32, max: u32 },
    InvalidHeader { reason: String },
    UnsupportedCompression { found: String },
    InvalidShape { reason: String },
    UnsupportedDtype { found: String },
    BodyTooLarge { bytes: u64, max: u64 },
    Decompress { reason: String },
    Compress { reason: String },
    SizeMismatch { expected: u64, actual: u64 },
}

impl VolumePackError {
    pub fn stage(&self) -> DecodeStage {
        match self {
            Self::TooShort { .. } | Self::InvalidMagic { .. } => DecodeStage::Magic,
            Self::InvalidHeaderLength { .. } | Self::HeaderTooLarge { .. } => {
                DecodeStage::HeaderLength
            }
            Self::InvalidHeader { .. } => DecodeStage::HeaderJson,
            Self::UnsupportedCompression { .. } => DecodeStage::Compression,
            Self::InvalidShape { .. } => DecodeStage::Shape,
            Self::UnsupportedDtype { .. } => DecodeStage::Dtype,
            Self::BodyTooLarge { .. } | Self::SizeMismatch { .. } => DecodeStage::BodySize,
            Self::Decompress { .. } => DecodeStage::Decompress,
            Self::Compress { .. } => DecodeStage::Compress,
        }
    }
}

impl std::fmt::Display for VolumePackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = self.stage().as_str();
        match self {
            Self::TooShort { len } => write!(f, "[{stage}] payload too short: {len} bytes"),
            Self::InvalidMagic { found } => {
                write!(f, "[{stage}] invalid VolumePack magic: {found:?}")
            }
            Self::InvalidHeaderLength { len, available } => write!(
                f,
                "[{stage}] header length {len} invalid for {available} remaining bytes"
            ),
            Self::HeaderTooLarge { len, max } => {
                write!(f, "[{stage}] header length {len} exceeds maximum {max}")
            }
            Self::InvalidHeader { reason } => write!(f, "[{stage}] invalid header: {reason}"),
            Self::UnsupportedCompression { found } => {
                write!(f, "[{stage}] unsupported compression: {found:?}")
            }
            Self::InvalidShape { reason } => write!(f, "[{stage}] invalid shape: {reason}"),
            Self::UnsupportedDtype { found } => write!(f, "[{stage}] unsupported dtype: {found:?}"),
            Self::BodyTooLarge { bytes, max } => {
                write!(f, "[{stage}] body of {bytes} bytes exceeds maximum {max}")
            }
            Self::Decompress { reason } => write!(f, "[{stage}] zstd decode failed: {reason}"),
            Self::Compress { reason } => write!(f, "[{stage}] zstd encode failed: {reason}"),
            Self::SizeMismatch { expected, actual } => write!(
                f,
                "[{stage}] decoded body is {actual} bytes, shape implies {expected}"
            ),
        }
    }
}

impl std::error::Error for VolumePackError {}

/// Validated header of a VolumePack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeHeader {
    pub version: Option<u32>,
    pub bbox: Option<GeoBoundingBox>,
    /// `[depth, height, width]`
    pub shape: [usize; 3],
    pub dtype: Dtype,
    pub scale: f64,
    pub offset: f64,
    pub variable: Option<String>,
    pub valid_time: Option<String>,
}

impl VolumeHeader {
    pub fn new(shape: [usize; 3], dtype: Dtype) -> Self {
        Self {
            version: Some(PACK_VERSION),
            bbox: None,
            shape,
            dtype,
            scale: 1.0,
            offset: 0.0,
            variable: None,
            valid_time: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    /// Decompressed body size implied by `shape` and `dtype`, or `None` on overflow.
    pub fn expected_body_bytes(&self) -> Option<u64> {
        expected_body_bytes(self.shape, self.dtype)
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(version) = self.version {
            obj.insert("version".to_string(), Value::from(version));
        }
        if let Some(b) = &self.bbox {
            let mut bbox = Map::new();
            bbox.insert("west".to_string(), Value::from(b.west));
            bbox.insert("south".to_string(), Value::from(b.south));
            bbox.insert("east".to_string(), Value::from(b.east));
            bbox.insert("north".to_string(), Value::from(b.north));
            bbox.insert("bottom".to_string(), Value::from(b.bottom));
            bbox.insert("top".to_string(), Value::from(b.top));
            obj.insert("bbox".to_string(), Value::Object(bbox));
        }
        obj.insert(
            "shape".to_string(),
            Value::Array(self.shape.iter().map(|&d| Value::from(d as u64)).collect()),
        );
        obj.insert("dtype".to_string(), Value::from(self.dtype.as_str()));
        obj.insert("scale".to_string(), Value::from(self.scale));
        obj.insert("offset".to_string(), Value::from(self.offset));
        obj.insert("compression".to_string(), Value::from("zstd"));
        if let Some(v) = &self.variable {
            obj.insert("variable".to_string(), Value::from(v.as_str()));
        }
        if let Some(t) = &self.valid_time {
            obj.insert("valid_time".to_string(), Value::from(t.as_str()));
        }
        Value::Object(obj)
    }
}

/// Owned element buffer of a decoded pack, one variant per [`Dtype`].
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeData {
    Uint8(Vec<u8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl VolumeData {
    pub fn dtype(&self) -> Dtype {
        match self {
            Self::Uint8(_) => Dtype::Uint8,
            Self::Int16(_) => Dtype::Int16,
            Self::Int32(_) => Dtype::Int32,
            Self::Float32(_) => Dtype::Float32,
            Self::Float64(_) => Dtype::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Uint8(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw (pre-affine) value at a flat index, widened to `f64`.
    #[inline]
    pub fn raw(&self, index: usize) -> f64 {
        match self {
            Self::Uint8(v) => v[index] as f64,
            Self::Int16(v) => v[index] as f64,
            Self::Int32(v) => v[index] as f64,
            Self::Float32(v) => v[index] as f64,
            Self::Float64(v) => v[index],
        }
    }

    /// Materialize little-endian wire bytes as a typed buffer.
    ///
    /// `bytes.len()` must be a multiple of the element size.
    fn from_le_bytes(dtype: Dtype, bytes: &[u8]) -> Self {
        match dtype {
            Dtype::Uint8 => Self::Uint8(bytes.to_vec()),
            Dtype::Int16 => Self::Int16(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            Dtype::Int32 => Self::Int32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            Dtype::Float32 => Self::Float32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            Dtype::Float64 => Self::Float64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(c);
                        f64::from_le_bytes(b)
                    })
                    .collect(),
            ),
        }
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Uint8(v) => v.clone(),
            Self::Int16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Float32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Float64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

/// A fully decoded pack: validated header plus owned element data.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVolume {
    pub header: VolumeHeader,
    pub data: VolumeData,
}

impl DecodedVolume {
    pub fn shape(&self) -> [usize; 3] {
        self.header.shape
    }

    pub fn dtype(&self) -> Dtype {
        self.header.dtype
    }

    /// Affine-decoded value at a flat index: `raw * scale + offset`.
    #[inline]
    pub fn value(&self, index: usize) -> f64 {
        self.data.raw(index) * self.header.scale + self.header.offset
    }
}

fn expected_body_bytes(shape: [usize; 3], dtype: Dtype) -> Option<u64> {
    shape
        .iter()
        .try_fold(dtype.bytes_per_element() as u64, |acc, &d| {
            acc.checked_mul(d as u64)
        })
}

pub fn decode_volume_pack(bytes: &[u8]) -> Result<DecodedVolume, VolumePackError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(VolumePackError::TooShort { len: bytes.len() });
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != MAGIC {
        return Err(VolumePackError::InvalidMagic { found: magic });
    }

    let header_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if header_len > MAX_HEADER_BYTES {
        return Err(VolumePackError::HeaderTooLarge {
            len: header_len,
            max: MAX_HEADER_BYTES,
        });
    }
    let available = bytes.len() - PREAMBLE_LEN;
    if header_len == 0 || header_len as usize > available {
        return Err(VolumePackError::InvalidHeaderLength {
            len: header_len,
            available,
        });
    }
    let header_end = PREAMBLE_LEN + header_len as usize;

    let header = parse_header(&bytes[PREAMBLE_LEN..header_end])?;

    let expected = header
        .expected_body_bytes()
        .filter(|&n| n <= MAX_BODY_BYTES)
        .ok_or(VolumePackError::BodyTooLarge {
            bytes: header.expected_body_bytes().unwrap_or(u64::MAX),
            max: MAX_BODY_BYTES,
        })?;

    let body = decompress_bounded(&bytes[header_end..], expected)?;
    if body.len() as u64 != expected {
        return Err(VolumePackError::SizeMismatch {
            expected,
            actual: body.len() as u64,
        });
    }

    let data = VolumeData::from_le_bytes(header.dtype, &body);
    Ok(DecodedVolume { header, data })
}

/// Decompress at most `expected + 1` bytes so an oversized body is detected
/// without inflating it fully.
fn decompress_bounded(compressed: &[u8], expected: u64) -> Result<Vec<u8>, VolumePackError> {
    let decoder = zstd::stream::read::Decoder::new(compressed).map_err(|e| {
        VolumePackError::Decompress {
            reason: e.to_string(),
        }
    })?;
    let mut out = Vec::with_capacity(expected as usize);
    decoder
        .take(expected + 1)
        .read_to_end(&mut out)
        .map_err(|e| VolumePackError::Decompress {
            reason: e.to_string(),
        })?;
    Ok(out)
}

fn parse_header(raw: &[u8]) -> Result<VolumeHeader, VolumePackError> {
    let text = std::str::from_utf8(raw).map_err(|e| VolumePackError::InvalidHeader {
        reason: format!("not UTF-8: {e}"),
    })?;
    let value: Value = serde_json::from_str(text).map_err(|e| VolumePackError::InvalidHeader {
        reason: format!("JSON parse error: {e}"),
    })?;
    let obj = value.as_object().ok_or(VolumePackError::InvalidHeader {
        reason: "header must be a JSON object".to_string(),
    })?;

    match obj.get("compression") {
        Some(Value::String(s)) if s == "zstd" => {}
        Some(other) => {
            return Err(VolumePackError::UnsupportedCompression {
                found: other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string()),
            });
        }
        None => {
            return Err(VolumePackError::UnsupportedCompression {
                found: "<missing>".to_string(),
            });
        }
    }

    let shape = parse_shape(obj.get("shape"))?;

    let dtype_name = obj.get("dtype").and_then(Value::as_str).ok_or_else(|| {
        VolumePackError::UnsupportedDtype {
            found: obj
                .get("dtype")
                .map(Value::to_string)
                .unwrap_or_else(|| "<missing>".to_string()),
        }
    })?;
    let dtype = Dtype::parse(dtype_name).ok_or_else(|| VolumePackError::UnsupportedDtype {
        found: dtype_name.to_string(),
    })?;

    let scale = optional_number(obj, "scale")?.unwrap_or(1.0);
    let offset = optional_number(obj, "offset")?.unwrap_or(0.0);

    let version = match obj.get("version") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| VolumePackError::InvalidHeader {
                    reason: format!("version must be a non-negative integer, got {v}"),
                })?,
        ),
    };

    let bbox = match obj.get("bbox") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_bbox(v)?),
    };

    Ok(VolumeHeader {
        version,
        bbox,
        shape,
        dtype,
        scale,
        offset,
        variable: optional_string(obj, "variable")?,
        valid_time: optional_string(obj, "valid_time")?,
    })
}

fn parse_shape(value: Option<&Value>) -> Result<[usize; 3], VolumePackError> {
    let items = value
        .and_then(Value::as_array)
        .ok_or(VolumePackError::InvalidShape {
            reason: "shape must be an array".to_string(),
        })?;
    if items.len() != 3 {
        return Err(VolumePackError::InvalidShape {
            reason: format!("expected 3 dimensions, got {}", items.len()),
        });
    }
    let mut shape = [0usize; 3];
    for (i, item) in items.iter().enumerate() {
        let dim = item
            .as_u64()
            .filter(|&d| d > 0)
            .and_then(|d| usize::try_from(d).ok())
            .ok_or_else(|| VolumePackError::InvalidShape {
                reason: format!("dimension {i} must be a positive integer, got {item}"),
            })?;
        shape[i] = dim;
    }
    Ok(shape)
}

fn parse_bbox(value: &Value) -> Result<GeoBoundingBox, VolumePackError> {
    let obj = value.as_object().ok_or(VolumePackError::InvalidHeader {
        reason: "bbox must be an object".to_string(),
    })?;
    let field = |name: &str| -> Result<f64, VolumePackError> {
        obj.get(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| VolumePackError::InvalidHeader {
                reason: format!("bbox.{name} must be a number"),
            })
    };
    GeoBoundingBox::new(
        field("west")?,
        field("south")?,
        field("east")?,
        field("north")?,
        field("bottom")?,
        field("top")?,
    )
    .map_err(|e| VolumePackError::InvalidHeader {
        reason: e.to_string(),
    })
}

fn optional_number(obj: &Map<String, Value>, key: &str) -> Result<Option<f64>, VolumePackError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| VolumePackError::InvalidHeader {
                reason: format!("{key} must be a finite number, got {v}"),
            }),
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    key: &str,
) -> Result<Option<String>, VolumePackError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v) => Err(VolumePackError::InvalidHeader {
            reason: format!("{key} must be a string, got {v}"),
        }),
    }
}

/// Encode a volume as a VolumePack.
///
/// `data` must match `header.dtype` and hold exactly `depth * height * width`
/// elements.
pub fn encode_volume_pack(
    header: &VolumeHeader,
    data: &VolumeData,
) -> Result<Vec<u8>, VolumePackError> {
    if data.dtype() != header.dtype {
        return Err(VolumePackError::UnsupportedDtype {
            found: data.dtype().as_str().to_string(),
        });
    }
    let expected = header.expected_body_bytes().ok_or(VolumePackError::BodyTooLarge {
        bytes: u64::MAX,
        max: MAX_BODY_BYTES,
    })?;
    let body = data.to_le_bytes();
    if body.len() as u64 != expected {
        return Err(VolumePackError::SizeMismatch {
            expected,
            actual: body.len() as u64,
        });
    }
    encode_raw_body(&header.to_json(), &body)
}

/// Frame an arbitrary JSON header and uncompressed body.
///
/// No consistency checks are made between the two; this is the primitive the
/// typed encoder builds on.
pub fn encode_raw_body(header: &Value, body: &[u8]) -> Result<Vec<u8>, VolumePackError> {
    let header_bytes = serde_json::to_vec(header).map_err(|e| VolumePackError::InvalidHeader {
        reason: e.to_string(),
    })?;
    let header_len = u32::try_from(header_bytes.len())
        .ok()
        .filter(|&n| n <= MAX_HEADER_BYTES)
        .ok_or(VolumePackError::HeaderTooLarge {
            len: u32::MAX,
            max: MAX_HEADER_BYTES,
        })?;
    let compressed =
        zstd::bulk::compress(body, DEFAULT_ZSTD_LEVEL).map_err(|e| VolumePackError::Compress {
            reason: e.to_string(),
        })?;

    let mut out = Vec::with_capacity(PREAMBLE_LEN + header_bytes.len() + compressed.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&compressed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn header_json(dtype: &str, shape: Value) -> Value {
        json!({
            "version": 1,
            "shape": shape,
            "dtype": dtype,
            "scale": 1.0,
            "offset": 0.0,
            "compression": "zstd",
        })
    }

    fn stage_of(bytes: &[u8]) -> DecodeStage {
        decode_volume_pack(bytes).expect_err("expected decode failure").stage()
    }

    #[test]
    fn uint8_scenario_decodes_with_affine_scale() {
        let mut header = VolumeHeader::new([2, 2, 2], Dtype::Uint8);
        header.scale = 1.0 / 255.0;
        header.variable = Some("cloud_density".to_string());
        let raw = vec![0u8, 64, 128, 192, 255, 32, 96, 160];
        let bytes = encode_volume_pack(&header, &VolumeData::Uint8(raw.clone())).unwrap();

        let decoded = decode_volume_pack(&bytes).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.data, VolumeData::Uint8(raw));
        assert!((decoded.value(4) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn multi_byte_dtypes_round_trip_through_little_endian() {
        let mut header = VolumeHeader::new([1, 2, 3], Dtype::Int16);
        header.scale = 0.5;
        header.offset = -10.0;
        let values = VolumeData::Int16(vec![-32768, -1, 0, 1, 255, 32767]);
        let decoded = decode_volume_pack(&encode_volume_pack(&header, &values).unwrap()).unwrap();
        assert_eq!(decoded.data, values);
        assert_eq!(decoded.value(5), 32767.0 * 0.5 - 10.0);

        let header = VolumeHeader::new([1, 1, 3], Dtype::Float32);
        let values = VolumeData::Float32(vec![0.25, -1.5, 1.0e-3]);
        let decoded = decode_volume_pack(&encode_volume_pack(&header, &values).unwrap()).unwrap();
        assert_eq!(decoded.data, values);

        let header = VolumeHeader::new([1, 1, 2], Dtype::Float64);
        let values = VolumeData::Float64(vec![std::f64::consts::PI, -0.0]);
        let decoded = decode_volume_pack(&encode_volume_pack(&header, &values).unwrap()).unwrap();
        assert_eq!(decoded.data, values);

        let header = VolumeHeader::new([2, 1, 1], Dtype::Int32);
        let values = VolumeData::Int32(vec![i32::MIN, i32::MAX]);
        let decoded = decode_volume_pack(&encode_volume_pack(&header, &values).unwrap()).unwrap();
        assert_eq!(decoded.data, values);
    }

    #[test]
    fn header_bbox_and_metadata_are_preserved() {
        let mut header = VolumeHeader::new([1, 1, 1], Dtype::Uint8);
        header.bbox = Some(GeoBoundingBox::new(5.0, 45.0, 6.0, 46.0, 0.0, 12_000.0).unwrap());
        header.valid_time = Some("2024-05-01T12:00Z".to_string());
        let bytes = encode_volume_pack(&header, &VolumeData::Uint8(vec![7])).unwrap();
        let decoded = decode_volume_pack(&bytes).unwrap();
        assert_eq!(decoded.header.bbox, header.bbox);
        assert_eq!(decoded.header.valid_time.as_deref(), Some("2024-05-01T12:00Z"));
    }

    #[test]
    fn rejects_short_payload_and_bad_magic() {
        assert_eq!(stage_of(b"VOLP"), DecodeStage::Magic);
        let mut bytes = encode_raw_body(&header_json("uint8", json!([1, 1, 1])), &[0]).unwrap();
        bytes[0] = b'X';
        assert_eq!(stage_of(&bytes), DecodeStage::Magic);
    }

    #[test]
    fn rejects_zero_oversized_and_truncated_header_length() {
        let mut zero = MAGIC.to_vec();
        zero.extend_from_slice(&0u32.to_le_bytes());
        zero.extend_from_slice(b"{}");
        assert_eq!(stage_of(&zero), DecodeStage::HeaderLength);

        let mut huge = MAGIC.to_vec();
        huge.extend_from_slice(&(MAX_HEADER_BYTES + 1).to_le_bytes());
        assert!(matches!(
            decode_volume_pack(&huge),
            Err(VolumePackError::HeaderTooLarge { .. })
        ));

        let mut truncated = MAGIC.to_vec();
        truncated.extend_from_slice(&64u32.to_le_bytes());
        truncated.extend_from_slice(b"{\"dtype\":");
        assert_eq!(stage_of(&truncated), DecodeStage::HeaderLength);
    }

    #[test]
    fn rejects_non_object_and_malformed_json() {
        let bytes = encode_raw_body(&json!([1, 2, 3]), &[0]).unwrap();
        assert_eq!(stage_of(&bytes), DecodeStage::HeaderJson);

        let mut bad = MAGIC.to_vec();
        bad.extend_from_slice(&5u32.to_le_bytes());
        bad.extend_from_slice(b"{nope");
        assert_eq!(stage_of(&bad), DecodeStage::HeaderJson);
    }

    #[test]
    fn rejects_unsupported_compression() {
        let mut header = header_json("uint8", json!([1, 1, 1]));
        header["compression"] = json!("gzip");
        let bytes = encode_raw_body(&header, &[0]).unwrap();
        assert_eq!(
            decode_volume_pack(&bytes),
            Err(VolumePackError::UnsupportedCompression {
                found: "gzip".to_string()
            })
        );
    }

    #[test]
    fn rejects_malformed_shapes() {
        for shape in [
            json!([2, 2]),
            json!([2, 2, 2, 2]),
            json!([0, 2, 2]),
            json!([2, -1, 2]),
            json!([2, 1.5, 2]),
            json!("2x2x2"),
        ] {
            let bytes = encode_raw_body(&header_json("uint8", shape.clone()), &[0]).unwrap();
            assert_eq!(stage_of(&bytes), DecodeStage::Shape, "shape {shape}");
        }
    }

    #[test]
    fn rejects_dtype_names_outside_the_allow_list() {
        for name in ["toString", "constructor", "__proto__", "UINT8", "uint16", ""] {
            let bytes = encode_raw_body(&header_json(name, json!([1, 1, 1])), &[0]).unwrap();
            assert_eq!(
                decode_volume_pack(&bytes),
                Err(VolumePackError::UnsupportedDtype {
                    found: name.to_string()
                })
            );
        }
    }

    #[test]
    fn rejects_bodies_whose_shape_exceeds_the_size_cap() {
        let shape = json!([4096, 4096, 4096]);
        let bytes = encode_raw_body(&header_json("float64", shape), &[0]).unwrap();
        assert!(matches!(
            decode_volume_pack(&bytes),
            Err(VolumePackError::BodyTooLarge { .. })
        ));

        // Product overflows u64 outright.
        let shape = json!([u64::MAX, u64::MAX, 2]);
        let bytes = encode_raw_body(&header_json("uint8", shape), &[0]).unwrap();
        assert_eq!(stage_of(&bytes), DecodeStage::BodySize);
    }

    #[test]
    fn body_off_by_one_byte_is_a_size_mismatch() {
        let header = header_json("uint8", json!([2, 2, 2]));

        let short = encode_raw_body(&header, &[0u8; 7]).unwrap();
        assert_eq!(
            decode_volume_pack(&short),
            Err(VolumePackError::SizeMismatch {
                expected: 8,
                actual: 7
            })
        );

        let long = encode_raw_body(&header, &[0u8; 9]).unwrap();
        assert_eq!(
            decode_volume_pack(&long),
            Err(VolumePackError::SizeMismatch {
                expected: 8,
                actual: 9
            })
        );
    }

    #[test]
    fn non_zstd_body_is_a_decompress_error() {
        let header = serde_json::to_vec(&header_json("uint8", json!([1, 1, 4]))).unwrap();
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(b"definitely not a zstd frame");
        let err = decode_volume_pack(&bytes).expect_err("garbage body");
        assert_eq!(err.stage(), DecodeStage::Decompress);
    }

    #[test]
    fn compression_failures_are_tagged_as_encoding() {
        let err = VolumePackError::Compress {
            reason: "level out of range".to_string(),
        };
        assert_eq!(err.stage(), DecodeStage::Compress);
        assert_eq!(err.to_string(), "[compress] zstd encode failed: level out of range");
    }

    #[test]
    fn dtype_parse_is_exact() {
        assert_eq!(Dtype::parse("float32"), Some(Dtype::Float32));
        assert_eq!(Dtype::parse("Float32"), None);
        assert_eq!(Dtype::Float64.bytes_per_element(), 8);
    }
}
