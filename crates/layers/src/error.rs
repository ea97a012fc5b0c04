use formats::VolumePackError;
use gpu::{AtlasError, UniformError};
use streaming::FetchError;

/// Why a volume load did not produce a renderable volume.
///
/// `Cancelled` is not a failure: callers drop it silently and must never enter
/// fallback because of it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    Cancelled,
    Fetch(FetchError),
    Decode(VolumePackError),
    Atlas(AtlasError),
    Uniforms(UniformError),
    /// Neither the pack header nor the caller supplied a bounding box.
    MissingBounds,
    /// Background task panicked or was torn down.
    Worker(String),
}

impl LoadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Cancelled => write!(f, "load cancelled"),
            LoadError::Fetch(e) => write!(f, "fetch failed: {e}"),
            LoadError::Decode(e) => write!(f, "decode failed at {}: {e}", e.stage().as_str()),
            LoadError::Atlas(e) => write!(f, "atlas build failed: {e}"),
            LoadError::Uniforms(e) => write!(f, "uniform derivation failed: {e}"),
            LoadError::MissingBounds => write!(f, "volume has no bounding box"),
            LoadError::Worker(reason) => write!(f, "background worker failed: {reason}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Fetch(e) => Some(e),
            LoadError::Decode(e) => Some(e),
            LoadError::Atlas(e) => Some(e),
            LoadError::Uniforms(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FetchError> for LoadError {
    fn from(e: FetchError) -> Self {
        LoadError::Fetch(e)
    }
}

impl From<VolumePackError> for LoadError {
    fn from(e: VolumePackError) -> Self {
        LoadError::Decode(e)
    }
}

impl From<AtlasError> for LoadError {
    fn from(e: AtlasError) -> Self {
        LoadError::Atlas(e)
    }
}

impl From<UniformError> for LoadError {
    fn from(e: UniformError) -> Self {
        LoadError::Uniforms(e)
    }
}
