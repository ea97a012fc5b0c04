//! Client side of the volume backend endpoint.
//!
//! The endpoint takes `bbox=w,s,e,n,bottom,top`, `levels=a,b,..`, `res=<m>` and
//! an optional opaque `valid_time`, and answers with a VolumePack body.

use std::time::Duration;

use bytes::Bytes;
use foundation::GeoBoundingBox;
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::cache::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No positive level survived normalization; nothing is sent.
    InvalidLevels,
    InvalidResolution,
    Status(u16),
    Transport(String),
    Timeout,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::InvalidLevels => write!(f, "no valid levels to request"),
            FetchError::InvalidResolution => write!(f, "resolution must be a positive number"),
            FetchError::Status(code) => write!(f, "backend responded with HTTP {code}"),
            FetchError::Transport(reason) => write!(f, "transport error: {reason}"),
            FetchError::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Round, drop non-positive/non-finite values, sort and de-duplicate.
pub fn normalize_levels(levels: &[f64]) -> Result<Vec<u32>, FetchError> {
    let mut out: Vec<u32> = levels
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.round())
        .filter(|v| *v >= 1.0 && *v <= u32::MAX as f64)
        .map(|v| v as u32)
        .collect();
    out.sort_unstable();
    out.dedup();
    if out.is_empty() {
        return Err(FetchError::InvalidLevels);
    }
    Ok(out)
}

/// A validated request for one volume window.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeQuery {
    pub bbox: GeoBoundingBox,
    pub levels: Vec<u32>,
    pub resolution_m: f64,
    pub valid_time: Option<String>,
}

impl VolumeQuery {
    pub fn new(
        bbox: GeoBoundingBox,
        levels: &[f64],
        resolution_m: f64,
        valid_time: Option<&str>,
    ) -> Result<Self, FetchError> {
        if !resolution_m.is_finite() || resolution_m <= 0.0 {
            return Err(FetchError::InvalidResolution);
        }
        Ok(Self {
            bbox,
            levels: normalize_levels(levels)?,
            resolution_m,
            valid_time: valid_time
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::for_window(
            &self.bbox,
            &self.levels,
            self.resolution_m,
            self.valid_time.as_deref(),
        )
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let bbox = self
            .bbox
            .as_array()
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let levels = self
            .levels
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut pairs = vec![
            ("bbox", bbox),
            ("levels", levels),
            ("res", self.resolution_m.to_string()),
        ];
        if let Some(t) = &self.valid_time {
            pairs.push(("valid_time", t.clone()));
        }
        pairs
    }
}

/// Source of VolumePack payloads.
///
/// Returned futures must be `'static` so they can run on a background task;
/// cancellation is applied by the caller dropping the future.
pub trait VolumeBackend: Send + Sync {
    fn fetch(&self, query: &VolumeQuery) -> BoxFuture<'static, Result<Bytes, FetchError>>;
}

/// `VolumeBackend` over HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, timeout)
    }

    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

impl VolumeBackend for HttpBackend {
    fn fetch(&self, query: &VolumeQuery) -> BoxFuture<'static, Result<Bytes, FetchError>> {
        let request = self
            .client
            .get(&self.endpoint)
            .query(&query.query_pairs())
            .timeout(self.timeout);
        let endpoint = self.endpoint.clone();

        Box::pin(async move {
            let resp = request.send().await.map_err(map_reqwest_error)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            let body = resp.bytes().await.map_err(map_reqwest_error)?;
            debug!(%endpoint, bytes = body.len(), "volume pack received");
            Ok(body)
        })
    }
}
