//! Load stages shared by the renderer and the streaming coordinator.
//!
//! Fetching awaits the backend under a deadline; decode and atlas packing run
//! on tokio's blocking pool. Every stage observes a [`CancelToken`], both while
//! awaiting and between blocking steps.

use std::time::{Duration, Instant};

use bytes::Bytes;
use foundation::GeoBoundingBox;
use formats::decode_volume_pack;
use futures_util::future::BoxFuture;
use gpu::{RayMarchUniforms, build_atlas};
use streaming::{CancelToken, FetchError};

use crate::error::LoadError;
use crate::renderer::{LoadMetrics, PreparedVolume, VolumeMetadata};

pub(crate) fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1_000.0
}

fn check(cancel: &CancelToken) -> Result<(), LoadError> {
    if cancel.is_cancelled() {
        Err(LoadError::Cancelled)
    } else {
        Ok(())
    }
}

/// Decode a pack and build everything the renderer needs from it.
///
/// The header's bbox takes precedence over `bbox_hint`; the hint covers packs
/// from backends that omit it.
pub fn prepare_volume(
    bytes: &[u8],
    bbox_hint: Option<GeoBoundingBox>,
    step_voxels: f64,
    cancel: &CancelToken,
) -> Result<PreparedVolume, LoadError> {
    check(cancel)?;
    let started = Instant::now();
    let decoded = decode_volume_pack(bytes)?;
    let decode_ms = elapsed_ms(started);
    check(cancel)?;

    let bbox = decoded
        .header
        .bbox
        .or(bbox_hint)
        .ok_or(LoadError::MissingBounds)?;

    let started = Instant::now();
    let atlas = build_atlas(&decoded)?;
    let uniforms = RayMarchUniforms::derive(&bbox, decoded.shape(), step_voxels)?;
    let atlas_ms = elapsed_ms(started);
    check(cancel)?;

    let header = decoded.header;
    let metadata = VolumeMetadata {
        shape: header.shape,
        dtype: header.dtype,
        variable: header.variable,
        valid_time: header.valid_time,
        bbox,
        min_value: atlas.min_value,
        max_value: atlas.max_value,
        atlas_width: atlas.width(),
        atlas_height: atlas.height(),
    };

    Ok(PreparedVolume {
        atlas,
        uniforms,
        metadata,
        metrics: LoadMetrics {
            bytes: bytes.len(),
            fetch_ms: None,
            decode_ms,
            atlas_ms,
        },
    })
}

/// [`prepare_volume`] on the blocking pool, abandoned as soon as `cancel` fires.
pub async fn prepare_in_background(
    bytes: Bytes,
    bbox_hint: Option<GeoBoundingBox>,
    step_voxels: f64,
    cancel: &CancelToken,
) -> Result<PreparedVolume, LoadError> {
    check(cancel)?;
    let worker_cancel = cancel.clone();
    let task = tokio::task::spawn_blocking(move || {
        prepare_volume(&bytes, bbox_hint, step_voxels, &worker_cancel)
    });

    match cancel.run_until_cancelled(task).await {
        None => Err(LoadError::Cancelled),
        Some(Err(join)) => Err(LoadError::Worker(join.to_string())),
        Some(Ok(result)) => result,
    }
}

/// Await a backend request under a deadline. Returns the body and the time
/// spent fetching (ms).
///
/// The request future comes from [`streaming::VolumeBackend::fetch`], called by
/// the owner so the request is issued in call order.
pub async fn fetch_volume(
    request: BoxFuture<'static, Result<Bytes, FetchError>>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(Bytes, f64), LoadError> {
    check(cancel)?;
    let started = Instant::now();
    let request = tokio::time::timeout(timeout, request);

    match cancel.run_until_cancelled(request).await {
        None => Err(LoadError::Cancelled),
        Some(Err(_elapsed)) => Err(LoadError::Fetch(FetchError::Timeout)),
        Some(Ok(Err(e))) => Err(LoadError::Fetch(e)),
        Some(Ok(Ok(body))) => Ok((body, elapsed_ms(started))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, equator_box, sample_pack};
    use formats::{DecodeStage, Dtype};
    use std::sync::Arc;
    use streaming::{VolumeBackend, VolumeQuery};

    #[test]
    fn header_bbox_wins_over_hint() {
        let hint = GeoBoundingBox::new(20.0, 20.0, 21.0, 21.0, 0.0, 5_000.0).unwrap();
        let prepared =
            prepare_volume(&sample_pack(Some(equator_box())), Some(hint), 1.0, &CancelToken::new())
                .unwrap();
        assert_eq!(prepared.metadata.bbox, equator_box());
        assert_eq!(prepared.metadata.dtype, Dtype::Uint8);
        assert_eq!((prepared.metadata.atlas_width, prepared.metadata.atlas_height), (4, 2));

        let from_hint =
            prepare_volume(&sample_pack(None), Some(hint), 1.0, &CancelToken::new()).unwrap();
        assert_eq!(from_hint.metadata.bbox, hint);
    }

    #[test]
    fn missing_bounds_and_bad_bytes_are_failures() {
        let token = CancelToken::new();
        assert_eq!(
            prepare_volume(&sample_pack(None), None, 1.0, &token).unwrap_err(),
            LoadError::MissingBounds
        );
        match prepare_volume(b"nope", None, 1.0, &token) {
            Err(LoadError::Decode(e)) => assert_eq!(e.stage(), DecodeStage::Magic),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let token = CancelToken::new();
        token.cancel();
        let err = prepare_volume(&sample_pack(Some(equator_box())), None, 1.0, &token).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn background_prepare_matches_inline() {
        let pack = Bytes::from(sample_pack(Some(equator_box())));
        let token = CancelToken::new();
        let inline = prepare_volume(&pack, None, 1.0, &token).unwrap();
        let background = prepare_in_background(pack, None, 1.0, &token).await.unwrap();
        assert_eq!(background.atlas, inline.atlas);
        assert_eq!(background.uniforms, inline.uniforms);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out() {
        let backend = Arc::new(MockBackend::new());
        backend.hold_responses();
        let query = VolumeQuery::new(equator_box(), &[500.0], 3_000.0, None).unwrap();

        let err = fetch_volume(
            backend.fetch(&query),
            Duration::from_millis(50),
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, LoadError::Fetch(FetchError::Timeout));
    }

    #[tokio::test]
    async fn fetch_is_abandoned_on_cancel() {
        let backend = Arc::new(MockBackend::new());
        backend.hold_responses();
        let query = VolumeQuery::new(equator_box(), &[500.0], 3_000.0, None).unwrap();
        let token = CancelToken::new();

        let canceller = token.clone();
        tokio::spawn(async move { canceller.cancel() });
        let err = fetch_volume(backend.fetch(&query), Duration::from_secs(30), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
