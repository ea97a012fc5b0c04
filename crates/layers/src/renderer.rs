use std::time::Duration;

use bytes::Bytes;
use foundation::GeoBoundingBox;
use foundation::math::CameraRelative;
use formats::Dtype;
use gpu::{RayMarchUniforms, UniformError, VolumeAtlas, VolumeUniformBlock};
use runtime::QualityTier;
use serde::{Deserialize, Serialize};
use streaming::{CancelToken, VolumeBackend, VolumeQuery};
use tracing::{debug, warn};

use crate::error::LoadError;
use crate::load::{fetch_volume, prepare_in_background};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererSettings {
    /// Ray-march step as a multiple of the smallest voxel edge.
    pub step_voxels: f64,
    /// Step budget per ray, normally the active quality tier's.
    pub ray_march_steps: u32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            step_voxels: 1.0,
            ray_march_steps: QualityTier::Medium.preset().ray_march_steps,
        }
    }
}

/// Partial update for [`RendererSettings`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub step_voxels: Option<f64>,
    #[serde(default)]
    pub ray_march_steps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeMetadata {
    /// `[depth, height, width]`
    pub shape: [usize; 3],
    pub dtype: Dtype,
    pub variable: Option<String>,
    pub valid_time: Option<String>,
    pub bbox: GeoBoundingBox,
    pub min_value: f64,
    pub max_value: f64,
    pub atlas_width: usize,
    pub atlas_height: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct RecommendedParams {
    pub step_m: f64,
    pub max_steps: u32,
}

/// Timings of the most recent successful load.
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize)]
pub struct LoadMetrics {
    pub bytes: usize,
    /// `None` when the payload came from a buffer or the cache.
    pub fetch_ms: Option<f64>,
    pub decode_ms: f64,
    pub atlas_ms: f64,
}

/// A decoded volume ready to hand to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedVolume {
    pub atlas: VolumeAtlas,
    pub uniforms: RayMarchUniforms,
    pub metadata: VolumeMetadata,
    pub metrics: LoadMetrics,
}

/// Read-only view for diagnostics panels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RendererSnapshot {
    pub ready: bool,
    pub enabled: bool,
    pub settings: RendererSettings,
    pub volume_metadata: Option<VolumeMetadata>,
    pub recommended_params: Option<RecommendedParams>,
    pub last_load_metrics: Option<LoadMetrics>,
    pub last_error: Option<String>,
}

/// Renderer-side state of the volume: the current atlas and uniforms, the
/// enabled flag and the settings the host controls.
///
/// GPU upload is the host's business; it reads [`VolumeRenderer::atlas`] and
/// [`VolumeRenderer::uniform_block`] whenever a redraw is requested.
#[derive(Debug, Default)]
pub struct VolumeRenderer {
    enabled: bool,
    settings: RendererSettings,
    volume: Option<PreparedVolume>,
    last_load_metrics: Option<LoadMetrics>,
    last_error: Option<String>,
}

impl VolumeRenderer {
    pub fn new(settings: RendererSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// A volume has been applied.
    pub fn is_ready(&self) -> bool {
        self.volume.is_some()
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Returns whether the flag changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let changed = self.enabled != enabled;
        self.enabled = enabled;
        changed
    }

    /// Apply a partial settings update, re-deriving uniforms for the loaded
    /// volume. On error nothing changes.
    pub fn update_settings(&mut self, patch: &SettingsPatch) -> Result<bool, UniformError> {
        let mut next = self.settings.clone();
        if let Some(step) = patch.step_voxels {
            if !step.is_finite() || step <= 0.0 {
                return Err(UniformError::InvalidStepVoxels(step));
            }
            next.step_voxels = step;
        }
        if let Some(steps) = patch.ray_march_steps {
            next.ray_march_steps = steps.max(1);
        }
        if next == self.settings {
            return Ok(false);
        }

        if next.step_voxels != self.settings.step_voxels {
            if let Some(volume) = &mut self.volume {
                volume.uniforms = RayMarchUniforms::derive(
                    &volume.metadata.bbox,
                    volume.metadata.shape,
                    next.step_voxels,
                )?;
            }
        }
        self.settings = next;
        Ok(true)
    }

    /// Swap in a freshly prepared volume. The previous atlas is dropped.
    ///
    /// Uniforms prepared under an older step multiplier are re-derived with
    /// the current one.
    pub fn apply_prepared(&mut self, mut prepared: PreparedVolume) {
        if prepared.uniforms.step_voxels != self.settings.step_voxels {
            match RayMarchUniforms::derive(
                &prepared.metadata.bbox,
                prepared.metadata.shape,
                self.settings.step_voxels,
            ) {
                Ok(uniforms) => prepared.uniforms = uniforms,
                Err(e) => warn!(error = %e, "kept uniforms from load-time step"),
            }
        }
        debug!(
            shape = ?prepared.metadata.shape,
            bytes = prepared.metrics.bytes,
            "volume applied"
        );
        self.last_load_metrics = Some(prepared.metrics);
        self.last_error = None;
        self.volume = Some(prepared);
    }

    /// Remember a failure for the snapshot. Cancellations are not recorded.
    pub fn record_error(&mut self, err: &LoadError) {
        if !err.is_cancelled() {
            self.last_error = Some(err.to_string());
        }
    }

    pub fn atlas(&self) -> Option<&VolumeAtlas> {
        self.volume.as_ref().map(|v| &v.atlas)
    }

    pub fn uniforms(&self) -> Option<&RayMarchUniforms> {
        self.volume.as_ref().map(|v| &v.uniforms)
    }

    pub fn metadata(&self) -> Option<&VolumeMetadata> {
        self.volume.as_ref().map(|v| &v.metadata)
    }

    pub fn recommended_params(&self) -> Option<RecommendedParams> {
        let uniforms = self.uniforms()?;
        Some(RecommendedParams {
            step_m: uniforms.step_m,
            max_steps: uniforms.recommended_max_steps(self.settings.ray_march_steps),
        })
    }

    pub fn uniform_block(&self, camera: CameraRelative) -> Option<VolumeUniformBlock> {
        let volume = self.volume.as_ref()?;
        let params = self.recommended_params()?;
        Some(VolumeUniformBlock::new(
            &volume.uniforms,
            &volume.atlas,
            camera,
            params.max_steps,
        ))
    }

    pub fn snapshot(&self) -> RendererSnapshot {
        RendererSnapshot {
            ready: self.is_ready(),
            enabled: self.enabled,
            settings: self.settings.clone(),
            volume_metadata: self.metadata().cloned(),
            recommended_params: self.recommended_params(),
            last_load_metrics: self.last_load_metrics,
            last_error: self.last_error.clone(),
        }
    }

    /// Decode and apply a pack held in memory.
    ///
    /// `bbox_hint` is used when the pack header carries no bounds.
    pub async fn load_from_buffer(
        &mut self,
        bytes: Bytes,
        bbox_hint: Option<GeoBoundingBox>,
        cancel: &CancelToken,
    ) -> Result<(), LoadError> {
        let result =
            prepare_in_background(bytes, bbox_hint, self.settings.step_voxels, cancel).await;
        self.finish_load(result, None, cancel)
    }

    /// Fetch a pack from `backend` and apply it.
    pub async fn load_from_url(
        &mut self,
        backend: &dyn VolumeBackend,
        query: &VolumeQuery,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<(), LoadError> {
        let (bytes, fetch_ms) = match fetch_volume(backend.fetch(query), timeout, cancel).await {
            Ok(fetched) => fetched,
            Err(e) => return self.finish_load(Err(e), None, cancel),
        };
        let result =
            prepare_in_background(bytes, Some(query.bbox), self.settings.step_voxels, cancel)
                .await;
        self.finish_load(result, Some(fetch_ms), cancel)
    }

    fn finish_load(
        &mut self,
        result: Result<PreparedVolume, LoadError>,
        fetch_ms: Option<f64>,
        cancel: &CancelToken,
    ) -> Result<(), LoadError> {
        let result = result.and_then(|p| {
            if cancel.is_cancelled() {
                Err(LoadError::Cancelled)
            } else {
                Ok(p)
            }
        });
        match result {
            Ok(mut prepared) => {
                prepared.metrics.fetch_ms = fetch_ms;
                self.apply_prepared(prepared);
                Ok(())
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }
}
