//! Streaming coordinator for the volumetric cloud layer.
//!
//! Every camera update picks a window, maps it to a cache key and then either
//! does nothing, reloads a cached payload, or fetches a new one. At most one
//! load is outstanding; starting another cancels it first.
//!
//! Loads run as tokio tasks and report back through a channel. The host drains
//! that channel with [`VolumeLayer::poll`] once per tick, so all coordinator
//! state is only ever touched from the host's thread. A completion is applied
//! only when its generation is still the live one.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use runtime::{Metrics, MetricsSnapshot, QualityController, QualityTier, TierChange};
use serde::Serialize;
use streaming::{
    CacheKey, CameraPose, CancelToken, HttpBackend, VolumeBackend, VolumeCache, VolumeQuery,
    estimate_window,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::VolumeLayerConfig;
use crate::error::LoadError;
use crate::host::RenderHost;
use crate::layer::{Layer, LayerId};
use crate::load::{fetch_volume, prepare_in_background};
use crate::renderer::{
    PreparedVolume, RendererSettings, RendererSnapshot, SettingsPatch, VolumeRenderer,
};

pub const METRIC_CACHE_HIT: &str = "volume.cache_hit";
pub const METRIC_CACHE_MISS: &str = "volume.cache_miss";
pub const METRIC_FETCH: &str = "volume.fetch";
pub const METRIC_CANCELLED: &str = "volume.cancelled";
pub const METRIC_STALE: &str = "volume.stale";
pub const METRIC_FALLBACK: &str = "volume.fallback";
pub const METRIC_FETCH_MS: &str = "volume.fetch_ms";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    /// Decode a payload already in the cache.
    Reload,
    /// Fetch from the backend, then decode.
    Fetch,
}

#[derive(Debug)]
struct InFlight {
    key: CacheKey,
    kind: LoadKind,
    generation: u64,
    token: CancelToken,
}

#[derive(Debug, Default)]
struct RequestState {
    in_flight: Option<InFlight>,
    last_applied_key: Option<CacheKey>,
    generation: u64,
    fallback_active: bool,
    last_fetch_at: Option<Instant>,
}

struct Loaded {
    prepared: PreparedVolume,
    /// Fetched payload to cache once the completion is accepted.
    payload: Option<Bytes>,
}

struct Completion {
    generation: u64,
    key: CacheKey,
    outcome: Result<Loaded, LoadError>,
}

/// Diagnostics view of a [`VolumeLayer`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeLayerSnapshot {
    pub renderer: RendererSnapshot,
    pub quality: QualityTier,
    pub auto_downgrade: bool,
    pub fallback_active: bool,
    pub in_flight: Option<(LoadKind, String)>,
    pub last_applied_key: Option<String>,
    pub cached_windows: usize,
    pub metrics: MetricsSnapshot,
}

/// Volumetric cloud layer: owns the renderer state, payload cache, quality
/// controller and request lifecycle for one viewer.
pub struct VolumeLayer {
    id: LayerId,
    config: VolumeLayerConfig,
    host: Arc<dyn RenderHost>,
    backend: Option<Arc<dyn VolumeBackend>>,
    runtime: Handle,
    renderer: VolumeRenderer,
    cache: VolumeCache,
    quality: QualityController,
    metrics: Metrics,
    state: RequestState,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl VolumeLayer {
    /// `backend = None` leaves the layer permanently in fallback.
    pub fn new(
        id: LayerId,
        config: VolumeLayerConfig,
        host: Arc<dyn RenderHost>,
        backend: Option<Arc<dyn VolumeBackend>>,
        runtime: Handle,
    ) -> Self {
        let quality = QualityController::new(config.quality, config.auto_downgrade);
        let renderer = VolumeRenderer::new(RendererSettings {
            step_voxels: config.step_voxels,
            ray_march_steps: config.quality.preset().ray_march_steps,
        });
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        Self {
            id,
            cache: VolumeCache::new(config.cache_capacity),
            config,
            host,
            backend,
            runtime,
            renderer,
            quality,
            metrics: Metrics::new(),
            state: RequestState::default(),
            completions_tx,
            completions_rx,
        }
    }

    /// HTTP backend from `config.endpoint` on the current tokio runtime.
    pub fn from_config(
        id: LayerId,
        config: VolumeLayerConfig,
        host: Arc<dyn RenderHost>,
    ) -> Result<Self, tokio::runtime::TryCurrentError> {
        let runtime = Handle::try_current()?;
        let backend = config.is_streaming_configured().then(|| {
            Arc::new(HttpBackend::new(
                config.endpoint.trim(),
                config.request_timeout(),
            )) as Arc<dyn VolumeBackend>
        });
        Ok(Self::new(id, config, host, backend, runtime))
    }

    pub fn config(&self) -> &VolumeLayerConfig {
        &self.config
    }

    pub fn renderer(&self) -> &VolumeRenderer {
        &self.renderer
    }

    pub fn quality(&self) -> QualityTier {
        self.quality.tier()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn fallback_active(&self) -> bool {
        self.state.fallback_active
    }

    pub fn in_flight_key(&self) -> Option<&CacheKey> {
        self.state.in_flight.as_ref().map(|op| &op.key)
    }

    pub fn last_applied_key(&self) -> Option<&CacheKey> {
        self.state.last_applied_key.as_ref()
    }

    pub fn update_for_camera(&mut self, pose: &CameraPose) {
        self.update_for_camera_at(pose, Instant::now());
    }

    /// Camera update with an explicit clock reading for throttling.
    pub fn update_for_camera_at(&mut self, pose: &CameraPose, now: Instant) {
        let backend = match &self.backend {
            Some(backend) if self.config.is_streaming_configured() => backend.clone(),
            _ => {
                self.activate_fallback();
                return;
            }
        };

        let bbox = estimate_window(pose);
        let preset = self.quality.tier().preset();
        let query = match VolumeQuery::new(
            bbox,
            &self.config.levels,
            preset.grid_resolution_m,
            self.config.valid_time.as_deref(),
        ) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "volume request rejected before sending");
                self.renderer.record_error(&LoadError::Fetch(e));
                self.activate_fallback();
                return;
            }
        };
        let key = query.cache_key();

        if self.cache.contains(&key) {
            self.on_cache_hit(key, query);
        } else {
            self.on_cache_miss(key, query, backend, now, preset.min_update_interval_ms);
        }
    }

    fn on_cache_hit(&mut self, key: CacheKey, query: VolumeQuery) {
        if self.state.last_applied_key.as_ref() == Some(&key) {
            // Back on the applied window: anything else in flight is obsolete.
            if self.in_flight_key().is_some_and(|k| *k != key) {
                self.cancel_in_flight();
            }
            return;
        }
        if self.in_flight_key() == Some(&key) {
            return;
        }

        self.cancel_in_flight();
        let Some(payload) = self.cache.get(&key) else {
            return;
        };
        self.metrics.inc_counter(METRIC_CACHE_HIT);
        debug!(%key, "reloading cached volume");

        let (generation, token) = self.begin(key.clone(), LoadKind::Reload);
        let step_voxels = self.renderer.settings().step_voxels;
        let bbox = query.bbox;

        self.spawn_load(generation, key, async move {
            prepare_in_background(payload, Some(bbox), step_voxels, &token)
                .await
                .map(|prepared| Loaded {
                    prepared,
                    payload: None,
                })
        });
    }

    fn on_cache_miss(
        &mut self,
        key: CacheKey,
        query: VolumeQuery,
        backend: Arc<dyn VolumeBackend>,
        now: Instant,
        min_interval_ms: u64,
    ) {
        if self.in_flight_key() == Some(&key) {
            return;
        }

        let min_interval = Duration::from_millis(min_interval_ms);
        let throttled = self
            .state
            .last_fetch_at
            .is_some_and(|at| now.saturating_duration_since(at) < min_interval);
        if throttled && self.state.in_flight.is_some() {
            debug!(%key, "volume fetch throttled; dropping stale request");
            self.cancel_in_flight();
            return;
        }

        self.metrics.inc_counter(METRIC_CACHE_MISS);
        self.state.last_fetch_at = Some(now);
        self.cancel_in_flight();

        let (generation, token) = self.begin(key.clone(), LoadKind::Fetch);
        self.metrics.inc_counter(METRIC_FETCH);
        debug!(%key, res = query.resolution_m, "fetching volume");

        let request = backend.fetch(&query);
        let step_voxels = self.renderer.settings().step_voxels;
        let timeout = self.config.request_timeout();

        self.spawn_load(generation, key, async move {
            let (body, fetch_ms) = fetch_volume(request, timeout, &token).await?;
            let mut prepared =
                prepare_in_background(body.clone(), Some(query.bbox), step_voxels, &token).await?;
            prepared.metrics.fetch_ms = Some(fetch_ms);
            Ok(Loaded {
                prepared,
                payload: Some(body),
            })
        });
    }

    /// Run `work` as its own task and report its outcome, including a panic,
    /// as exactly one completion.
    fn spawn_load<F>(&self, generation: u64, key: CacheKey, work: F)
    where
        F: Future<Output = Result<Loaded, LoadError>> + Send + 'static,
    {
        let tx = self.completions_tx.clone();
        let worker = self.runtime.spawn(work);
        self.runtime.spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(join) => Err(LoadError::Worker(join.to_string())),
            };
            let _ = tx.send(Completion {
                generation,
                key,
                outcome,
            });
        });
    }

    fn begin(&mut self, key: CacheKey, kind: LoadKind) -> (u64, CancelToken) {
        self.state.generation += 1;
        let token = CancelToken::new();
        self.state.in_flight = Some(InFlight {
            key,
            kind,
            generation: self.state.generation,
            token: token.clone(),
        });
        (self.state.generation, token)
    }

    fn cancel_in_flight(&mut self) {
        if let Some(op) = self.state.in_flight.take() {
            op.token.cancel();
            self.state.generation += 1;
            self.metrics.inc_counter(METRIC_CANCELLED);
            debug!(key = %op.key, kind = ?op.kind, "cancelled in-flight volume load");
        }
    }

    /// Give up on streaming: cancel outstanding work and disable the renderer.
    ///
    /// Returns `false` if fallback was already active.
    pub fn activate_fallback(&mut self) -> bool {
        if self.state.fallback_active {
            return false;
        }
        self.state.fallback_active = true;
        self.cancel_in_flight();
        self.state.last_applied_key = None;
        self.renderer.set_enabled(false);
        self.metrics.inc_counter(METRIC_FALLBACK);
        warn!(layer = self.id.0, "volume streaming unavailable; renderer disabled");
        self.host.request_redraw();
        true
    }

    /// Apply finished loads. Call once per host tick; returns how many
    /// volumes were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if self.handle_completion(completion) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait until nothing is in flight, applying completions as they arrive.
    pub async fn settle(&mut self) {
        while self.state.in_flight.is_some() {
            match self.completions_rx.recv().await {
                Some(completion) => {
                    self.handle_completion(completion);
                }
                None => break,
            }
        }
        self.poll();
    }

    fn handle_completion(&mut self, completion: Completion) -> bool {
        let Completion {
            generation,
            key,
            outcome,
        } = completion;

        let live = match &self.state.in_flight {
            Some(op) => op.generation == generation && !op.token.is_cancelled(),
            None => false,
        };
        if !live {
            self.metrics.inc_counter(METRIC_STALE);
            debug!(%key, generation, "discarding stale volume completion");
            return false;
        }
        self.state.in_flight = None;

        match outcome {
            Ok(Loaded { prepared, payload }) => {
                if let Some(payload) = payload {
                    for evicted in self.cache.set(key.clone(), payload) {
                        debug!(key = %evicted, "evicted cached volume");
                    }
                }
                if let Some(ms) = prepared.metrics.fetch_ms {
                    self.metrics.record_histogram(METRIC_FETCH_MS, ms);
                }
                self.renderer.apply_prepared(prepared);
                self.renderer.set_enabled(true);
                self.state.last_applied_key = Some(key);
                self.state.fallback_active = false;
                self.host.request_redraw();
                true
            }
            Err(e) if e.is_cancelled() => {
                debug!(%key, "volume load cancelled");
                false
            }
            Err(e) => {
                warn!(%key, error = %e, "volume load failed");
                self.renderer.record_error(&e);
                self.activate_fallback();
                false
            }
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.renderer.set_enabled(enabled) {
            self.host.request_redraw();
        }
    }

    pub fn update_settings(&mut self, patch: &SettingsPatch) -> Result<(), LoadError> {
        if self.renderer.update_settings(patch)? {
            self.host.request_redraw();
        }
        Ok(())
    }

    pub fn set_quality(&mut self, tier: QualityTier) {
        if let Some(change) = self.quality.set_tier(tier) {
            self.on_tier_change(change);
        }
    }

    pub fn set_auto_downgrade(&mut self, enabled: bool) {
        self.quality.set_auto_adjust(enabled);
    }

    /// Feed one frame duration from the host's render loop.
    pub fn record_frame(&mut self, delta_ms: f64) {
        if let Some(change) = self.quality.record_frame(delta_ms) {
            self.on_tier_change(change);
        }
    }

    fn on_tier_change(&mut self, change: TierChange) {
        info!(from = %change.from, to = %change.to, "volume quality tier changed");
        self.cancel_in_flight();
        self.state.last_applied_key = None;
        self.state.last_fetch_at = None;
        self.state.fallback_active = false;

        let patch = SettingsPatch {
            ray_march_steps: Some(change.to.preset().ray_march_steps),
            ..SettingsPatch::default()
        };
        if let Err(e) = self.renderer.update_settings(&patch) {
            warn!(error = %e, "could not apply tier step budget");
        }

        let pose = self.host.camera_pose();
        self.update_for_camera(&pose);
    }

    pub fn snapshot(&self) -> VolumeLayerSnapshot {
        VolumeLayerSnapshot {
            renderer: self.renderer.snapshot(),
            quality: self.quality.tier(),
            auto_downgrade: self.quality.auto_adjust(),
            fallback_active: self.state.fallback_active,
            in_flight: self
                .state
                .in_flight
                .as_ref()
                .map(|op| (op.kind, op.key.to_string())),
            last_applied_key: self.state.last_applied_key.as_ref().map(CacheKey::to_string),
            cached_windows: self.cache.len(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl Layer for VolumeLayer {
    fn id(&self) -> LayerId {
        self.id
    }

    fn name(&self) -> &str {
        "volumetric-clouds"
    }

    fn is_enabled(&self) -> bool {
        self.renderer.is_enabled()
    }
}

impl Drop for VolumeLayer {
    fn drop(&mut self) {
        if let Some(op) = self.state.in_flight.take() {
            op.token.cancel();
        }
    }
}
