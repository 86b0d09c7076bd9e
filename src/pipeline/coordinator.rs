//! Tracking session coordinator
//!
//! Runs on the render context. Every display tick it captures a camera frame
//! into the exchange buffer (unless a detection is still in flight), presents
//! the camera background through the double-buffered textures, and routes
//! detection results into the marker registry.

use anyhow::{Context, Result, anyhow, bail, ensure};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::assets::{HEALTH_SUMMARY_INTERVAL_SECS, REQUEST_CHANNEL_CAPACITY};
use crate::capture::{CameraSource, CaptureError, Letterbox, ProcessingGeometry};
use crate::config::TrackerConfig;
use crate::detection::projection::rescale_to_content;
use crate::detection::{DetectionWorker, FieldOfView, MarkerEngine};
use crate::display::{DoubleBuffer, RenderTarget, TextureHandle};
use crate::markers::{MarkerCalibration, MarkerHandle, MarkerRegistry, PoseUpdate, RegistryError};
use crate::pipeline::exchange::{DetectionOutcome, ExchangeState, FrameExchange};
use crate::pipeline::messages::{LoadRequest, Matrix4Data, WorkerEvent};
use crate::pipeline::stage::spawn_stage;
use crate::pipeline::{PipelineHealth, PipelineState, TrackingClock};

/// Resources that exist between `start` and `stop`
struct Session {
    exchange: FrameExchange,
    events: mpsc::Receiver<WorkerEvent>,
    letterbox: Letterbox,
    display: Option<DoubleBuffer<TextureHandle>>,
    field_of_view: Option<FieldOfView>,
    worker: JoinHandle<()>,
}

/// Owns the marker registry and drives one tracking session
pub struct TrackingCoordinator {
    config: TrackerConfig,
    registry: MarkerRegistry,
    clock: TrackingClock,
    health: Arc<PipelineHealth>,
    state: PipelineState,
    cancel: CancellationToken,
    session: Option<Session>,
}

impl TrackingCoordinator {
    pub fn new(config: TrackerConfig) -> Self {
        let registry = MarkerRegistry::new(config.filter, config.device_pixel_ratio);
        Self {
            config,
            registry,
            clock: TrackingClock::new(),
            health: Arc::new(PipelineHealth::new()),
            state: PipelineState::Idle,
            cancel: CancellationToken::new(),
            session: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn clock(&self) -> &TrackingClock {
        &self.clock
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn registry(&self) -> &MarkerRegistry {
        &self.registry
    }

    pub fn geometry(&self) -> Option<&ProcessingGeometry> {
        self.session.as_ref().map(|s| s.letterbox.geometry())
    }

    pub fn field_of_view(&self) -> Option<FieldOfView> {
        self.session.as_ref().and_then(|s| s.field_of_view)
    }

    pub fn exchange_state(&self) -> Option<ExchangeState> {
        self.session.as_ref().map(|s| s.exchange.state())
    }

    /// Storage address of the capture buffer while the render side owns it
    pub fn buffer_storage_id(&self) -> Option<usize> {
        self.session
            .as_ref()
            .and_then(|s| s.exchange.buffer_storage_id())
    }

    fn transition(&mut self, target: PipelineState) -> Result<()> {
        ensure!(
            self.state.can_transition_to(&target),
            "invalid state transition {} -> {}",
            self.state,
            target
        );
        debug!("TrackingCoordinator: {} -> {}", self.state, target);
        self.state = target;
        Ok(())
    }

    /// Add a marker. Markers are indexed in registration order.
    pub fn register_marker(&mut self, source: impl Into<String>) -> Result<MarkerHandle, RegistryError> {
        if !self.state.accepts_registration() {
            return Err(RegistryError::Sealed);
        }
        self.registry.register(source)
    }

    /// Spawn the detection worker and ask it to load the camera calibration and
    /// every registered marker. Tracking begins once loading has finished.
    pub fn start<E: MarkerEngine>(&mut self, engine: E, camera_resolution: (u32, u32)) -> Result<()> {
        ensure!(
            self.state == PipelineState::Idle,
            "tracking already started ({})",
            self.state
        );
        ensure!(!self.registry.is_empty(), "no markers registered");
        let (width, height) = camera_resolution;
        ensure!(width > 0 && height > 0, "camera resolution is empty");

        self.registry.seal();
        let geometry =
            ProcessingGeometry::compute(width, height, self.config.processing_long_edge);
        let (pw, ph) = geometry.processing;
        info!(
            "TrackingCoordinator: camera {}x{}, processing {}x{} (content {}x{} at {:?})",
            width, height, pw, ph, geometry.content.0, geometry.content.1, geometry.offset
        );

        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let mut worker = DetectionWorker::new(engine, self.cancel.child_token());
        worker.set_input(request_rx);
        let events = worker.take_output();
        let handle = spawn_stage(worker);
        let worker = tokio::spawn(async move {
            if let Ok(worker) = handle.await {
                let (detections, hits) = worker.stats();
                debug!(
                    "TrackingCoordinator: worker finished in {} after {} detections ({} hits)",
                    worker.state(),
                    detections,
                    hits
                );
            }
        });

        let exchange = FrameExchange::new(request_tx, pw, ph, self.clock.clone(), self.health.clone());
        exchange
            .load(LoadRequest {
                pw,
                ph,
                min_cutoff_filter: self.config.filter.min_cut_off,
                beta_filter: self.config.filter.beta,
                camera_calibration_ref: self.config.camera_calibration.clone(),
                marker_refs: self.registry.sources(),
                simd_capable: self.config.simd_capable(),
            })
            .context("failed to send load request")?;

        self.session = Some(Session {
            exchange,
            events,
            letterbox: Letterbox::new(geometry),
            display: None,
            field_of_view: None,
            worker,
        });
        self.spawn_health_summary();
        self.transition(PipelineState::Loading)
    }

    fn spawn_health_summary(&self) {
        let health = self.health.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(HEALTH_SUMMARY_INTERVAL_SECS);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => info!("Tracking pipeline health: {}", health.summary()),
                }
            }
        });
    }

    /// Stop dispatching captures. The display keeps running.
    pub fn pause(&mut self) -> Result<()> {
        self.transition(PipelineState::Paused {
            paused_at: Instant::now(),
        })?;
        info!("TrackingCoordinator: paused");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        ensure!(self.state.is_paused(), "tracking is not paused ({})", self.state);
        self.transition(PipelineState::Running {
            started_at: Instant::now(),
        })?;
        info!("TrackingCoordinator: resumed");
        Ok(())
    }

    /// End the session. The worker is cancelled and a detection still in
    /// flight is abandoned.
    pub fn stop(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }
        self.state = PipelineState::Stopping;
        self.cancel.cancel();
        if let Some(session) = self.session.take() {
            debug!(
                "TrackingCoordinator: worker task {}",
                if session.worker.is_finished() { "finished" } else { "stopping" }
            );
        }
        self.state = PipelineState::Stopped;
        info!("TrackingCoordinator: stopped. {}", self.health.summary());
    }

    /// One display tick: capture and dispatch if possible, present the front
    /// texture, and queue the current frame into the back one.
    ///
    /// Never waits for the detection worker.
    pub fn tick(
        &mut self,
        camera: &mut dyn CameraSource,
        renderer: &mut dyn RenderTarget,
    ) -> Result<()> {
        if !self.state.is_displaying() {
            return Ok(());
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if let Some(deadline) = self.config.detection_timeout()
            && session.exchange.expire(deadline).is_some()
        {
            // an abandoned detection counts as "not found"
            for index in self.registry.lose_all_except(None) {
                renderer.marker_lost(index);
            }
        }

        let frame = camera
            .current_frame()
            .map_err(|e| anyhow!(e).context("camera failed"))?;

        if self.state.is_running()
            && let Some(slot) = session.exchange.capture_slot()
        {
            if !session.letterbox.fill(frame, slot) {
                let got = frame.dimensions();
                return Err(anyhow!(CaptureError::ResolutionChanged {
                    expected: session.letterbox.geometry().source,
                    got,
                }));
            }
            match session.exchange.send() {
                Ok(exchange) => trace!("TrackingCoordinator: dispatched exchange {}", exchange),
                Err(e) => warn!("TrackingCoordinator: capture not dispatched: {}", e),
            }
        }

        let (width, height) = frame.dimensions();
        let display = session
            .display
            .get_or_insert_with(|| DoubleBuffer::new(|| renderer.create_texture(width, height)));
        // show the frame uploaded last tick while this one uploads
        renderer.present(*display.front());
        renderer.schedule_upload(*display.back(), frame);
        display.swap();
        self.health.record_frame_displayed();
        Ok(())
    }

    /// Next message from the detection worker. Pending forever without a session.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        match self.session.as_mut() {
            Some(session) => session.events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Route one worker message.
    ///
    /// Loading failures and invalid marker calibrations are configuration
    /// errors and end the session.
    pub fn handle_event(
        &mut self,
        event: WorkerEvent,
        renderer: &mut dyn RenderTarget,
    ) -> Result<()> {
        match event {
            WorkerEvent::Loaded { projection } => {
                self.on_loaded(&projection, renderer);
                Ok(())
            }
            WorkerEvent::MarkerInfos { infos } => self.on_marker_infos(&infos),
            WorkerEvent::EndLoading => {
                self.transition(PipelineState::Running {
                    started_at: Instant::now(),
                })?;
                info!(
                    "TrackingCoordinator: tracking {} markers",
                    self.registry.len()
                );
                Ok(())
            }
            WorkerEvent::LoadFailed { reason } => {
                error!("TrackingCoordinator: detection worker failed to load: {}", reason);
                self.stop();
                bail!("detection worker failed to load: {}", reason)
            }
            event @ (WorkerEvent::Found { .. } | WorkerEvent::NotFound { .. }) => {
                self.on_result(event, renderer);
                Ok(())
            }
        }
    }

    fn on_loaded(&mut self, projection: &Matrix4Data, renderer: &mut dyn RenderTarget) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let geometry = session.letterbox.geometry();
        let projection = rescale_to_content(projection, geometry.processing, geometry.content);
        let fov = FieldOfView::from_projection(&projection);
        info!(
            "TrackingCoordinator: field of view {:.1}° x {:.1}°",
            fov.horizontal_degrees(),
            fov.vertical_degrees()
        );
        session.field_of_view = Some(fov);
        renderer.set_field_of_view(fov);
    }

    fn on_marker_infos(&mut self, infos: &[MarkerCalibration]) -> Result<()> {
        if infos.len() != self.registry.len() {
            warn!(
                "TrackingCoordinator: {} marker infos for {} markers",
                infos.len(),
                self.registry.len()
            );
        }
        for (index, calibration) in infos.iter().enumerate() {
            if let Err(e) = self.registry.set_calibration(index, *calibration) {
                error!("TrackingCoordinator: {}", e);
                self.stop();
                return Err(e).context("marker calibration rejected");
            }
        }
        Ok(())
    }

    fn on_result(&mut self, event: WorkerEvent, renderer: &mut dyn RenderTarget) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let outcome = match session.exchange.accept(event) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("TrackingCoordinator: result dropped: {}", e);
                return;
            }
        };

        let timestamp = self.clock.now();
        match outcome {
            DetectionOutcome::Found { index, transform } => {
                for lost in self.registry.lose_all_except(Some(index)) {
                    renderer.marker_lost(lost);
                }
                match self.registry.apply_pose(index, Some(&transform), timestamp) {
                    Ok(PoseUpdate::Tracked(pose)) => renderer.set_marker_pose(index, &pose),
                    Ok(_) => {}
                    Err(e) => error!("TrackingCoordinator: cannot apply pose: {}", e),
                }
            }
            DetectionOutcome::NotFound => {
                trace!("TrackingCoordinator: no marker in frame");
                for lost in self.registry.lose_all_except(None) {
                    renderer.marker_lost(lost);
                }
            }
        }

        if let Err(e) = session.exchange.recycle() {
            warn!("TrackingCoordinator: {}", e);
        }
    }

    /// Drive the session until cancelled, the camera fails, or loading fails.
    ///
    /// Ticks at the configured rate and handles worker messages as they arrive.
    pub async fn run(
        &mut self,
        camera: &mut dyn CameraSource,
        renderer: &mut dyn RenderTarget,
        cancel: CancellationToken,
        max_ticks: Option<u64>,
    ) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0u64;

        let result = loop {
            if self.state.is_stopped() {
                break Ok(());
            }
            if max_ticks.is_some_and(|max| ticks >= max) {
                info!("TrackingCoordinator: tick limit reached");
                break Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("TrackingCoordinator: cancelled");
                    break Ok(());
                }
                _ = interval.tick() => {
                    ticks += 1;
                    if let Err(e) = self.tick(camera, renderer) {
                        break Err(e);
                    }
                }
                event = self.next_event() => {
                    let Some(event) = event else {
                        break Err(anyhow!("detection worker stopped unexpectedly"));
                    };
                    if let Err(e) = self.handle_event(event, renderer) {
                        break Err(e);
                    }
                }
            }
        };

        self.stop();
        result
    }
}

impl Drop for TrackingCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TrackingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingCoordinator")
            .field("state", &self.state)
            .field("markers", &self.registry.len())
            .field("exchange", &self.exchange_state())
            .finish()
    }
}
