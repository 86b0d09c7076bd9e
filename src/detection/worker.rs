//! Detection worker stage
//!
//! Owns the marker engine and answers [`WorkerRequest`]s with [`WorkerEvent`]s.
//! Engine calls are blocking; each one moves the engine (and the frame) onto the
//! blocking pool and takes them back when it returns, so the worker task itself
//! never blocks the runtime.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::engine::{MarkerEngine, MarkerHit};
use crate::assets::EVENT_CHANNEL_CAPACITY;
use crate::pipeline::PipelineStage;
use crate::pipeline::messages::{LoadRequest, WorkerEvent, WorkerRequest};
use crate::pipeline::types::FrameBuffer;

/// Detection worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unloaded,
    Loading,
    Ready,
    Detecting,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: &WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Unloaded, Loading)
                | (Loading, Ready)
                | (Loading, Unloaded)
                | (Ready, Detecting)
                | (Detecting, Ready)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Unloaded => "Unloaded",
            WorkerState::Loading => "Loading",
            WorkerState::Ready => "Ready",
            WorkerState::Detecting => "Detecting",
        };
        f.write_str(s)
    }
}

/// Event channel closed; the render side is gone
struct Disconnected;

/// Detection stage: loads the engine on request and runs detections
pub struct DetectionWorker<E: MarkerEngine> {
    engine: Option<E>,
    state: WorkerState,
    input_rx: Option<mpsc::Receiver<WorkerRequest>>,
    output_tx: Option<mpsc::Sender<WorkerEvent>>,
    cancel: CancellationToken,
    detections: u64,
    hits: u64,
}

impl<E: MarkerEngine> DetectionWorker<E> {
    pub fn new(engine: E, cancel: CancellationToken) -> Self {
        Self {
            engine: Some(engine),
            state: WorkerState::Unloaded,
            input_rx: None,
            output_tx: None,
            cancel,
            detections: 0,
            hits: 0,
        }
    }

    /// Set the request channel
    pub fn set_input(&mut self, rx: mpsc::Receiver<WorkerRequest>) {
        self.input_rx = Some(rx);
    }

    /// Get the event channel
    pub fn take_output(&mut self) -> mpsc::Receiver<WorkerEvent> {
        let (tx, rx) = mpsc::channel::<WorkerEvent>(EVENT_CHANNEL_CAPACITY);
        self.output_tx = Some(tx);
        rx
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Number of frames searched and number of hits
    pub fn stats(&self) -> (u64, u64) {
        (self.detections, self.hits)
    }

    fn transition(&mut self, target: WorkerState) {
        if !self.state.can_transition_to(&target) {
            warn!(
                "DetectionWorker: unexpected transition {} -> {}",
                self.state, target
            );
        }
        self.state = target;
    }

    async fn emit(
        tx: &mpsc::Sender<WorkerEvent>,
        event: WorkerEvent,
    ) -> std::result::Result<(), Disconnected> {
        tx.send(event).await.map_err(|_| Disconnected)
    }

    async fn load(
        &mut self,
        request: LoadRequest,
        tx: &mpsc::Sender<WorkerEvent>,
    ) -> Result<std::result::Result<(), Disconnected>> {
        if self.state != WorkerState::Unloaded {
            warn!(
                "DetectionWorker: ignoring load request while {}",
                self.state
            );
            return Ok(Ok(()));
        }
        self.transition(WorkerState::Loading);
        info!(
            "DetectionWorker: loading {} markers at {}x{}",
            request.marker_refs.len(),
            request.pw,
            request.ph
        );

        let mut engine = self.engine.take().ok_or_else(|| anyhow!("engine lost"))?;
        let (mut engine, camera) = tokio::task::spawn_blocking(move || {
            let result = engine.load_camera(&request);
            (engine, result.map(|projection| (projection, request.marker_refs)))
        })
        .await
        .context("camera loading panicked")?;

        let (projection, marker_refs) = match camera {
            Ok(loaded) => loaded,
            Err(e) => {
                self.engine = Some(engine);
                return Ok(self.fail_load(e.to_string(), tx).await);
            }
        };
        if let Err(e) = Self::emit(tx, WorkerEvent::Loaded { projection }).await {
            self.engine = Some(engine);
            return Ok(Err(e));
        }

        let (engine, markers) = tokio::task::spawn_blocking(move || {
            let result = engine.load_markers(&marker_refs);
            (engine, result)
        })
        .await
        .context("marker loading panicked")?;
        self.engine = Some(engine);

        let infos = match markers {
            Ok(infos) => infos,
            Err(e) => return Ok(self.fail_load(e.to_string(), tx).await),
        };
        let count = infos.len();
        if let Err(e) = Self::emit(tx, WorkerEvent::MarkerInfos { infos }).await {
            return Ok(Err(e));
        }

        self.transition(WorkerState::Ready);
        info!("DetectionWorker: ready with {} markers", count);
        Ok(Self::emit(tx, WorkerEvent::EndLoading).await)
    }

    async fn fail_load(
        &mut self,
        reason: String,
        tx: &mpsc::Sender<WorkerEvent>,
    ) -> std::result::Result<(), Disconnected> {
        error!("DetectionWorker: loading failed: {}", reason);
        if let Some(engine) = self.engine.as_mut() {
            engine.unload();
        }
        self.transition(WorkerState::Unloaded);
        Self::emit(tx, WorkerEvent::LoadFailed { reason }).await
    }

    async fn process(
        &mut self,
        exchange: u64,
        pixels: FrameBuffer,
        tx: &mpsc::Sender<WorkerEvent>,
    ) -> Result<std::result::Result<(), Disconnected>> {
        if self.state != WorkerState::Ready {
            trace!(
                "DetectionWorker: exchange {} answered while {}",
                exchange, self.state
            );
            return Ok(Self::emit(tx, WorkerEvent::NotFound { exchange, pixels }).await);
        }

        self.transition(WorkerState::Detecting);
        let mut engine = self.engine.take().ok_or_else(|| anyhow!("engine lost"))?;
        let (engine, pixels, hit) = tokio::task::spawn_blocking(move || {
            let hit = engine.detect(&pixels);
            (engine, pixels, hit)
        })
        .await
        .context("detection panicked")?;
        self.engine = Some(engine);
        self.transition(WorkerState::Ready);

        self.detections += 1;
        let event = match hit {
            Some(MarkerHit { index, transform }) => {
                self.hits += 1;
                trace!("DetectionWorker: exchange {} found marker {}", exchange, index);
                WorkerEvent::Found {
                    exchange,
                    index,
                    transform,
                    pixels,
                }
            }
            None => {
                trace!("DetectionWorker: exchange {} not found", exchange);
                WorkerEvent::NotFound { exchange, pixels }
            }
        };
        Ok(Self::emit(tx, event).await)
    }
}

#[async_trait]
impl<E: MarkerEngine> PipelineStage for DetectionWorker<E> {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow!("No input channel"))?;
        let output_tx = self
            .output_tx
            .take()
            .ok_or_else(|| anyhow!("No output channel"))?;

        info!("DetectionWorker: started");

        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("DetectionWorker: cancelled");
                    break;
                }
                request = input_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let delivered = match request {
                WorkerRequest::Load(request) => self.load(request, &output_tx).await?,
                WorkerRequest::Process { exchange, pixels } => {
                    self.process(exchange, pixels, &output_tx).await?
                }
            };
            if delivered.is_err() {
                debug!("DetectionWorker: event channel closed");
                break;
            }
        }

        info!(
            "DetectionWorker: ended ({} detections, {} hits)",
            self.detections, self.hits
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DetectionWorker"
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(engine) = self.engine.as_mut() {
            engine.unload();
        }
        Ok(())
    }
}
