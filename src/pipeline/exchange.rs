//! Frame exchange between the capture side and the detection worker
//!
//! One pixel buffer circulates between the two sides:
//!
//! ```text
//!   Idle ──send()──► Sent ──accept()──► Returned ──recycle()──► Idle
//!                     │
//!                     └──expire()──► Idle (fresh buffer, old one abandoned)
//! ```
//!
//! While `Sent` the buffer belongs to the worker and capture requests are
//! refused, never queued: a stale detection is worthless for live tracking, so
//! only the freshest frame is ever in flight.

use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::clock::TrackingClock;
use super::health::PipelineHealth;
use super::messages::{LoadRequest, Matrix4Data, WorkerEvent, WorkerRequest};
use super::types::{BYTES_PER_PIXEL, FrameBuffer};

/// Where the circulating buffer currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// The capture side owns the buffer and may fill it
    Idle,
    /// The worker owns the buffer
    Sent { exchange: u64 },
    /// The worker replied and handed the buffer back; the result is being routed
    Returned { exchange: u64 },
}

/// Result of a completed exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectionOutcome {
    Found { index: usize, transform: Matrix4Data },
    NotFound,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("exchange is not idle (state: {0:?})")]
    NotIdle(ExchangeState),
    #[error("reply for exchange {got} does not match the in-flight exchange {expected:?}")]
    Stale { expected: Option<u64>, got: u64 },
    #[error("'{0}' is not a per-frame reply")]
    UnexpectedEvent(&'static str),
    #[error("returned buffer is {got} bytes, expected {expected}")]
    ForeignBuffer { expected: usize, got: usize },
    #[error("detection worker is gone")]
    WorkerGone,
    #[error("request channel is full")]
    Backlogged,
}

/// Channel wrapper enforcing single-flight buffer ownership
pub struct FrameExchange {
    request_tx: mpsc::Sender<WorkerRequest>,
    slot: Option<FrameBuffer>,
    state: ExchangeState,
    sent_at: Option<Instant>,
    width: u32,
    height: u32,
    clock: TrackingClock,
    health: Arc<PipelineHealth>,
}

impl FrameExchange {
    /// Create an exchange owning a fresh `width` × `height` buffer
    pub fn new(
        request_tx: mpsc::Sender<WorkerRequest>,
        width: u32,
        height: u32,
        clock: TrackingClock,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            request_tx,
            slot: Some(FrameBuffer::new(width, height)),
            state: ExchangeState::Idle,
            sent_at: None,
            width,
            height,
            clock,
            health,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Whether a detection request is outstanding
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, ExchangeState::Sent { .. })
    }

    /// Time since the in-flight request was sent
    pub fn in_flight_for(&self) -> Option<Duration> {
        self.sent_at.map(|t| t.elapsed())
    }

    /// Storage address of the buffer while the capture side owns it
    pub fn buffer_storage_id(&self) -> Option<usize> {
        self.slot.as_ref().map(FrameBuffer::storage_id)
    }

    /// Forward the load request to the worker
    pub fn load(&self, request: LoadRequest) -> Result<(), ExchangeError> {
        self.request_tx
            .try_send(WorkerRequest::Load(request))
            .map_err(|e| match e {
                TrySendError::Full(_) => ExchangeError::Backlogged,
                TrySendError::Closed(_) => ExchangeError::WorkerGone,
            })
    }

    /// Borrow the buffer for filling.
    ///
    /// Returns `None` (and counts a skipped capture) unless the exchange is idle.
    pub fn capture_slot(&mut self) -> Option<&mut FrameBuffer> {
        if self.state != ExchangeState::Idle {
            self.health.record_capture_skip();
            return None;
        }
        self.slot.as_mut()
    }

    /// Hand the buffer over to the worker.
    ///
    /// On a channel failure the buffer is kept and the exchange stays idle.
    pub fn send(&mut self) -> Result<u64, ExchangeError> {
        if self.state != ExchangeState::Idle {
            return Err(ExchangeError::NotIdle(self.state));
        }
        let Some(pixels) = self.slot.take() else {
            return Err(ExchangeError::NotIdle(self.state));
        };

        let exchange = self.clock.next_exchange_id();
        match self
            .request_tx
            .try_send(WorkerRequest::Process { exchange, pixels })
        {
            Ok(()) => {
                self.state = ExchangeState::Sent { exchange };
                self.sent_at = Some(Instant::now());
                self.health.record_buffer_sent();
                debug!("FrameExchange: sent exchange {}", exchange);
                Ok(exchange)
            }
            Err(TrySendError::Full(WorkerRequest::Process { pixels, .. })) => {
                self.slot = Some(pixels);
                Err(ExchangeError::Backlogged)
            }
            Err(TrySendError::Closed(WorkerRequest::Process { pixels, .. })) => {
                self.slot = Some(pixels);
                Err(ExchangeError::WorkerGone)
            }
            Err(_) => Err(ExchangeError::WorkerGone),
        }
    }

    /// Take a per-frame reply from the worker and reclaim its buffer.
    ///
    /// A reply that does not belong to the in-flight exchange is a protocol
    /// violation: it is counted and dropped, and the state is left untouched.
    pub fn accept(&mut self, event: WorkerEvent) -> Result<DetectionOutcome, ExchangeError> {
        let (exchange, outcome, pixels) = match event {
            WorkerEvent::Found {
                exchange,
                index,
                transform,
                pixels,
            } => (exchange, DetectionOutcome::Found { index, transform }, pixels),
            WorkerEvent::NotFound { exchange, pixels } => {
                (exchange, DetectionOutcome::NotFound, pixels)
            }
            other => return Err(ExchangeError::UnexpectedEvent(other.kind())),
        };

        let expected = match self.state {
            ExchangeState::Sent { exchange } => Some(exchange),
            _ => None,
        };
        if expected != Some(exchange) {
            self.health.record_protocol_violation();
            warn!(
                "FrameExchange: dropping reply for exchange {} (in flight: {:?})",
                exchange, expected
            );
            return Err(ExchangeError::Stale {
                expected,
                got: exchange,
            });
        }

        let expected_len = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        if pixels.byte_len() != expected_len {
            self.health.record_protocol_violation();
            warn!(
                "FrameExchange: exchange {} returned a {} byte buffer, replacing it",
                exchange,
                pixels.byte_len()
            );
            self.abandon();
            return Err(ExchangeError::ForeignBuffer {
                expected: expected_len,
                got: pixels.byte_len(),
            });
        }

        self.slot = Some(pixels);
        self.state = ExchangeState::Returned { exchange };
        self.sent_at = None;
        self.health
            .record_buffer_returned(matches!(outcome, DetectionOutcome::Found { .. }));
        Ok(outcome)
    }

    /// Finish routing a returned result; the buffer is ready for the next capture
    pub fn recycle(&mut self) -> Result<(), ExchangeError> {
        match self.state {
            ExchangeState::Returned { .. } => {
                self.state = ExchangeState::Idle;
                Ok(())
            }
            state => Err(ExchangeError::NotIdle(state)),
        }
    }

    /// Stop waiting for the in-flight buffer and continue with a fresh one
    fn abandon(&mut self) {
        self.slot = Some(FrameBuffer::new(self.width, self.height));
        self.state = ExchangeState::Idle;
        self.sent_at = None;
        self.health.record_buffer_abandoned();
    }

    /// Give up on an in-flight detection older than `deadline`.
    ///
    /// The worker keeps the old buffer; a fresh one is allocated so capturing can
    /// continue. Returns the abandoned exchange id.
    pub fn expire(&mut self, deadline: Duration) -> Option<u64> {
        let ExchangeState::Sent { exchange } = self.state else {
            return None;
        };
        if self.in_flight_for().is_none_or(|age| age < deadline) {
            return None;
        }

        self.abandon();
        self.health.record_timeout();
        warn!(
            "FrameExchange: exchange {} exceeded {:?}, buffer abandoned",
            exchange, deadline
        );
        Some(exchange)
    }
}

impl std::fmt::Debug for FrameExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameExchange")
            .field("state", &self.state)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("owns_buffer", &self.slot.is_some())
            .finish()
    }
}
