/**
 * Capture source
 * The camera handle is a session-scoped resource: opened when the gate
 * session becomes ready, closed unconditionally when the session is torn
 * down. The server's concrete source is a one-deep frame slot fed by the
 * collaborator with each capture request.
 */

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::GateError;

/// One still image, 8-bit luma, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, GateError> {
        if width == 0 || height == 0 {
            return Err(GateError::BadFrame("zero frame dimension".to_string()));
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(GateError::BadFrame(format!(
                "pixel buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Acquire the capture device for the session.
    async fn open(&self) -> Result<(), GateError>;

    /// Materialize one still frame, or fail with `Capture` if none is
    /// available (e.g. permission denied, nothing submitted yet).
    async fn grab(&self) -> Result<Frame, GateError>;

    /// Release the capture device. Safe to call in any state, any number
    /// of times.
    async fn close(&self);
}

/// Capture source backed by a single-frame slot. Grabbing empties the
/// slot, so each submitted frame is evaluated at most once.
pub struct FrameSlot {
    slot: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Deposit the next frame to evaluate, replacing any stale one.
    pub async fn submit(&self, frame: Frame) {
        *self.slot.lock().await = Some(frame);
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for FrameSlot {
    async fn open(&self) -> Result<(), GateError> {
        Ok(())
    }

    async fn grab(&self) -> Result<Frame, GateError> {
        self.slot
            .lock()
            .await
            .take()
            .ok_or_else(|| GateError::Capture("no frame available".to_string()))
    }

    async fn close(&self) {
        self.slot.lock().await.take();
    }
}
