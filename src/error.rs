/**
 * Gate error taxonomy
 * Only ModelLoad is a blocking condition; Capture and Persistence are
 * recovered inside the gate and reported as a Rejected outcome.
 */

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// Backend model assets unreachable or malformed. Fatal to the whole
    /// gate: no capture is possible until resolved.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// No frame could be acquired from the capture source (e.g. camera
    /// permission denied). Recoverable, the user may retry.
    #[error("frame capture failed: {0}")]
    Capture(String),

    /// Reading or writing the enrollment record failed. Never conflated
    /// with success: a failed enroll write is reported as rejected.
    #[error("enrollment record store failed: {0}")]
    Persistence(String),

    /// Submitted frame dimensions do not match its pixel buffer.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// Operation requires an open session.
    #[error("no open gate session")]
    NoSession,

    /// Session exists but the backend is still initializing.
    #[error("gate session is still initializing")]
    NotReady,

    /// Callers must close the current session before reopening.
    #[error("a gate session is already open")]
    SessionAlreadyOpen,
}
