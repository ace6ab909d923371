/**
 * Verification Gate
 * Orchestrates one capture-compare-report cycle per attempt in enroll or
 * verify mode. Owns the single session; depends on the signature engine,
 * an injected descriptor store and an injected capture source.
 */

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capture::CaptureSource;
use crate::error::GateError;
use crate::signature::{euclidean_distance, Descriptor, SignatureEngine};
use crate::store::DescriptorStore;

/// Default match threshold; callers override per invocation (the vault
/// collaborator passes 0.6 for its gated actions). Lower is stricter,
/// comparison is inclusive.
pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Enroll,
    Verify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Ready,
    Capturing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoFace,
    NoEnrollment,
    Mismatch,
    Error,
}

/// Structured result of one capture-compare cycle. The enroll-mode
/// descriptor stays in-process: it is never serialized out.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Success {
        #[serde(skip)]
        descriptor: Descriptor,
    },
    Verified {
        distance: f32,
    },
    Rejected {
        reason: RejectReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        distance: Option<f32>,
    },
}

impl VerificationOutcome {
    fn rejected(reason: RejectReason, distance: Option<f32>) -> Self {
        Self::Rejected { reason, distance }
    }

    fn status_line(&self) -> String {
        match self {
            Self::Success { .. } => "face enrolled successfully".to_string(),
            Self::Verified { .. } => "face verified".to_string(),
            Self::Rejected { reason, distance } => match reason {
                RejectReason::NoFace => "no face detected, try again".to_string(),
                RejectReason::NoEnrollment => "no enrolled face found, enroll first".to_string(),
                RejectReason::Mismatch => format!(
                    "face not recognized (distance: {:.3})",
                    distance.unwrap_or(f32::INFINITY)
                ),
                RejectReason::Error => "face scan failed, try again".to_string(),
            },
        }
    }
}

/// Session snapshot for the collaborator UI.
#[derive(Debug, Serialize)]
pub struct GateStatus {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<GateMode>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

impl GateStatus {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            mode: None,
            status: "idle".to_string(),
            threshold: None,
        }
    }
}

struct GateSession {
    mode: GateMode,
    threshold: f32,
    state: SessionState,
    status: String,
}

impl GateSession {
    fn snapshot(&self) -> GateStatus {
        GateStatus {
            state: self.state,
            mode: Some(self.mode),
            status: self.status.clone(),
            threshold: Some(self.threshold),
        }
    }
}

pub struct VerificationGate {
    engine: Arc<SignatureEngine>,
    store: Arc<dyn DescriptorStore>,
    capture: Arc<dyn CaptureSource>,
    session: Mutex<Option<GateSession>>,
}

impl VerificationGate {
    pub fn new(
        engine: Arc<SignatureEngine>,
        store: Arc<dyn DescriptorStore>,
        capture: Arc<dyn CaptureSource>,
    ) -> Self {
        Self {
            engine,
            store,
            capture,
            session: Mutex::new(None),
        }
    }

    /// Start a session. Model-load failure is the one blocking condition
    /// escalated to the caller; no session is left behind in that case.
    pub async fn open(&self, mode: GateMode, threshold: Option<f32>) -> Result<GateStatus, GateError> {
        {
            let mut guard = self.session.lock().await;
            if guard.is_some() {
                return Err(GateError::SessionAlreadyOpen);
            }
            *guard = Some(GateSession {
                mode,
                threshold: threshold.unwrap_or(DEFAULT_THRESHOLD),
                state: SessionState::Initializing,
                status: "initializing camera and models".to_string(),
            });
        }
        info!("gate session opening: mode={:?}", mode);

        if let Err(err) = self.engine.initialize().await {
            warn!("face model load error: {}", err);
            self.session.lock().await.take();
            return Err(err);
        }
        if let Err(err) = self.capture.open().await {
            self.session.lock().await.take();
            return Err(err);
        }

        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) => {
                session.state = SessionState::Ready;
                session.status = "ready, align your face and scan".to_string();
                Ok(session.snapshot())
            }
            // Closed while initializing (cooperative cancellation).
            None => {
                self.capture.close().await;
                Err(GateError::NoSession)
            }
        }
    }

    /// One capture-compare-report cycle. Every per-attempt failure is
    /// recovered into a `Rejected` outcome; the session ends the attempt
    /// back at `Ready` with no lockout, so the caller may retry or close.
    pub async fn capture_and_evaluate(&self) -> Result<VerificationOutcome, GateError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(GateError::NoSession)?;
        if session.state == SessionState::Initializing {
            return Err(GateError::NotReady);
        }
        session.state = SessionState::Capturing;
        session.status = "scanning".to_string();
        let mode = session.mode;
        let threshold = session.threshold;

        let outcome = self.run_attempt(mode, threshold).await;

        session.state = SessionState::Ready;
        session.status = outcome.status_line();
        Ok(outcome)
    }

    async fn run_attempt(&self, mode: GateMode, threshold: f32) -> VerificationOutcome {
        let frame = match self.capture.grab().await {
            Ok(frame) => frame,
            Err(err) => {
                warn!("frame capture failed: {}", err);
                return VerificationOutcome::rejected(RejectReason::Error, None);
            }
        };

        let descriptor = match self.engine.extract(&frame).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return VerificationOutcome::rejected(RejectReason::NoFace, None),
            Err(err) => {
                warn!("signature extraction failed: {}", err);
                return VerificationOutcome::rejected(RejectReason::Error, None);
            }
        };

        match mode {
            GateMode::Enroll => match self.store.save(&descriptor).await {
                Ok(()) => {
                    info!("enrollment record saved");
                    VerificationOutcome::Success { descriptor }
                }
                Err(err) => {
                    warn!("enrollment record write failed: {}", err);
                    VerificationOutcome::rejected(RejectReason::Error, None)
                }
            },
            GateMode::Verify => {
                let stored = match self.store.load().await {
                    Ok(Some(stored)) => stored,
                    Ok(None) => {
                        return VerificationOutcome::rejected(RejectReason::NoEnrollment, None)
                    }
                    Err(err) => {
                        warn!("enrollment record read failed: {}", err);
                        return VerificationOutcome::rejected(RejectReason::Error, None);
                    }
                };
                let distance = euclidean_distance(&descriptor, &stored);
                if distance <= threshold {
                    info!("face verified: distance={:.3}", distance);
                    VerificationOutcome::Verified { distance }
                } else {
                    VerificationOutcome::rejected(RejectReason::Mismatch, Some(distance))
                }
            }
        }
    }

    /// Discard the session. Idempotent, callable from any state, releases
    /// the capture source unconditionally, never touches the enrollment
    /// record.
    pub async fn close(&self) {
        let closed = self.session.lock().await.take().is_some();
        self.capture.close().await;
        if closed {
            info!("gate session closed");
        }
    }

    pub async fn status(&self) -> GateStatus {
        match self.session.lock().await.as_ref() {
            Some(session) => session.snapshot(),
            None => GateStatus::idle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, FrameSlot};
    use crate::signature::SignatureBackend;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct MockBackend {
        descriptor: StdMutex<Option<Descriptor>>,
    }

    impl MockBackend {
        fn returning(descriptor: Option<Descriptor>) -> Arc<Self> {
            Arc::new(Self {
                descriptor: StdMutex::new(descriptor),
            })
        }

        fn set(&self, descriptor: Option<Descriptor>) {
            *self.descriptor.lock().expect("mock poisoned") = descriptor;
        }
    }

    #[async_trait]
    impl SignatureBackend for MockBackend {
        async fn initialize(&self) -> Result<(), GateError> {
            Ok(())
        }

        fn is_initialized(&self) -> bool {
            true
        }

        async fn extract(&self, _frame: &Frame) -> Result<Option<Descriptor>, GateError> {
            Ok(self.descriptor.lock().expect("mock poisoned").clone())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl SignatureBackend for FailingBackend {
        async fn initialize(&self) -> Result<(), GateError> {
            Err(GateError::ModelLoad("assets unreachable".to_string()))
        }

        fn is_initialized(&self) -> bool {
            false
        }

        async fn extract(&self, _frame: &Frame) -> Result<Option<Descriptor>, GateError> {
            Err(GateError::ModelLoad("backend not initialized".to_string()))
        }
    }

    struct MemoryStore {
        record: Mutex<Option<Descriptor>>,
    }

    impl MemoryStore {
        fn empty() -> Arc<Self> {
            Arc::new(Self {
                record: Mutex::new(None),
            })
        }

        fn with(descriptor: Descriptor) -> Arc<Self> {
            Arc::new(Self {
                record: Mutex::new(Some(descriptor)),
            })
        }

        async fn current(&self) -> Option<Descriptor> {
            self.record.lock().await.clone()
        }
    }

    #[async_trait]
    impl DescriptorStore for MemoryStore {
        async fn save(&self, descriptor: &Descriptor) -> Result<(), GateError> {
            *self.record.lock().await = Some(descriptor.clone());
            Ok(())
        }

        async fn load(&self) -> Result<Option<Descriptor>, GateError> {
            Ok(self.record.lock().await.clone())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl DescriptorStore for FailingStore {
        async fn save(&self, _descriptor: &Descriptor) -> Result<(), GateError> {
            Err(GateError::Persistence("quota exceeded".to_string()))
        }

        async fn load(&self) -> Result<Option<Descriptor>, GateError> {
            Err(GateError::Persistence("storage unavailable".to_string()))
        }
    }

    fn rig(
        backend: Arc<dyn SignatureBackend>,
        store: Arc<dyn DescriptorStore>,
    ) -> (VerificationGate, Arc<FrameSlot>) {
        let frames = Arc::new(FrameSlot::new());
        let engine = Arc::new(SignatureEngine::new(backend));
        let gate = VerificationGate::new(engine, store, frames.clone());
        (gate, frames)
    }

    fn frame() -> Frame {
        Frame::new(4, 4, vec![128; 16]).expect("valid frame")
    }

    fn zeros() -> Descriptor {
        Descriptor::new(vec![0.0; 128])
    }

    fn zeros_with(index: usize, value: f32) -> Descriptor {
        let mut values = vec![0.0f32; 128];
        values[index] = value;
        Descriptor::new(values)
    }

    #[tokio::test]
    async fn enroll_persists_descriptor_and_reports_success() {
        let store = MemoryStore::empty();
        let (gate, frames) = rig(MockBackend::returning(Some(zeros())), store.clone());
        gate.open(GateMode::Enroll, None).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(
            outcome,
            VerificationOutcome::Success {
                descriptor: zeros()
            }
        );
        assert_eq!(store.current().await, Some(zeros()));
    }

    #[tokio::test]
    async fn re_enrolling_overwrites_the_previous_record() {
        let store = MemoryStore::empty();
        let backend = MockBackend::returning(Some(zeros_with(0, 1.0)));
        let (gate, frames) = rig(backend.clone(), store.clone());
        gate.open(GateMode::Enroll, None).await.expect("open");
        frames.submit(frame()).await;
        gate.capture_and_evaluate().await.expect("first enroll");
        backend.set(Some(zeros_with(1, 2.0)));
        frames.submit(frame()).await;
        gate.capture_and_evaluate().await.expect("second enroll");
        assert_eq!(store.current().await, Some(zeros_with(1, 2.0)));
    }

    #[tokio::test]
    async fn verify_without_enrollment_is_rejected() {
        let (gate, frames) = rig(MockBackend::returning(Some(zeros())), MemoryStore::empty());
        gate.open(GateMode::Verify, None).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected {
                reason: RejectReason::NoEnrollment,
                distance: None
            }
        );
    }

    #[tokio::test]
    async fn identical_descriptors_verify_at_any_threshold() {
        let (gate, frames) = rig(
            MockBackend::returning(Some(zeros())),
            MemoryStore::with(zeros()),
        );
        gate.open(GateMode::Verify, Some(0.0)).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(outcome, VerificationOutcome::Verified { distance: 0.0 });
    }

    #[tokio::test]
    async fn threshold_boundary_is_inclusive() {
        let (gate, frames) = rig(
            MockBackend::returning(Some(zeros_with(0, 0.5))),
            MemoryStore::with(zeros()),
        );
        gate.open(GateMode::Verify, Some(0.5)).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(outcome, VerificationOutcome::Verified { distance: 0.5 });
    }

    #[tokio::test]
    async fn near_match_verifies_and_far_match_is_rejected() {
        let store = MemoryStore::with(zeros());
        let backend = MockBackend::returning(Some(zeros_with(0, 0.4)));
        let (gate, frames) = rig(backend.clone(), store);
        gate.open(GateMode::Verify, Some(0.5)).await.expect("open");

        frames.submit(frame()).await;
        match gate.capture_and_evaluate().await.expect("attempt") {
            VerificationOutcome::Verified { distance } => assert!((distance - 0.4).abs() < 1e-6),
            other => panic!("expected verified, got {:?}", other),
        }

        backend.set(Some(zeros_with(0, 0.6)));
        frames.submit(frame()).await;
        match gate.capture_and_evaluate().await.expect("attempt") {
            VerificationOutcome::Rejected {
                reason: RejectReason::Mismatch,
                distance: Some(distance),
            } => assert!((distance - 0.6).abs() < 1e-6),
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn mismatched_descriptor_lengths_never_verify() {
        let (gate, frames) = rig(
            MockBackend::returning(Some(Descriptor::new(vec![0.0; 64]))),
            MemoryStore::with(zeros()),
        );
        gate.open(GateMode::Verify, Some(1e9)).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected {
                reason: RejectReason::Mismatch,
                distance: Some(f32::INFINITY)
            }
        );
    }

    #[tokio::test]
    async fn no_face_never_touches_the_record_even_in_enroll_mode() {
        let store = MemoryStore::empty();
        let (gate, frames) = rig(MockBackend::returning(None), store.clone());
        gate.open(GateMode::Enroll, None).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected {
                reason: RejectReason::NoFace,
                distance: None
            }
        );
        assert_eq!(store.current().await, None);
    }

    #[tokio::test]
    async fn missing_frame_is_rejected_as_error() {
        let (gate, _frames) = rig(MockBackend::returning(Some(zeros())), MemoryStore::empty());
        gate.open(GateMode::Verify, None).await.expect("open");
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected {
                reason: RejectReason::Error,
                distance: None
            }
        );
    }

    #[tokio::test]
    async fn failed_persist_is_never_reported_as_success() {
        let (gate, frames) = rig(
            MockBackend::returning(Some(zeros())),
            Arc::new(FailingStore),
        );
        gate.open(GateMode::Enroll, None).await.expect("open");
        frames.submit(frame()).await;
        let outcome = gate.capture_and_evaluate().await.expect("attempt");
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected {
                reason: RejectReason::Error,
                distance: None
            }
        );
    }

    #[tokio::test]
    async fn reopening_an_open_session_is_refused() {
        let (gate, _frames) = rig(MockBackend::returning(Some(zeros())), MemoryStore::empty());
        gate.open(GateMode::Verify, None).await.expect("open");
        assert!(matches!(
            gate.open(GateMode::Enroll, None).await,
            Err(GateError::SessionAlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn model_load_failure_blocks_open_and_leaves_no_session() {
        let (gate, _frames) = rig(Arc::new(FailingBackend), MemoryStore::empty());
        assert!(matches!(
            gate.open(GateMode::Verify, None).await,
            Err(GateError::ModelLoad(_))
        ));
        assert_eq!(gate.status().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn close_is_idempotent_from_any_state() {
        let (gate, frames) = rig(MockBackend::returning(Some(zeros())), MemoryStore::empty());
        gate.close().await;
        gate.open(GateMode::Verify, None).await.expect("open");
        frames.submit(frame()).await;
        gate.close().await;
        gate.close().await;
        assert_eq!(gate.status().await.state, SessionState::Idle);
        assert!(matches!(
            gate.capture_and_evaluate().await,
            Err(GateError::NoSession)
        ));
        // the slot was released with the session
        assert!(matches!(frames.grab().await, Err(GateError::Capture(_))));
    }

    #[tokio::test]
    async fn close_never_touches_the_enrollment_record() {
        let store = MemoryStore::with(zeros());
        let (gate, _frames) = rig(MockBackend::returning(Some(zeros())), store.clone());
        gate.open(GateMode::Verify, None).await.expect("open");
        gate.close().await;
        assert_eq!(store.current().await, Some(zeros()));
    }

    #[tokio::test]
    async fn session_can_be_reopened_after_close() {
        let (gate, frames) = rig(MockBackend::returning(Some(zeros())), MemoryStore::empty());
        gate.open(GateMode::Enroll, None).await.expect("open");
        gate.close().await;
        let status = gate.open(GateMode::Verify, Some(0.6)).await.expect("reopen");
        assert_eq!(status.state, SessionState::Ready);
        assert_eq!(status.mode, Some(GateMode::Verify));
        assert_eq!(status.threshold, Some(0.6));
        frames.submit(frame()).await;
        gate.capture_and_evaluate().await.expect("attempt runs");
    }

    #[tokio::test]
    async fn status_reports_idle_without_a_session() {
        let (gate, _frames) = rig(MockBackend::returning(Some(zeros())), MemoryStore::empty());
        let status = gate.status().await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.mode, None);
    }
}
