/**
 * Signature Engine
 * Turns one captured frame into at most one fixed-length descriptor.
 * The detection/recognition backend sits behind a capability trait so the
 * gate never depends on a concrete model stack; the shipped adapter loads
 * digest-verified linear detector/recognizer weights from a manifest.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::capture::Frame;
use crate::error::GateError;

/// Fixed-length numeric signature of one biometric sample. The length is
/// fixed by the backend (128 in the shipped model assets).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Euclidean distance between two descriptors. Mismatched lengths fail
/// closed: the result is infinite, which no finite threshold accepts.
pub fn euclidean_distance(a: &Descriptor, b: &Descriptor) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    let sum: f32 = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum();
    sum.sqrt()
}

#[async_trait]
pub trait SignatureBackend: Send + Sync {
    /// Idempotently load model assets. Fails with `ModelLoad` if they are
    /// unreachable or malformed; capture must not proceed after that.
    async fn initialize(&self) -> Result<(), GateError>;

    fn is_initialized(&self) -> bool;

    /// Run detection and, for the single most confident face, the
    /// recognition pass. `Ok(None)` means no face passed the confidence
    /// threshold: an expected outcome, not an error.
    async fn extract(&self, frame: &Frame) -> Result<Option<Descriptor>, GateError>;
}

/// Stateless wrapper the gate drives; pure function of the input frame
/// once the one-time backend load has happened.
pub struct SignatureEngine {
    backend: Arc<dyn SignatureBackend>,
}

impl SignatureEngine {
    pub fn new(backend: Arc<dyn SignatureBackend>) -> Self {
        Self { backend }
    }

    pub async fn initialize(&self) -> Result<(), GateError> {
        self.backend.initialize().await
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_initialized()
    }

    pub async fn extract(&self, frame: &Frame) -> Result<Option<Descriptor>, GateError> {
        if !self.is_ready() {
            return Err(GateError::ModelLoad("backend not initialized".to_string()));
        }
        self.backend.extract(frame).await
    }
}

/// Side length of the square feature patch fed to both models.
const PATCH: usize = 32;
const WINDOW_FEATURES: usize = PATCH * PATCH;

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Detection resolution the frame is resampled to.
    pub input_size: usize,
    /// Minimum window score for a face candidate.
    pub score_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: 256,
            score_threshold: 0.5,
        }
    }
}

#[derive(Deserialize)]
struct ModelManifest {
    detector: AssetEntry,
    recognizer: AssetEntry,
    descriptor_len: usize,
}

#[derive(Deserialize)]
struct AssetEntry {
    file: String,
    sha256: String,
}

struct ModelWeights {
    /// Unit-normalized window scorer, `WINDOW_FEATURES` long.
    detector: Vec<f32>,
    /// `descriptor_len` rows of `WINDOW_FEATURES` projection weights.
    recognizer: Vec<Vec<f32>>,
}

/// Concrete backend over manifest-described model assets. Detection is a
/// linear window scorer over the resampled frame; recognition projects
/// the best window's feature patch to the descriptor space.
pub struct ModelBackend {
    assets_dir: PathBuf,
    config: DetectorConfig,
    weights: OnceCell<ModelWeights>,
}

impl ModelBackend {
    pub fn new(assets_dir: PathBuf) -> Self {
        Self::with_config(assets_dir, DetectorConfig::default())
    }

    pub fn with_config(assets_dir: PathBuf, config: DetectorConfig) -> Self {
        Self {
            assets_dir,
            config,
            weights: OnceCell::new(),
        }
    }
}

#[async_trait]
impl SignatureBackend for ModelBackend {
    async fn initialize(&self) -> Result<(), GateError> {
        self.weights
            .get_or_try_init(|| load_weights(&self.assets_dir))
            .await
            .map(|_| ())
    }

    fn is_initialized(&self) -> bool {
        self.weights.get().is_some()
    }

    async fn extract(&self, frame: &Frame) -> Result<Option<Descriptor>, GateError> {
        let weights = self
            .weights
            .get()
            .ok_or_else(|| GateError::ModelLoad("backend not initialized".to_string()))?;

        let size = self.config.input_size;
        let luma: Vec<f32> = frame.data.iter().map(|&p| f32::from(p) / 255.0).collect();
        let input = box_resize(
            &luma,
            frame.width as usize,
            frame.height as usize,
            (0, 0, frame.width as usize, frame.height as usize),
            size,
        );

        // Fixed window sweep; only the highest-scoring face is kept
        // (single-user device assumption).
        let win = size / 2;
        let stride = size / 4;
        let mut best: Option<(f32, Vec<f32>)> = None;
        for y in (0..=size - win).step_by(stride) {
            for x in (0..=size - win).step_by(stride) {
                let feat = box_resize(&input, size, size, (x, y, win, win), PATCH);
                let norm = l2_norm(&feat);
                if norm <= f32::EPSILON {
                    continue;
                }
                let unit: Vec<f32> = feat.iter().map(|v| v / norm).collect();
                let score = dot(&unit, &weights.detector);
                if score >= self.config.score_threshold
                    && best.as_ref().map_or(true, |(s, _)| score > *s)
                {
                    best = Some((score, unit));
                }
            }
        }

        let Some((score, unit)) = best else {
            return Ok(None);
        };
        debug!("face detected: score={:.3}", score);

        let mut values: Vec<f32> = weights
            .recognizer
            .iter()
            .map(|row| dot(&unit, row))
            .collect();
        let norm = l2_norm(&values);
        if norm > f32::EPSILON {
            for v in &mut values {
                *v /= norm;
            }
        }
        Ok(Some(Descriptor::new(values)))
    }
}

async fn load_weights(dir: &Path) -> Result<ModelWeights, GateError> {
    let manifest_path = dir.join("manifest.json");
    let bytes = fs::read(&manifest_path)
        .await
        .map_err(|err| GateError::ModelLoad(format!("{}: {}", manifest_path.display(), err)))?;
    let manifest: ModelManifest = serde_json::from_slice(&bytes)
        .map_err(|err| GateError::ModelLoad(format!("malformed manifest: {}", err)))?;

    let detector_bytes = read_verified(dir, &manifest.detector).await?;
    let mut detector: Vec<f32> = serde_json::from_slice(&detector_bytes)
        .map_err(|err| GateError::ModelLoad(format!("malformed detector weights: {}", err)))?;
    if detector.len() != WINDOW_FEATURES {
        return Err(GateError::ModelLoad(format!(
            "detector has {} weights, expected {}",
            detector.len(),
            WINDOW_FEATURES
        )));
    }
    let norm = l2_norm(&detector);
    if norm <= f32::EPSILON {
        return Err(GateError::ModelLoad(
            "detector weights are all zero".to_string(),
        ));
    }
    for v in &mut detector {
        *v /= norm;
    }

    let recognizer_bytes = read_verified(dir, &manifest.recognizer).await?;
    let recognizer: Vec<Vec<f32>> = serde_json::from_slice(&recognizer_bytes)
        .map_err(|err| GateError::ModelLoad(format!("malformed recognizer weights: {}", err)))?;
    if recognizer.len() != manifest.descriptor_len {
        return Err(GateError::ModelLoad(format!(
            "recognizer has {} rows, manifest declares descriptor_len {}",
            recognizer.len(),
            manifest.descriptor_len
        )));
    }
    if let Some(row) = recognizer.iter().find(|row| row.len() != WINDOW_FEATURES) {
        return Err(GateError::ModelLoad(format!(
            "recognizer row has {} weights, expected {}",
            row.len(),
            WINDOW_FEATURES
        )));
    }

    Ok(ModelWeights {
        detector,
        recognizer,
    })
}

async fn read_verified(dir: &Path, asset: &AssetEntry) -> Result<Vec<u8>, GateError> {
    let path = dir.join(&asset.file);
    let bytes = fs::read(&path)
        .await
        .map_err(|err| GateError::ModelLoad(format!("{}: {}", path.display(), err)))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());
    if !digest.eq_ignore_ascii_case(&asset.sha256) {
        return Err(GateError::ModelLoad(format!(
            "digest mismatch for {}",
            asset.file
        )));
    }
    Ok(bytes)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Box-average the `rect` region of a `src_w` x `src_h` buffer down (or
/// up) to an `out` x `out` square. Each output cell averages at least one
/// source cell.
fn box_resize(
    src: &[f32],
    src_w: usize,
    src_h: usize,
    rect: (usize, usize, usize, usize),
    out: usize,
) -> Vec<f32> {
    let (rx, ry, rw, rh) = rect;
    let mut result = Vec::with_capacity(out * out);
    for oy in 0..out {
        let y0 = ry + rh * oy / out;
        let y1 = (ry + rh * (oy + 1) / out).max(y0 + 1).min(src_h.max(y0 + 1));
        for ox in 0..out {
            let x0 = rx + rw * ox / out;
            let x1 = (rx + rw * (ox + 1) / out).max(x0 + 1).min(src_w.max(x0 + 1));
            let mut sum = 0.0f32;
            let mut count = 0usize;
            for y in y0..y1 {
                for x in x0..x1 {
                    if y < src_h && x < src_w {
                        sum += src[y * src_w + x];
                        count += 1;
                    }
                }
            }
            if count > 0 {
                result.push(sum / count as f32);
            } else {
                result.push(0.0);
            }
        }
    }
    result
}
