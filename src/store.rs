/**
 * Enrollment record store
 * A single named entry in a durable key-value layout: one JSON array of
 * numbers on disk. Enrolling again overwrites the previous record; there
 * is no multi-template support and no schema-version field yet.
 */

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use crate::error::GateError;
use crate::signature::Descriptor;

/// Key the single enrollment record lives under.
pub const ENROLLMENT_KEY: &str = "face_descriptor";

#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Persist the descriptor as the enrollment record, overwriting any
    /// prior one. A failed write must never be reported as success.
    async fn save(&self, descriptor: &Descriptor) -> Result<(), GateError>;

    /// Load the enrollment record, `None` if nothing was ever enrolled.
    async fn load(&self) -> Result<Option<Descriptor>, GateError>;
}

/// File-backed store: `<root>/face_descriptor.json` holding the textual
/// array-of-numbers encoding. Writes go through a temp file and rename so
/// a crashed write cannot leave a truncated record.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn entry_path(&self) -> PathBuf {
        self.root.join(format!("{}.json", ENROLLMENT_KEY))
    }
}

#[async_trait]
impl DescriptorStore for FileStore {
    async fn save(&self, descriptor: &Descriptor) -> Result<(), GateError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| GateError::Persistence(err.to_string()))?;
        let bytes = serde_json::to_vec(descriptor)
            .map_err(|err| GateError::Persistence(err.to_string()))?;
        let tmp = self.root.join(format!("{}.json.tmp", ENROLLMENT_KEY));
        fs::write(&tmp, &bytes)
            .await
            .map_err(|err| GateError::Persistence(err.to_string()))?;
        fs::rename(&tmp, self.entry_path())
            .await
            .map_err(|err| GateError::Persistence(err.to_string()))?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Descriptor>, GateError> {
        let bytes = match fs::read(self.entry_path()).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(GateError::Persistence(err.to_string())),
        };
        match serde_json::from_slice::<Descriptor>(&bytes) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(err) => {
                // An unreadable record is treated as never enrolled.
                warn!("stored enrollment record is unreadable: {}", err);
                Ok(None)
            }
        }
    }
}
