/**
 * Server configuration
 * Everything comes from FACEGATE_* environment variables with local-dev
 * defaults.
 */

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub models_dir: PathBuf,
    pub store_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr =
            std::env::var("FACEGATE_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let models_dir = std::env::var("FACEGATE_MODELS_DIR")
            .unwrap_or_else(|_| "models".to_string())
            .into();
        let store_dir = std::env::var("FACEGATE_STORE_DIR")
            .unwrap_or_else(|_| "data".to_string())
            .into();
        Self {
            listen_addr,
            models_dir,
            store_dir,
        }
    }
}
