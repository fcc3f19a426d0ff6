//! Scaler checkpoint save/load for training resumption.
//!
//! A checkpoint directory holds `scaler_state.json`: the step counter, the
//! scaler snapshot (absent when the run trained without scaling), and free
//! form metadata. Model and optimizer tensors live elsewhere.

use crate::error::{Error, Result};
use crate::scaler::ScalerState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// File name inside the checkpoint directory.
pub const SCALER_STATE_FILE: &str = "scaler_state.json";

fn default_version() -> u32 {
    1
}

/// Scaler metadata saved alongside model/optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerCheckpoint {
    /// Checkpoint format version. Defaults to 1 when the field is missing.
    #[serde(default = "default_version")]
    pub version: u32,
    pub step: u64,
    /// `None` when the run trained with scaling disabled
    #[serde(default)]
    pub scaler: Option<ScalerState>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ScalerCheckpoint {
    pub fn new(step: u64, scaler: Option<ScalerState>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            step,
            scaler,
            metadata: HashMap::new(),
        }
    }
}

/// Save a checkpoint to `{dir}/scaler_state.json`, creating `dir` if needed.
pub fn save_checkpoint<P: AsRef<Path>>(dir: P, checkpoint: &ScalerCheckpoint) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(|e| Error::CheckpointError {
        reason: format!("failed to create checkpoint dir: {e}"),
    })?;

    // Always write current version
    let mut checkpoint = checkpoint.clone();
    checkpoint.version = CHECKPOINT_VERSION;
    let json = serde_json::to_string_pretty(&checkpoint).map_err(|e| Error::CheckpointError {
        reason: format!("failed to serialize scaler state: {e}"),
    })?;
    let path = dir.join(SCALER_STATE_FILE);
    std::fs::write(&path, json).map_err(|e| Error::CheckpointError {
        reason: format!("failed to write scaler state: {e}"),
    })?;

    tracing::info!(
        path = %path.display(),
        step = checkpoint.step,
        scale = checkpoint.scaler.map(|s| s.scale),
        "saved scaler checkpoint"
    );
    Ok(())
}

/// Load a checkpoint from `{dir}/scaler_state.json`.
///
/// The scaler record is parsed but not validated here; validation happens
/// when it is loaded into a [`GradScaler`](crate::scaler::GradScaler).
pub fn load_checkpoint<P: AsRef<Path>>(dir: P) -> Result<ScalerCheckpoint> {
    let path = dir.as_ref().join(SCALER_STATE_FILE);
    let json = std::fs::read_to_string(&path).map_err(|e| Error::CheckpointError {
        reason: format!("failed to read scaler state: {e}"),
    })?;
    serde_json::from_str(&json).map_err(|e| Error::CheckpointError {
        reason: format!("failed to parse scaler state: {e}"),
    })
}
