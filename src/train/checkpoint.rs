//! Checkpoint persistence
//!
//! A checkpoint is a directory holding every network parameter
//! (`params.safetensors`) next to the running statistics and counters
//! (`state.json`). Both files are written into a sibling temporary directory
//! that is renamed into place, so a crash never leaves a half-written
//! checkpoint under the target name.
//!
//! Replacing an existing checkpoint takes two renames: the current one moves
//! aside to `<name>.old`, then the staged one takes its name. A crash between
//! the two leaves only `<name>.old`, which [`load`] falls back to.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tch::nn;
use tracing::{info, warn};

use super::ppo::config::TrainConfig;
use crate::buffer::rollout::EpisodeStats;
use crate::utils::normalize::{RewardForwardFilter, RunningMeanStd};

pub const PARAMS_FILE: &str = "params.safetensors";
pub const STATE_FILE: &str = "state.json";
const FORMAT_VERSION: u32 = 1;

/// Everything besides network parameters that a resumed run needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub config: TrainConfig,
    pub n_updates: usize,
    pub episode_stats: Option<EpisodeStats>,
    pub obs_rms: RunningMeanStd,
    pub int_rms: RunningMeanStd,
    pub ext_rms: RunningMeanStd,
    pub int_rff: RewardForwardFilter,
    pub ext_rff: RewardForwardFilter,
}

impl CheckpointState {
    /// Current format version
    pub fn format_version() -> u32 {
        FORMAT_VERSION
    }
}

fn sibling(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .with_context(|| format!("checkpoint path {} has no final component", dir.display()))?;
    let mut sibling = name.to_os_string();
    sibling.push(suffix);
    Ok(dir.with_file_name(sibling))
}

fn staging_dir(dir: &Path) -> Result<PathBuf> {
    sibling(dir, &format!(".tmp-{}", std::process::id()))
}

fn previous_dir(dir: &Path) -> Result<PathBuf> {
    sibling(dir, ".old")
}

/// Write parameters and state to `dir`, replacing any previous checkpoint
pub fn save(dir: &Path, vs: &nn::VarStore, state: &CheckpointState) -> Result<()> {
    let staged = staging_dir(dir)?;
    if staged.exists() {
        fs::remove_dir_all(&staged)?;
    }
    fs::create_dir_all(&staged)
        .with_context(|| format!("creating checkpoint directory {}", staged.display()))?;

    vs.save(staged.join(PARAMS_FILE))?;
    let file = File::create(staged.join(STATE_FILE))?;
    serde_json::to_writer_pretty(BufWriter::new(file), state)?;

    let previous = previous_dir(dir)?;
    if dir.exists() {
        if previous.exists() {
            fs::remove_dir_all(&previous)?;
        }
        fs::rename(dir, &previous)?;
    }
    fs::rename(&staged, dir)
        .with_context(|| format!("moving checkpoint into {}", dir.display()))?;
    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }

    info!(path = %dir.display(), n_updates = state.n_updates, "saved checkpoint");
    Ok(())
}

/// Load parameters into `vs` and return the saved state
///
/// Reads `<dir>.old` when `dir` holds no checkpoint but an interrupted save
/// left the previous one there.
pub fn load(dir: &Path, vs: &mut nn::VarStore) -> Result<CheckpointState> {
    let previous = previous_dir(dir)?;
    let dir = if !dir.join(STATE_FILE).exists() && previous.join(STATE_FILE).exists() {
        warn!(path = %previous.display(), "resuming from checkpoint left by an interrupted save");
        previous.as_path()
    } else {
        dir
    };

    let state_path = dir.join(STATE_FILE);
    let file = File::open(&state_path)
        .with_context(|| format!("opening checkpoint state {}", state_path.display()))?;
    let state: CheckpointState = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing checkpoint state {}", state_path.display()))?;
    if state.version != FORMAT_VERSION {
        bail!(
            "checkpoint {} has format version {}, expected {}",
            dir.display(),
            state.version,
            FORMAT_VERSION
        );
    }

    vs.load(dir.join(PARAMS_FILE))
        .with_context(|| format!("loading parameters from {}", dir.display()))?;

    info!(path = %dir.display(), n_updates = state.n_updates, "loaded checkpoint");
    Ok(state)
}
