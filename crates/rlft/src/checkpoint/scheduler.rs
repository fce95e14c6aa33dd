//! Wall-clock checkpoint scheduler.

use super::store::{ArtifactStore, Persist, TrainerState};
use crate::config::GrpoConfig;
use crate::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Which weights are persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveMode {
    /// Full model weights in the output root
    Full,
    /// Adapter weights only, in `<output>/lora`
    Adapter,
}

impl SaveMode {
    /// Directory the weights are written into.
    pub fn weights_dir(self, output_dir: &Path) -> PathBuf {
        match self {
            Self::Full => output_dir.to_path_buf(),
            Self::Adapter => output_dir.join("lora"),
        }
    }

    /// Artifact whose modification time marks the last save.
    pub fn probe_path(self, output_dir: &Path) -> PathBuf {
        match self {
            Self::Full => output_dir.join("config.json"),
            Self::Adapter => output_dir.join("lora").join("adapter_config.json"),
        }
    }
}

/// Scheduler state. Moves from `Idle` to `Armed` exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveState {
    /// No save has happened in this process
    Idle,
    /// At least one save has happened; freshness comes from disk
    Armed,
}

/// Time since the artifact at `probe` was last modified.
///
/// An absent artifact counts as modified at the UNIX epoch. Modification times
/// in the future give a zero duration.
pub fn elapsed_since_last_save(
    store: &dyn ArtifactStore,
    probe: &Path,
    now: SystemTime,
) -> Result<Duration> {
    let last = store.modified_time(probe)?.unwrap_or(UNIX_EPOCH);
    Ok(now.duration_since(last).unwrap_or_default())
}

/// Decides, once per training step, whether the trainable weights should be
/// persisted.
///
/// The first save happens once the time since the first step exceeds the
/// interval. Every later save happens once the time since the probe
/// artifact's modification time exceeds the interval, so a restarted or
/// externally cleaned output directory is picked up without in-memory state.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = CheckpointScheduler::new("out", Duration::from_secs(600), SaveMode::Adapter);
///
/// // Every step:
/// if scheduler.step(clock.now(), &FsStore, &model, &tokenizer, collective.is_primary())? {
///     tracing::info!("Checkpoint written");
/// }
/// ```
#[derive(Clone, Debug)]
pub struct CheckpointScheduler {
    output_dir: PathBuf,
    interval: Duration,
    mode: SaveMode,
    start_train_time: Option<SystemTime>,
    state: SaveState,
    save_count: u64,
}

impl CheckpointScheduler {
    pub fn new(output_dir: impl Into<PathBuf>, interval: Duration, mode: SaveMode) -> Self {
        Self {
            output_dir: output_dir.into(),
            interval,
            mode,
            start_train_time: None,
            state: SaveState::Idle,
            save_count: 0,
        }
    }

    pub fn from_config(config: &GrpoConfig) -> Self {
        let mode = if config.use_adapter {
            SaveMode::Adapter
        } else {
            SaveMode::Full
        };
        Self::new(&config.output_dir, config.save_interval(), mode)
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn mode(&self) -> SaveMode {
        self.mode
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn start_train_time(&self) -> Option<SystemTime> {
        self.start_train_time
    }

    /// Saves performed by this scheduler.
    pub fn save_count(&self) -> u64 {
        self.save_count
    }

    pub fn probe_path(&self) -> PathBuf {
        self.mode.probe_path(&self.output_dir)
    }

    pub fn weights_dir(&self) -> PathBuf {
        self.mode.weights_dir(&self.output_dir)
    }

    /// Whether a save is due at `now`. Records the start time on first call.
    pub fn is_due(&mut self, now: SystemTime, store: &dyn ArtifactStore) -> Result<bool> {
        let start = *self.start_train_time.get_or_insert(now);
        let elapsed = match self.state {
            SaveState::Idle => now.duration_since(start).unwrap_or_default(),
            SaveState::Armed => elapsed_since_last_save(store, &self.probe_path(), now)?,
        };
        Ok(elapsed > self.interval)
    }

    /// Run one scheduling decision and save if due. Returns whether a save
    /// was due, which is the same answer on every worker.
    ///
    /// Only the primary worker writes; other workers follow the same state
    /// transitions without touching the store, so `true` on a non-primary
    /// worker means nothing was written there.
    pub fn step(
        &mut self,
        now: SystemTime,
        store: &dyn ArtifactStore,
        weights: &dyn Persist,
        tokenizer: &dyn Persist,
        is_primary: bool,
    ) -> Result<bool> {
        if !self.is_due(now, store)? {
            tracing::trace!(state = ?self.state, "Checkpoint not due");
            return Ok(false);
        }
        self.save(now, store, weights, tokenizer, is_primary)?;
        Ok(true)
    }

    /// Persist weights, tokenizer and trainer state unconditionally.
    ///
    /// A failed write is returned as-is and leaves the state unchanged.
    pub fn save(
        &mut self,
        now: SystemTime,
        store: &dyn ArtifactStore,
        weights: &dyn Persist,
        tokenizer: &dyn Persist,
        is_primary: bool,
    ) -> Result<()> {
        let start = *self.start_train_time.get_or_insert(now);
        let elapsed = now.duration_since(start).unwrap_or_default();

        if is_primary {
            let weights_dir = self.weights_dir();
            store.save(&weights_dir, weights)?;
            store.save(&self.output_dir, tokenizer)?;
            let record = TrainerState::new(self.save_count + 1, elapsed, now);
            store.save(&self.output_dir, &record)?;
            tracing::info!(
                path = %weights_dir.display(),
                mode = ?self.mode,
                elapsed = ?elapsed,
                "Saved checkpoint"
            );
        } else {
            tracing::debug!("Checkpoint due; skipping write on non-primary worker");
        }

        self.save_count += 1;
        self.state = SaveState::Armed;
        Ok(())
    }
}
