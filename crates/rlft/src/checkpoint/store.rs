//! Artifact persistence and clock abstractions.

use crate::{Result, RlftError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File written next to every checkpoint describing the save.
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Trait for artifacts that can be written into a directory.
///
/// Implement this for weights, adapters and tokenizers so the checkpoint
/// scheduler can persist them.
///
/// # Example
///
/// ```ignore
/// impl Persist for MyModel {
///     fn persist(&self, dir: &Path) -> std::io::Result<()> {
///         std::fs::write(dir.join("config.json"), self.config_json())?;
///         self.var_store.save(dir.join("model.safetensors")).map_err(std::io::Error::other)
///     }
/// }
/// ```
pub trait Persist {
    /// Write this artifact's files into `dir`, which already exists.
    fn persist(&self, dir: &Path) -> io::Result<()>;
}

/// Durable storage for checkpoint artifacts.
pub trait ArtifactStore {
    /// Create `dir` if needed and persist `artifact` into it.
    fn save(&self, dir: &Path, artifact: &dyn Persist) -> Result<()>;

    /// Last modification time of `path`, `None` if it does not exist.
    fn modified_time(&self, path: &Path) -> Result<Option<SystemTime>>;

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.modified_time(path)?.is_some())
    }
}

/// Local filesystem store.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStore;

impl ArtifactStore for FsStore {
    fn save(&self, dir: &Path, artifact: &dyn Persist) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| RlftError::persistence(dir, e))?;
        artifact
            .persist(dir)
            .map_err(|e| RlftError::persistence(dir, e))
    }

    fn modified_time(&self, path: &Path) -> Result<Option<SystemTime>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Source of wall-clock time.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Clock reading `secs` seconds after the UNIX epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn set(&self, now: SystemTime) {
        *self.lock() = now;
    }

    pub fn set_secs(&self, secs: u64) {
        self.set(UNIX_EPOCH + Duration::from_secs(secs));
    }

    pub fn advance(&self, by: Duration) {
        *self.lock() += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SystemTime> {
        // A poisoned clock still holds a valid time.
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.lock()
    }
}

/// Record of a checkpoint save.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrainerState {
    /// Number of saves performed by this process, including this one
    pub save_count: u64,
    /// Seconds since the first loss computation
    pub elapsed_secs: f64,
    /// UNIX seconds when the save happened
    pub timestamp: u64,
    /// rlft version
    pub version: String,
}

impl TrainerState {
    pub fn new(save_count: u64, elapsed: Duration, now: SystemTime) -> Self {
        Self {
            save_count,
            elapsed_secs: elapsed.as_secs_f64(),
            timestamp: now
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Read a previously written state file.
    pub fn load(dir: &Path) -> Result<Self> {
        let file = fs::File::open(dir.join(TRAINER_STATE_FILE))?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }
}

impl Persist for TrainerState {
    fn persist(&self, dir: &Path) -> io::Result<()> {
        let file = fs::File::create(dir.join(TRAINER_STATE_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct MockArtifact {
        name: &'static str,
        data: Vec<u8>,
    }

    impl Persist for MockArtifact {
        fn persist(&self, dir: &Path) -> io::Result<()> {
            fs::write(dir.join(self.name), &self.data)
        }
    }

    #[test]
    fn test_fs_store_creates_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("lora");
        let artifact = MockArtifact {
            name: "adapter_config.json",
            data: b"{}".to_vec(),
        };

        FsStore.save(&target, &artifact).unwrap();

        let probe = target.join("adapter_config.json");
        assert!(FsStore.exists(&probe).unwrap());
        assert!(FsStore.modified_time(&probe).unwrap().is_some());
    }

    #[test]
    fn test_fs_store_absent_path_has_no_mtime() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("config.json");
        assert_eq!(FsStore.modified_time(&missing).unwrap(), None);
        assert!(!FsStore.exists(&missing).unwrap());
    }

    #[test]
    fn test_fs_store_failure_is_persistence_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let target = blocker.join("out");

        let artifact = MockArtifact {
            name: "config.json",
            data: vec![],
        };
        let err = FsStore.save(&target, &artifact).unwrap_err();
        match err {
            RlftError::Persistence { path, .. } => assert_eq!(path, target),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_manual_clock_is_shared_between_clones() {
        let clock = ManualClock::at_secs(5);
        let other = clock.clone();
        clock.advance(Duration::from_secs(3));
        assert_eq!(other.now(), UNIX_EPOCH + Duration::from_secs(8));
        other.set_secs(1);
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(1));
    }

    #[test]
    fn test_trainer_state_round_trip_on_disk() {
        let dir = tempdir().unwrap();
        let state = TrainerState::new(
            2,
            Duration::from_millis(1500),
            UNIX_EPOCH + Duration::from_secs(42),
        );
        FsStore.save(dir.path(), &state).unwrap();

        let restored = TrainerState::load(dir.path()).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.timestamp, 42);
        assert_eq!(restored.elapsed_secs, 1.5);
        assert_eq!(restored.version, crate::VERSION);
    }
}
