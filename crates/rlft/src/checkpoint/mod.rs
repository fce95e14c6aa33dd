//! Time-triggered checkpointing of trainable weights.
//!
//! Provides:
//! - `Persist` for artifacts that can write themselves into a directory
//! - `ArtifactStore` / `FsStore` for durable writes and freshness probes
//! - `Clock` / `SystemClock` / `ManualClock` for wall-clock time
//! - `CheckpointScheduler`, the Idle/Armed save state machine

mod scheduler;
mod store;

pub use scheduler::{elapsed_since_last_save, CheckpointScheduler, SaveMode, SaveState};
pub use store::{
    ArtifactStore, Clock, FsStore, ManualClock, Persist, SystemClock, TrainerState,
    TRAINER_STATE_FILE,
};
