//! Durable session state, per-session databases, and human checkpoints.

pub mod checkpoint;
pub mod db;
pub mod state;
pub mod store;

pub use checkpoint::{
    AudibleBoard, CheckpointError, CheckpointKind, CheckpointManager, CheckpointRecord,
    CheckpointResolution, CheckpointResponse, CheckpointStatus, NewCheckpoint,
};
pub use db::{SessionDb, SessionDbError};
pub use state::{BlockedKind, SessionFilter, SessionRecord, SessionStatus};
pub use store::{SessionError, SessionStore, StatusExtras};
