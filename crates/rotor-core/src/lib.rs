//! Rotation core: Config, StateTracker, Queue, MemoryMonitor, Router and
//! Orchestrator — the pieces that decide *which* model is active and drive
//! it there, independent of any particular provider backend.

pub mod config;
pub mod memory;
pub mod orchestrator;
pub mod queue;
pub mod router;
pub mod state;

pub use config::{Config, QueuePolicy, RotationPolicy, Thresholds, ValidationReport};
pub use memory::{MemoryCheck, MemoryMonitor, MemoryStats, Trend};
pub use orchestrator::{
    HistoryEntry, MemoryStatsSnapshot, Orchestrator, OrchestratorStatus, RotationAction,
    RotationError, RotationErrorCode, RotationOutcome,
};
pub use queue::{EnqueueError, Priority, Queue, QueueStatus, RotationRequest};
pub use router::{Router, RouterError, RouterResult};
pub use state::{ModelMetadata, StateTracker};
