pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{SyncOptions, TargetConfig, TargetType, TaskConfig};
pub use crate::core::{
    ConflictPolicy, Operation, Reporter, SyncMode, SyncReport, Synchronizer, TracingReporter,
};
pub use crate::error::{SyncError, TargetError};
pub use crate::storage::{create_target, LocalTarget, RemoteTarget, Target};
